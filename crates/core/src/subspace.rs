//! Prefix-based key namespacing.

use crate::tuple::{self, Element, TupleError};

/// A key prefix owning everything packed under it.
///
/// Components never write outside their own subspace; cross-component
/// coordination happens only through committed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    /// Root subspace for a tuple-encoded path.
    pub fn new(elements: &[Element]) -> Self {
        Self {
            prefix: tuple::pack(elements),
        }
    }

    pub fn from_raw(prefix: Vec<u8>) -> Self {
        Self { prefix }
    }

    /// A child subspace underneath this one.
    pub fn subspace(&self, elements: &[Element]) -> Subspace {
        Subspace {
            prefix: self.pack(elements),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Pack a key inside this subspace.
    pub fn pack(&self, elements: &[Element]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&tuple::pack(elements));
        key
    }

    /// Pack a key containing exactly one incomplete versionstamp; the
    /// returned offset accounts for the subspace prefix.
    pub fn pack_with_versionstamp(
        &self,
        elements: &[Element],
    ) -> Result<(Vec<u8>, usize), TupleError> {
        let (tail, offset) = tuple::pack_with_versionstamp(elements)?;
        let mut key = self.prefix.clone();
        key.extend_from_slice(&tail);
        Ok((key, offset + self.prefix.len()))
    }

    /// Decode the part of `key` below this subspace's prefix.
    pub fn unpack(&self, key: &[u8]) -> Result<Vec<Element>, TupleError> {
        let tail = key
            .strip_prefix(self.prefix.as_slice())
            .ok_or(TupleError::OutsidePrefix)?;
        tuple::unpack(tail)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// The `[begin, end)` byte range covering every key in this subspace.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        (self.prefix.clone(), tuple::strinc(&self.prefix))
    }
}
