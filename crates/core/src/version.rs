//! Commit-ordered position tokens.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// Byte length of a versionstamp (10-byte commit order + 2-byte batch index).
pub const VERSIONSTAMP_LEN: usize = 12;

const COMMIT_LEN: usize = 10;
const INCOMPLETE_PREFIX: [u8; COMMIT_LEN] = [0xff; COMMIT_LEN];

/// A 12-byte position token assigned by the storage layer at commit time.
///
/// The first 10 bytes are the commit-order prefix, the last 2 bytes the
/// intra-commit batch index. Unsigned lexicographic byte order is total
/// order: later commits compare greater, and events appended in one batch
/// compare in their input order.
///
/// A versionstamp built with [`Versionstamp::incomplete`] carries an all-ones
/// commit prefix; the storage layer replaces it when the transaction commits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Versionstamp([u8; VERSIONSTAMP_LEN]);

/// Versionstamp parse/validation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionstampError {
    #[error("versionstamp must be {VERSIONSTAMP_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("versionstamp hex string is malformed")]
    InvalidHex,
}

impl Versionstamp {
    /// The smallest possible versionstamp (sorts before every committed one).
    pub const ZERO: Versionstamp = Versionstamp([0; VERSIONSTAMP_LEN]);

    pub fn from_bytes(bytes: [u8; VERSIONSTAMP_LEN]) -> Self {
        Self(bytes)
    }

    /// A placeholder stamp to be completed at commit, carrying only the
    /// intra-commit batch index.
    pub fn incomplete(batch_index: u16) -> Self {
        let mut bytes = [0xff; VERSIONSTAMP_LEN];
        bytes[COMMIT_LEN..].copy_from_slice(&batch_index.to_be_bytes());
        Self(bytes)
    }

    /// Whether the commit prefix has been filled in.
    pub fn is_complete(&self) -> bool {
        self.0[..COMMIT_LEN] != INCOMPLETE_PREFIX
    }

    /// Replace the commit prefix, keeping the batch index.
    pub fn completed(mut self, commit_order: [u8; COMMIT_LEN]) -> Self {
        self.0[..COMMIT_LEN].copy_from_slice(&commit_order);
        self
    }

    pub fn commit_order(&self) -> [u8; COMMIT_LEN] {
        let mut out = [0u8; COMMIT_LEN];
        out.copy_from_slice(&self.0[..COMMIT_LEN]);
        out
    }

    pub fn batch_index(&self) -> u16 {
        u16::from_be_bytes([self.0[COMMIT_LEN], self.0[COMMIT_LEN + 1]])
    }

    pub fn as_bytes(&self) -> &[u8; VERSIONSTAMP_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; VERSIONSTAMP_LEN] {
        self.0
    }
}

impl TryFrom<&[u8]> for Versionstamp {
    type Error = VersionstampError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; VERSIONSTAMP_LEN] = value
            .try_into()
            .map_err(|_| VersionstampError::InvalidLength(value.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Versionstamp({self})")
    }
}

impl FromStr for Versionstamp {
    type Err = VersionstampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != VERSIONSTAMP_LEN * 2 {
            return Err(VersionstampError::InvalidLength(s.len() / 2));
        }
        let mut bytes = [0u8; VERSIONSTAMP_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = core::str::from_utf8(chunk).map_err(|_| VersionstampError::InvalidHex)?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| VersionstampError::InvalidHex)?;
        }
        Ok(Self(bytes))
    }
}
