//! Order-preserving tuple encoding for keys.
//!
//! Keys are built from typed elements whose packed bytes compare the same way
//! the elements do. That property is what lets range scans over the indexes
//! iterate in position order without decoding anything but range edges.
//!
//! Supported element kinds: byte strings, UTF-8 strings, non-negative
//! integers, nested tuples, and versionstamps.

use thiserror::Error;

use crate::version::{Versionstamp, VERSIONSTAMP_LEN};

const BYTES: u8 = 0x01;
const STRING: u8 = 0x02;
const NESTED: u8 = 0x05;
const INT_ZERO: u8 = 0x14;
const VERSIONSTAMP: u8 = 0x33;

/// One element of a key tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Bytes(Vec<u8>),
    Str(String),
    Int(u64),
    Nested(Vec<Element>),
    Versionstamp(Versionstamp),
}

impl Element {
    pub fn str(s: impl Into<String>) -> Self {
        Element::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Element::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_versionstamp(&self) -> Option<&Versionstamp> {
        match self {
            Element::Versionstamp(vs) => Some(vs),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Element::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Tuple encode/decode failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TupleError {
    #[error("unexpected end of tuple data")]
    Truncated,

    #[error("unknown tuple type code {0:#04x}")]
    UnknownTypeCode(u8),

    #[error("tuple string element is not valid UTF-8")]
    Utf8,

    #[error("expected exactly one incomplete versionstamp, found {0}")]
    IncompleteVersionstamps(usize),

    #[error("key does not start with the subspace prefix")]
    OutsidePrefix,
}

/// Pack elements into a key. All versionstamps must be complete.
pub fn pack(elements: &[Element]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut offsets = Vec::new();
    for el in elements {
        encode_element(&mut buf, el, &mut offsets);
    }
    buf
}

/// Pack elements containing exactly one incomplete versionstamp.
///
/// Returns the packed key plus the byte offset of the 12-byte stamp slot, for
/// the storage layer to complete at commit.
pub fn pack_with_versionstamp(elements: &[Element]) -> Result<(Vec<u8>, usize), TupleError> {
    let mut buf = Vec::new();
    let mut offsets = Vec::new();
    for el in elements {
        encode_element(&mut buf, el, &mut offsets);
    }
    match offsets.as_slice() {
        [offset] => Ok((buf, *offset)),
        other => Err(TupleError::IncompleteVersionstamps(other.len())),
    }
}

/// Decode a packed key back into its elements.
pub fn unpack(bytes: &[u8]) -> Result<Vec<Element>, TupleError> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let (el, next) = decode_element(bytes, i)?;
        out.push(el);
        i = next;
    }
    Ok(out)
}

/// The first key strictly greater than every key starting with `prefix`.
///
/// Tuple-packed prefixes always contain a byte below 0xff (type codes and
/// terminators), so the trailing-0xff strip cannot consume the whole input.
pub fn strinc(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while matches!(out.last(), Some(0xff)) {
        out.pop();
    }
    match out.last_mut() {
        Some(last) => *last += 1,
        None => out.push(0xff),
    }
    out
}

/// The immediate successor of `key`: the smallest key sorting after it.
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0x00);
    out
}

fn encode_element(buf: &mut Vec<u8>, el: &Element, incomplete: &mut Vec<usize>) {
    match el {
        Element::Bytes(data) => {
            buf.push(BYTES);
            encode_escaped(buf, data);
        }
        Element::Str(s) => {
            buf.push(STRING);
            encode_escaped(buf, s.as_bytes());
        }
        Element::Int(v) => {
            let n = ((64 - v.leading_zeros() as usize) + 7) / 8;
            buf.push(INT_ZERO + n as u8);
            buf.extend_from_slice(&v.to_be_bytes()[8 - n..]);
        }
        Element::Nested(items) => {
            buf.push(NESTED);
            for item in items {
                encode_element(buf, item, incomplete);
            }
            buf.push(0x00);
        }
        Element::Versionstamp(vs) => {
            buf.push(VERSIONSTAMP);
            if !vs.is_complete() {
                incomplete.push(buf.len());
            }
            buf.extend_from_slice(vs.as_bytes());
        }
    }
}

fn encode_escaped(buf: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        buf.push(b);
        if b == 0x00 {
            buf.push(0xff);
        }
    }
    buf.push(0x00);
}

fn decode_element(bytes: &[u8], i: usize) -> Result<(Element, usize), TupleError> {
    let code = *bytes.get(i).ok_or(TupleError::Truncated)?;
    match code {
        BYTES => {
            let (data, next) = decode_escaped(bytes, i + 1)?;
            Ok((Element::Bytes(data), next))
        }
        STRING => {
            let (data, next) = decode_escaped(bytes, i + 1)?;
            let s = String::from_utf8(data).map_err(|_| TupleError::Utf8)?;
            Ok((Element::Str(s), next))
        }
        INT_ZERO..=0x1c => {
            let n = (code - INT_ZERO) as usize;
            let end = i + 1 + n;
            let raw = bytes.get(i + 1..end).ok_or(TupleError::Truncated)?;
            let mut be = [0u8; 8];
            be[8 - n..].copy_from_slice(raw);
            Ok((Element::Int(u64::from_be_bytes(be)), end))
        }
        NESTED => {
            let mut items = Vec::new();
            let mut j = i + 1;
            loop {
                match bytes.get(j) {
                    Some(0x00) => return Ok((Element::Nested(items), j + 1)),
                    Some(_) => {
                        let (el, next) = decode_element(bytes, j)?;
                        items.push(el);
                        j = next;
                    }
                    None => return Err(TupleError::Truncated),
                }
            }
        }
        VERSIONSTAMP => {
            let end = i + 1 + VERSIONSTAMP_LEN;
            let raw = bytes.get(i + 1..end).ok_or(TupleError::Truncated)?;
            let vs = Versionstamp::try_from(raw).map_err(|_| TupleError::Truncated)?;
            Ok((Element::Versionstamp(vs), end))
        }
        other => Err(TupleError::UnknownTypeCode(other)),
    }
}

fn decode_escaped(bytes: &[u8], mut i: usize) -> Result<(Vec<u8>, usize), TupleError> {
    let mut out = Vec::new();
    loop {
        let b = *bytes.get(i).ok_or(TupleError::Truncated)?;
        if b == 0x00 {
            if bytes.get(i + 1) == Some(&0xff) {
                out.push(0x00);
                i += 2;
            } else {
                return Ok((out, i + 1));
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trips_every_element_kind() {
        let vs = Versionstamp::incomplete(3).completed([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let elements = vec![
            Element::str("orders"),
            Element::Bytes(vec![0x00, 0xff, 0x01]),
            Element::Int(0),
            Element::Int(u64::MAX),
            Element::Nested(vec![Element::str("a"), Element::str("b")]),
            Element::Versionstamp(vs),
        ];
        let packed = pack(&elements);
        assert_eq!(unpack(&packed).unwrap(), elements);
    }

    #[test]
    fn pack_with_versionstamp_reports_slot_offset() {
        let (packed, offset) = pack_with_versionstamp(&[
            Element::str("t"),
            Element::Versionstamp(Versionstamp::incomplete(2)),
        ])
        .unwrap();
        assert_eq!(&packed[offset..offset + 10], &[0xff; 10]);
        assert_eq!(&packed[offset + 10..offset + 12], &2u16.to_be_bytes());
    }

    #[test]
    fn pack_with_versionstamp_requires_exactly_one_incomplete() {
        assert_eq!(
            pack_with_versionstamp(&[Element::str("t")]),
            Err(TupleError::IncompleteVersionstamps(0))
        );
        assert_eq!(
            pack_with_versionstamp(&[
                Element::Versionstamp(Versionstamp::incomplete(0)),
                Element::Versionstamp(Versionstamp::incomplete(1)),
            ]),
            Err(TupleError::IncompleteVersionstamps(2))
        );
    }

    #[test]
    fn strinc_skips_trailing_0xff() {
        assert_eq!(strinc(&[0x02, b'a', 0x00]), vec![0x02, b'a', 0x01]);
        assert_eq!(strinc(&[0x15, 0xff, 0xff]), vec![0x16]);
    }

    #[test]
    fn key_after_is_tightest_successor() {
        let key = pack(&[Element::str("x")]);
        let after = key_after(&key);
        assert!(after > key);
        assert!(after < strinc(&key));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(unpack(&[0x02, b'a']), Err(TupleError::Truncated));
        assert_eq!(unpack(&[0x7f]), Err(TupleError::UnknownTypeCode(0x7f)));
        assert_eq!(unpack(&[0x33, 0x01]), Err(TupleError::Truncated));
    }

    proptest! {
        #[test]
        fn string_order_is_preserved(a in ".{0,24}", b in ".{0,24}") {
            let ka = pack(&[Element::str(a.clone())]);
            let kb = pack(&[Element::str(b.clone())]);
            prop_assert_eq!(ka.cmp(&kb), a.as_bytes().cmp(b.as_bytes()));
        }

        #[test]
        fn bytes_order_is_preserved(a in proptest::collection::vec(any::<u8>(), 0..24),
                                    b in proptest::collection::vec(any::<u8>(), 0..24)) {
            let ka = pack(&[Element::Bytes(a.clone())]);
            let kb = pack(&[Element::Bytes(b.clone())]);
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        }

        #[test]
        fn int_order_is_preserved(a in any::<u64>(), b in any::<u64>()) {
            let ka = pack(&[Element::Int(a)]);
            let kb = pack(&[Element::Int(b)]);
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        }

        #[test]
        fn longer_tuples_extend_their_prefix(s in "[a-z]{1,8}", n in any::<u64>()) {
            let short = pack(&[Element::str(s.clone())]);
            let long = pack(&[Element::str(s), Element::Int(n)]);
            prop_assert!(long.starts_with(&short));
            prop_assert!(long.len() > short.len());
        }

        #[test]
        fn round_trip_any_strings(items in proptest::collection::vec(".{0,12}", 0..5)) {
            let elements: Vec<Element> = items.into_iter().map(Element::str).collect();
            let packed = pack(&elements);
            prop_assert_eq!(unpack(&packed).unwrap(), elements);
        }
    }
}
