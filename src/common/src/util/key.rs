// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ordered byte-key construction.
//!
//! A storage key is the table-kind byte followed by the caller-supplied
//! logical id, compared lexicographically. Keeping the kind in front
//! co-locates keys of one kind, so every kind-restricted scan is a
//! contiguous range.

use std::ops::Bound;

use bytes::{BufMut, Bytes, BytesMut};

use crate::catalog::TableKind;
use crate::error::{CodecError, CodecResult};

/// Length of the kind tag in front of every encoded key.
pub const KIND_PREFIX_LEN: usize = 1;

/// Encodes a logical id into a storage key of the given kind.
pub fn encode_key(kind: TableKind, id: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(KIND_PREFIX_LEN + id.len());
    buf.put_u8(kind.code());
    buf.put_slice(id);
    buf.freeze()
}

/// Splits a storage key back into its kind and logical id.
pub fn decode_key(raw: &[u8]) -> CodecResult<(TableKind, &[u8])> {
    let (&code, id) = raw
        .split_first()
        .ok_or_else(|| CodecError::MalformedKey("empty key".into()))?;
    let kind = TableKind::from_code(code)
        .ok_or_else(|| CodecError::MalformedKey(format!("unknown table kind 0x{:02x}", code)))?;
    Ok((kind, id))
}

/// The inclusive lower bound of a kind-restricted scan: the encoded key if
/// an id is given, otherwise the single kind byte, which sorts before every
/// key of the kind.
pub fn scan_start(kind: TableKind, id: Option<&[u8]>) -> Bytes {
    match id {
        Some(id) => encode_key(kind, id),
        None => Bytes::copy_from_slice(&[kind.code()]),
    }
}

/// The exclusive upper bound of a kind-restricted scan: the encoded key if
/// an id is given, otherwise the single byte `kind + 1`.
pub fn scan_end(kind: TableKind, id: Option<&[u8]>) -> Bytes {
    match id {
        Some(id) => encode_key(kind, id),
        None => Bytes::copy_from_slice(&[kind.code() + 1]),
    }
}

/// Computes the smallest key strictly greater than every key that starts
/// with `prefix`, by incrementing the last non-0xff byte and dropping the
/// tail. An empty return value means "unbounded above": every byte of the
/// prefix is already 0xff.
pub fn next_key(prefix: &[u8]) -> Vec<u8> {
    let pos = prefix.iter().rposition(|&b| b != u8::MAX);
    match pos {
        Some(pos) => {
            let mut end = Vec::with_capacity(pos + 1);
            end.extend_from_slice(&prefix[..pos]);
            end.push(prefix[pos] + 1);
            end
        }
        None => Vec::new(),
    }
}

/// The end bound of a prefix scan, expressed for `BTreeMap::range`
/// composition. All-0xff prefixes (and the empty prefix) have no finite
/// upper bound.
pub fn end_bound_of_prefix(prefix: &[u8]) -> Bound<Bytes> {
    let end = next_key(prefix);
    if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(Bytes::from(end))
    }
}

/// Prepends `prefix` to both bounds of `range`. An unbounded start becomes
/// the prefix itself; an unbounded end becomes the prefix's end bound.
pub fn prefixed_range<R, B>(range: R, prefix: &[u8]) -> (Bound<Bytes>, Bound<Bytes>)
where
    R: std::ops::RangeBounds<B>,
    B: AsRef<[u8]>,
{
    let prepend = |k: &B| {
        let mut buf = BytesMut::with_capacity(prefix.len() + k.as_ref().len());
        buf.put_slice(prefix);
        buf.put_slice(k.as_ref());
        buf.freeze()
    };
    let start = match range.start_bound() {
        Bound::Included(k) => Bound::Included(prepend(k)),
        Bound::Excluded(k) => Bound::Excluded(prepend(k)),
        Bound::Unbounded => Bound::Included(Bytes::copy_from_slice(prefix)),
    };
    let end = match range.end_bound() {
        Bound::Included(k) => Bound::Included(prepend(k)),
        Bound::Excluded(k) => Bound::Excluded(prepend(k)),
        Bound::Unbounded => end_bound_of_prefix(prefix),
    };
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let key = encode_key(TableKind::Vertex, b"v:1234");
        assert_eq!(key.as_ref(), b"\x10v:1234");
        let (kind, id) = decode_key(&key).unwrap();
        assert_eq!(kind, TableKind::Vertex);
        assert_eq!(id, b"v:1234");
    }

    #[test]
    fn test_empty_id_is_legal() {
        let key = encode_key(TableKind::SystemMeta, b"");
        let (kind, id) = decode_key(&key).unwrap();
        assert_eq!(kind, TableKind::SystemMeta);
        assert!(id.is_empty());
    }

    #[test]
    fn test_decode_empty_key_fails() {
        assert!(matches!(
            decode_key(b""),
            Err(CodecError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_decode_unknown_kind_fails() {
        assert!(matches!(
            decode_key(b"\xfeabc"),
            Err(CodecError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_scan_bounds_of_kind() {
        let lo = scan_start(TableKind::EdgeOut, None);
        let hi = scan_end(TableKind::EdgeOut, None);
        assert_eq!(lo.as_ref(), &[0x11]);
        assert_eq!(hi.as_ref(), &[0x12]);
        // every key of the kind falls inside [lo, hi)
        let key = encode_key(TableKind::EdgeOut, b"\xff\xff");
        assert!(lo <= key && key < hi);
    }

    #[test]
    fn test_scan_bounds_with_id() {
        let lo = scan_start(TableKind::Vertex, Some(b"a"));
        let hi = scan_end(TableKind::Vertex, Some(b"z"));
        assert_eq!(lo, encode_key(TableKind::Vertex, b"a"));
        assert_eq!(hi, encode_key(TableKind::Vertex, b"z"));
    }

    #[test]
    fn test_next_key() {
        assert_eq!(next_key(b"abc"), b"abd".to_vec());
        assert_eq!(next_key(b"ab\xff"), b"ac".to_vec());
        assert_eq!(next_key(b"\xff\xff"), Vec::<u8>::new());
        assert_eq!(next_key(b""), Vec::<u8>::new());
    }

    #[test]
    fn test_end_bound_of_prefix() {
        assert_eq!(
            end_bound_of_prefix(b"abc"),
            Bound::Excluded(Bytes::from_static(b"abd"))
        );
        assert_eq!(end_bound_of_prefix(b"\xff"), Bound::Unbounded);
    }

    #[test]
    fn test_prefixed_range() {
        let (lo, hi) = prefixed_range::<_, &[u8]>(.., b"p/");
        assert_eq!(lo, Bound::Included(Bytes::from_static(b"p/")));
        assert_eq!(hi, Bound::Excluded(Bytes::from_static(b"p0")));

        let (lo, hi) = prefixed_range(&b"a"[..]..&b"b"[..], b"p/");
        assert_eq!(lo, Bound::Included(Bytes::from_static(b"p/a")));
        assert_eq!(hi, Bound::Excluded(Bytes::from_static(b"p/b")));
    }
}
