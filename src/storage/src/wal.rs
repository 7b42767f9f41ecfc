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

//! Durability seam. The engine itself is in-memory; a persistence
//! collaborator consumes the write-ahead stream of committed transactions
//! and replays it through [`StorageEngine::replay`] on startup, in
//! commit-timestamp order, before the core serves traffic.
//!
//! [`StorageEngine::replay`]: crate::engine::StorageEngine::replay

use bytes::Bytes;
use graphstore_common::catalog::TableId;
use parking_lot::Mutex;

use crate::engine::version::CommitTs;
use crate::error::StorageResult;

/// One committed write. `value == None` records a tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRecord {
    pub commit_ts: CommitTs,
    pub table_id: TableId,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

/// Sink for the committed write-ahead stream.
///
/// `append` is called once per commit, before the writes become visible,
/// with all of the transaction's records carrying the same `commit_ts`.
/// Returning an error aborts the transaction.
pub trait Durability: Send + Sync {
    fn append(&self, records: &[CommitRecord]) -> StorageResult<()>;
}

/// Discards the stream. The engine behaves identically, minus recovery.
#[derive(Debug, Default)]
pub struct NoopDurability;

impl Durability for NoopDurability {
    fn append(&self, _records: &[CommitRecord]) -> StorageResult<()> {
        Ok(())
    }
}

/// Buffers the stream in memory. Backs recovery tests and collaborators
/// that flush out-of-band.
#[derive(Debug, Default)]
pub struct MemoryDurability {
    log: Mutex<Vec<CommitRecord>>,
}

impl MemoryDurability {
    pub fn new() -> Self {
        MemoryDurability::default()
    }

    /// The records appended so far, in commit-timestamp order.
    pub fn records(&self) -> Vec<CommitRecord> {
        self.log.lock().clone()
    }
}

impl Durability for MemoryDurability {
    fn append(&self, records: &[CommitRecord]) -> StorageResult<()> {
        self.log.lock().extend_from_slice(records);
        Ok(())
    }
}

pub mod codec {
    //! Wire form of the committed stream, for sinks that persist it:
    //! `count(u32) || (commit_ts(u64) || table_id(u32) || key_len(u32) ||
    //! key || tag(u8) || [value_len(u32) || value]) * count`, big-endian.
    //! A tag of zero is a tombstone and carries no value.

    use bytes::{BufMut, Bytes, BytesMut};
    use graphstore_common::catalog::TableId;
    use graphstore_common::error::{CodecError, CodecResult};

    use super::CommitRecord;

    const TAG_TOMBSTONE: u8 = 0;
    const TAG_VALUE: u8 = 1;

    pub fn encode_records(records: &[CommitRecord]) -> CodecResult<Bytes> {
        let count = u32::try_from(records.len())
            .map_err(|_| CodecError::MalformedValue("too many records".into()))?;
        let mut buf = BytesMut::new();
        buf.put_u32(count);
        for record in records {
            buf.put_u64(record.commit_ts);
            buf.put_u32(record.table_id.table_id());
            let key_len = u32::try_from(record.key.len())
                .map_err(|_| CodecError::MalformedValue("record key too long".into()))?;
            buf.put_u32(key_len);
            buf.put_slice(&record.key);
            match &record.value {
                None => buf.put_u8(TAG_TOMBSTONE),
                Some(value) => {
                    buf.put_u8(TAG_VALUE);
                    let value_len = u32::try_from(value.len())
                        .map_err(|_| CodecError::MalformedValue("record value too long".into()))?;
                    buf.put_u32(value_len);
                    buf.put_slice(value);
                }
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode_records(raw: &[u8]) -> CodecResult<Vec<CommitRecord>> {
        let mut reader = Reader { raw, pos: 0 };
        let count = reader.read_u32()? as usize;
        let mut records = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let commit_ts = reader.read_u64()?;
            let table_id = TableId::new(reader.read_u32()?);
            let key_len = reader.read_u32()? as usize;
            let key = reader.read_bytes(key_len)?;
            let value = match reader.read_u8()? {
                TAG_TOMBSTONE => None,
                TAG_VALUE => {
                    let value_len = reader.read_u32()? as usize;
                    Some(reader.read_bytes(value_len)?)
                }
                tag => {
                    return Err(CodecError::MalformedValue(format!(
                        "unknown record tag 0x{:02x}",
                        tag
                    )))
                }
            };
            records.push(CommitRecord {
                commit_ts,
                table_id,
                key,
                value,
            });
        }
        if reader.pos != raw.len() {
            return Err(CodecError::MalformedValue(format!(
                "{} trailing bytes after {} records",
                raw.len() - reader.pos,
                count
            )));
        }
        Ok(records)
    }

    struct Reader<'a> {
        raw: &'a [u8],
        pos: usize,
    }

    impl Reader<'_> {
        fn take(&mut self, len: usize) -> CodecResult<&[u8]> {
            let end = self
                .pos
                .checked_add(len)
                .filter(|&end| end <= self.raw.len())
                .ok_or_else(|| CodecError::MalformedValue("truncated record stream".into()))?;
            let chunk = &self.raw[self.pos..end];
            self.pos = end;
            Ok(chunk)
        }

        fn read_u8(&mut self) -> CodecResult<u8> {
            Ok(self.take(1)?[0])
        }

        fn read_u32(&mut self) -> CodecResult<u32> {
            Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
        }

        fn read_u64(&mut self) -> CodecResult<u64> {
            Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
        }

        fn read_bytes(&mut self, len: usize) -> CodecResult<Bytes> {
            Ok(Bytes::copy_from_slice(self.take(len)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::codec::{decode_records, encode_records};
    use super::*;
    use graphstore_common::catalog::TableId;
    use graphstore_common::error::CodecError;

    fn sample_records() -> Vec<CommitRecord> {
        vec![
            CommitRecord {
                commit_ts: 1,
                table_id: TableId::new(0),
                key: Bytes::from_static(b"a"),
                value: Some(Bytes::from_static(b"1")),
            },
            CommitRecord {
                commit_ts: 2,
                table_id: TableId::new(3),
                key: Bytes::from_static(b""),
                value: Some(Bytes::from_static(b"")),
            },
            CommitRecord {
                commit_ts: 2,
                table_id: TableId::new(3),
                key: Bytes::from_static(b"\x00\xff"),
                value: None,
            },
        ]
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryDurability::new();
        let records = sample_records();
        sink.append(&records[..1]).unwrap();
        sink.append(&records[1..]).unwrap();
        assert_eq!(sink.records(), records);
    }

    #[test]
    fn test_record_codec_round_trip() {
        let records = sample_records();
        let raw = encode_records(&records).unwrap();
        assert_eq!(decode_records(&raw).unwrap(), records);
    }

    #[test]
    fn test_record_codec_rejects_truncation() {
        let raw = encode_records(&sample_records()).unwrap();
        for cut in 0..raw.len() {
            assert!(
                matches!(
                    decode_records(&raw[..cut]),
                    Err(CodecError::MalformedValue(_))
                ),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn test_record_codec_rejects_trailing_bytes() {
        let mut raw = encode_records(&[]).unwrap().to_vec();
        raw.push(0);
        assert!(decode_records(&raw).is_err());
    }
}
