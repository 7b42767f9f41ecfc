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

//! Serialization of column values into storage bytes.
//!
//! Wire shape: `count(u32) || (name_len(u32) || name || value_len(u32) ||
//! value) * count`, all integers big-endian. The transport is binary-safe;
//! names and values may contain any byte, including NUL.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::CounterEndianness;
use crate::error::{CodecError, CodecResult};

/// One named column of a stored row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnPair {
    pub name: Bytes,
    pub value: Bytes,
}

impl ColumnPair {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        ColumnPair {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Serializes an ordered column list into value bytes.
pub fn serialize_columns(columns: &[ColumnPair]) -> CodecResult<Bytes> {
    let count = u32::try_from(columns.len())
        .map_err(|_| CodecError::MalformedValue("too many columns".into()))?;
    let payload: usize = columns
        .iter()
        .map(|col| 8 + col.name.len() + col.value.len())
        .sum();
    let mut buf = BytesMut::with_capacity(4 + payload);
    buf.put_u32(count);
    for col in columns {
        put_chunk(&mut buf, &col.name)?;
        put_chunk(&mut buf, &col.value)?;
    }
    Ok(buf.freeze())
}

/// Deserializes value bytes back into the column list. An empty buffer
/// decodes to zero columns.
pub fn deserialize_columns(raw: &[u8]) -> CodecResult<Vec<ColumnPair>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = ChunkReader { raw, pos: 0 };
    let count = reader.read_u32()? as usize;
    let mut columns = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let name = reader.read_chunk()?;
        let value = reader.read_chunk()?;
        columns.push(ColumnPair { name, value });
    }
    if reader.pos != raw.len() {
        return Err(CodecError::MalformedValue(format!(
            "{} trailing bytes after {} columns",
            raw.len() - reader.pos,
            count
        )));
    }
    Ok(columns)
}

fn put_chunk(buf: &mut BytesMut, chunk: &[u8]) -> CodecResult<()> {
    let len = u32::try_from(chunk.len())
        .map_err(|_| CodecError::MalformedValue("column chunk too long".into()))?;
    buf.put_u32(len);
    buf.put_slice(chunk);
    Ok(())
}

struct ChunkReader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl ChunkReader<'_> {
    fn read_u32(&mut self) -> CodecResult<u32> {
        let end = self.pos + 4;
        if end > self.raw.len() {
            return Err(CodecError::MalformedValue("truncated length".into()));
        }
        let word = u32::from_be_bytes(self.raw[self.pos..end].try_into().unwrap());
        self.pos = end;
        Ok(word)
    }

    fn read_chunk(&mut self) -> CodecResult<Bytes> {
        let len = self.read_u32()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.raw.len())
            .ok_or_else(|| {
                CodecError::MalformedValue(format!("chunk length {} exceeds buffer", len))
            })?;
        let chunk = Bytes::copy_from_slice(&self.raw[self.pos..end]);
        self.pos = end;
        Ok(chunk)
    }
}

/// Encodes a counter value with the configured byte order.
pub fn serialize_counter(value: u64, endianness: CounterEndianness) -> Bytes {
    let raw = match endianness {
        CounterEndianness::Host => value.to_ne_bytes(),
        CounterEndianness::Little => value.to_le_bytes(),
        CounterEndianness::Big => value.to_be_bytes(),
    };
    Bytes::copy_from_slice(&raw)
}

/// Decodes a counter value. Counters are exactly eight bytes wide.
pub fn deserialize_counter(raw: &[u8], endianness: CounterEndianness) -> CodecResult<u64> {
    let raw: [u8; 8] = raw.try_into().map_err(|_| {
        CodecError::MalformedValue(format!("counter must be 8 bytes, got {}", raw.len()))
    })?;
    Ok(match endianness {
        CounterEndianness::Host => u64::from_ne_bytes(raw),
        CounterEndianness::Little => u64::from_le_bytes(raw),
        CounterEndianness::Big => u64::from_be_bytes(raw),
    })
}
