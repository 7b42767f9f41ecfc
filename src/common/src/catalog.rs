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

use std::fmt;

use strum::IntoEnumIterator;

/// Identifier of a table. Stable for the table's lifetime: handles are
/// allocated monotonically and never reused after the table is dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId {
    pub table_id: u32,
}

impl TableId {
    pub const fn new(table_id: u32) -> Self {
        TableId { table_id }
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }
}

impl From<u32> for TableId {
    fn from(id: u32) -> Self {
        TableId::new(id)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_id)
    }
}

/// How a table's key space is partitioned.
///
/// `Ordered` tables guarantee that range scans observe keys in ascending
/// byte order. `Hashed` tables support the same operations, but a scan over
/// them makes no ordering promise to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionKind {
    Ordered,
    Hashed,
}

/// Byte tag identifying a category of tables.
///
/// The tag prefixes every key of a table of that kind, so keys of one kind
/// are co-located and every kind-restricted scan is a contiguous range.
/// Values are kept well below `0xff`; the exclusive upper bound of a kind's
/// key range is the single byte `code + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::EnumIter)]
#[repr(u8)]
pub enum TableKind {
    /// Caller-defined tables with no special key layout.
    Unknown = 0x00,
    PropertyKey = 0x01,
    VertexLabel = 0x02,
    EdgeLabel = 0x03,
    IndexLabel = 0x04,
    Vertex = 0x10,
    /// Out-going edges, keyed by source vertex.
    EdgeOut = 0x11,
    /// In-coming edges, keyed by target vertex.
    EdgeIn = 0x12,
    SecondaryIndex = 0x20,
    RangeIndex = 0x21,
    SearchIndex = 0x22,
    /// Reserved counter table of a store; see the session `increase` op.
    Counter = 0x30,
    SystemMeta = 0x40,
}

impl TableKind {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<TableKind> {
        TableKind::iter().find(|kind| kind.code() == code)
    }

    /// The partitioning a table of this kind is created with. Row data is
    /// spread by id hash; schema, index, counter and system tables need
    /// ordered enumeration.
    pub const fn partition(self) -> PartitionKind {
        match self {
            TableKind::Vertex | TableKind::EdgeOut | TableKind::EdgeIn => PartitionKind::Hashed,
            _ => PartitionKind::Ordered,
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
