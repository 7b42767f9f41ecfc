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

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use graphstore_common::catalog::{PartitionKind, TableId, TableKind};
use parking_lot::RwLock;

use crate::engine::txn::TxId;
use crate::engine::version::{CommitTs, VersionChain};

pub(crate) type TableData = Arc<RwLock<BTreeMap<Bytes, VersionChain>>>;

/// Whether `BTreeMap::range` accepts the bounds. A reversed range (or an
/// equal pair with both ends excluded) simply selects nothing.
pub(crate) fn is_selectable_range(lo: &Bound<Bytes>, hi: &Bound<Bytes>) -> bool {
    match (lo, hi) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Excluded(lo), Bound::Excluded(hi)) => lo < hi,
        (Bound::Included(lo) | Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Included(lo), Bound::Excluded(hi)) => lo <= hi,
    }
}

pub(crate) mod chunked {
    use super::*;

    /// Iterates a range of a locked table map, copying out a chunk of
    /// version chains at a time to trade copying overhead against lock
    /// acquisitions.
    ///
    /// The map is not pinned between chunks, so this is not a consistent
    /// snapshot of the map; version visibility is the reader's concern.
    /// Committed versions at or below the reader's registered snapshot are
    /// guaranteed present in whichever chunk their key arrives in.
    pub(crate) struct Iter {
        data: TableData,
        range: (Bound<Bytes>, Bound<Bytes>),
        chunk: std::vec::IntoIter<(Bytes, VersionChain)>,
    }

    impl Iter {
        const CHUNK_SIZE: usize = 256;

        pub fn new(data: TableData, range: (Bound<Bytes>, Bound<Bytes>)) -> Self {
            Iter {
                data,
                range,
                chunk: Vec::new().into_iter(),
            }
        }

        /// Copies the next chunk out of the map and advances the lower
        /// bound past it.
        fn refill(&mut self) {
            debug_assert!(self.chunk.len() == 0);
            if !is_selectable_range(&self.range.0, &self.range.1) {
                return;
            }
            let chunk: Vec<(Bytes, VersionChain)> = self
                .data
                .read()
                .range::<Bytes, _>((self.range.0.as_ref(), self.range.1.as_ref()))
                .take(Self::CHUNK_SIZE)
                .map(|(key, chain)| (key.clone(), chain.clone()))
                .collect();
            if let Some((last_key, _)) = chunk.last() {
                self.range.0 = Bound::Excluded(last_key.clone());
            }
            self.chunk = chunk.into_iter();
        }
    }

    impl Iterator for Iter {
        type Item = (Bytes, VersionChain);

        fn next(&mut self) -> Option<Self::Item> {
            match self.chunk.next() {
                Some(item) => Some(item),
                None => {
                    self.refill();
                    self.chunk.next()
                }
            }
        }
    }
}

/// Size of a table, for monitoring. `version_count` includes tombstones
/// and pending entries; it shrinks as commits trim old versions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub key_count: usize,
    pub version_count: usize,
}

/// One half-open slice `[start, end)` of a table's key space. `None`
/// bounds are unbounded. Shards partition the table for parallel scans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyShard {
    pub start: Option<Bytes>,
    pub end: Option<Bytes>,
}

/// One table of the engine: an ordered map from key to version chain,
/// tagged with the table's kind and partitioning.
pub struct Table {
    id: TableId,
    name: String,
    kind: TableKind,
    data: TableData,
}

impl Table {
    pub(crate) fn new(id: TableId, name: String, kind: TableKind) -> Self {
        Table {
            id,
            name,
            kind,
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn partition(&self) -> PartitionKind {
        self.kind.partition()
    }

    /// The committed value (or the reader's own pending write) visible at
    /// `snapshot`.
    pub(crate) fn get_visible(
        &self,
        key: &[u8],
        snapshot: CommitTs,
        own: Option<TxId>,
    ) -> Option<Bytes> {
        self.data.read().get(key).and_then(|chain| chain.visible(snapshot, own))
    }

    pub(crate) fn newest_commit_ts(&self, key: &[u8]) -> Option<CommitTs> {
        self.data.read().get(key).and_then(|chain| chain.newest_commit_ts())
    }

    /// Stages a pending write. An in-flight pending entry of another
    /// transaction is returned as the error.
    pub(crate) fn stage_write(
        &self,
        tx: TxId,
        key: Bytes,
        value: Option<Bytes>,
    ) -> Result<(), TxId> {
        let mut data = self.data.write();
        data.entry(key).or_default().stage(tx, value)
    }

    /// Drops the pending entries `tx` staged under `keys`, removing chains
    /// that end up empty.
    pub(crate) fn unstage_all(&self, tx: TxId, keys: &BTreeSet<Bytes>) {
        let mut data = self.data.write();
        for key in keys {
            if let Some(chain) = data.get_mut(key) {
                chain.unstage(tx);
                if chain.is_empty() {
                    data.remove(key);
                }
            }
        }
    }

    pub(crate) fn pending_value(&self, tx: TxId, key: &[u8]) -> Option<Option<Bytes>> {
        self.data.read().get(key).and_then(|chain| chain.pending_value(tx))
    }

    /// Promotes `tx`'s pending entries under `keys` to committed versions
    /// at `commit_ts`, trimming each touched chain below `watermark`.
    pub(crate) fn publish(
        &self,
        tx: TxId,
        keys: &BTreeSet<Bytes>,
        commit_ts: CommitTs,
        watermark: CommitTs,
    ) {
        let mut data = self.data.write();
        for key in keys {
            if let Some(chain) = data.get_mut(key) {
                chain.promote(tx, commit_ts);
                chain.trim(watermark);
                if chain.is_obsolete(watermark) {
                    data.remove(key);
                }
            }
        }
    }

    /// Installs an already-committed version, used by write-ahead replay.
    pub(crate) fn install_committed(&self, key: Bytes, commit_ts: CommitTs, value: Option<Bytes>) {
        let mut data = self.data.write();
        data.entry(key).or_default().install_committed(commit_ts, value);
    }

    pub(crate) fn chunked_iter(&self, range: (Bound<Bytes>, Bound<Bytes>)) -> chunked::Iter {
        chunked::Iter::new(self.data.clone(), range)
    }

    pub(crate) fn stats(&self) -> TableStats {
        let data = self.data.read();
        TableStats {
            key_count: data.len(),
            version_count: data.values().map(|chain| chain.version_count()).sum(),
        }
    }

    /// Splits the current key population into at most `shard_count`
    /// half-open slices of roughly equal size. Boundaries come from the
    /// live key set, so concurrent writes shift shard balance, not
    /// correctness: the slices always cover the whole key space.
    pub(crate) fn split_shards(&self, shard_count: usize) -> Vec<KeyShard> {
        let data = self.data.read();
        if shard_count <= 1 || data.len() < 2 {
            return vec![KeyShard {
                start: None,
                end: None,
            }];
        }
        let step = data.len().div_ceil(shard_count);
        let mut shards = Vec::with_capacity(shard_count);
        let mut start: Option<Bytes> = None;
        for boundary in data.keys().step_by(step).skip(1) {
            shards.push(KeyShard {
                start: start.take(),
                end: Some(boundary.clone()),
            });
            start = Some(boundary.clone());
        }
        shards.push(KeyShard { start, end: None });
        shards
    }

    /// Drops all keys. Used when the table is dropped from the registry.
    pub(crate) fn clear(&self) {
        self.data.write().clear();
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
