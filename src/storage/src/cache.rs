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

//! Point-read cache for auto-commit gets.
//!
//! Invalidation is key-granular, driven by each committed transaction's
//! write set. Inserts are clock-guarded: an entry only lands if no commit
//! happened since the value was read, which together with invalidation
//! after publish keeps cached reads indistinguishable from engine reads.
//! Transactional reads never consult the cache.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use graphstore_common::catalog::TableId;
use lru::LruCache;
use parking_lot::Mutex;

use crate::engine::version::CommitTs;

struct CacheEntry {
    value: Option<Bytes>,
    cached_at: Instant,
}

pub(crate) struct QueryCache {
    inner: Mutex<LruCache<(TableId, Bytes), CacheEntry>>,
    ttl: Option<Duration>,
}

impl QueryCache {
    /// `capacity` must be non-zero (a zero capacity disables the cache at
    /// the engine level). `ttl_ms == 0` means entries never expire.
    pub fn new(capacity: NonZeroUsize, ttl_ms: u64) -> Self {
        QueryCache {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms)),
        }
    }

    pub fn get(&self, table: TableId, key: &[u8]) -> Option<Option<Bytes>> {
        let mut inner = self.inner.lock();
        let lookup = (table, Bytes::copy_from_slice(key));
        let entry = inner.get(&lookup)?;
        if let Some(ttl) = self.ttl {
            if entry.cached_at.elapsed() >= ttl {
                inner.pop(&lookup);
                return None;
            }
        }
        Some(entry.value.clone())
    }

    /// Inserts a value read at snapshot `read_snapshot`, unless the commit
    /// clock moved in the meantime. `current_clock` is evaluated under the
    /// cache lock so the check cannot race a concurrent invalidation.
    pub fn insert_if_current(
        &self,
        table: TableId,
        key: Bytes,
        value: Option<Bytes>,
        read_snapshot: CommitTs,
        current_clock: impl FnOnce() -> CommitTs,
    ) {
        let mut inner = self.inner.lock();
        if current_clock() != read_snapshot {
            return;
        }
        inner.put(
            (table, key),
            CacheEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drops the entries a commit superseded.
    pub fn invalidate<'a>(&self, keys: impl Iterator<Item = (TableId, &'a Bytes)>) {
        let mut inner = self.inner.lock();
        for (table, key) in keys {
            inner.pop(&(table, key.clone()));
        }
    }

    /// Drops everything. Used when a table is dropped.
    pub fn invalidate_all(&self) {
        self.inner.lock().clear();
    }
}
