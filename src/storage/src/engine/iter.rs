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

use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;

use crate::engine::table::{chunked, Table};
use crate::engine::txn::{TransactionManager, TxHandle, TxState};
use crate::error::{StorageError, StorageResult};
use crate::monitor::StoreMetrics;

/// Keeps an internally allocated read-only transaction registered for the
/// lifetime of a scan, so the versions its snapshot needs are not trimmed
/// underneath it. Dropping the guard commits (trivially) and deregisters.
pub(crate) struct ReadGuard {
    manager: Arc<TransactionManager>,
    handle: Arc<TxHandle>,
}

impl ReadGuard {
    pub fn new(manager: Arc<TransactionManager>, handle: Arc<TxHandle>) -> Self {
        ReadGuard { manager, handle }
    }

    pub fn handle(&self) -> &Arc<TxHandle> {
        &self.handle
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.manager.finish(&self.handle, TxState::Committed);
    }
}

/// The transaction a scan runs under: the caller's own, or an auto-commit
/// snapshot owned by the iterator.
pub(crate) enum TxBinding {
    Caller(Arc<TxHandle>),
    Auto(ReadGuard),
}

impl TxBinding {
    fn handle(&self) -> &Arc<TxHandle> {
        match self {
            TxBinding::Caller(handle) => handle,
            TxBinding::Auto(guard) => guard.handle(),
        }
    }
}

/// A pull iterator over the visible live entries of one table range, in
/// ascending key order.
///
/// Entries are prefetched in fixed-size chunks from the table. After
/// yielding an entry, [`position`](StoreIter::position) equals its key and
/// can seed a resumed scan. If the owning transaction aborts, the next
/// advance fails with `Cancelled` and the iterator terminates.
pub struct StoreIter {
    table: Arc<Table>,
    inner: chunked::Iter,
    binding: TxBinding,
    /// Remaining-entry cap; zero means unbounded.
    limit: usize,
    yielded: usize,
    position: Bytes,
    done: bool,
    metrics: Arc<StoreMetrics>,
}

impl StoreIter {
    pub(crate) fn new(
        table: Arc<Table>,
        range: (Bound<Bytes>, Bound<Bytes>),
        binding: TxBinding,
        limit: usize,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let inner = table.chunked_iter(range);
        StoreIter {
            table,
            inner,
            binding,
            limit,
            yielded: 0,
            position: Bytes::new(),
            done: false,
            metrics,
        }
    }

    /// The key of the last yielded entry; empty on a fresh iterator.
    pub fn position(&self) -> &Bytes {
        &self.position
    }

    /// Advances to the next visible entry.
    pub fn next_entry(&mut self) -> StorageResult<Option<(Bytes, Bytes)>> {
        if self.done {
            return Ok(None);
        }
        if self.limit != 0 && self.yielded >= self.limit {
            self.done = true;
            return Ok(None);
        }
        if let TxBinding::Caller(handle) = &self.binding {
            if handle.state() != TxState::Active {
                self.done = true;
                return Err(StorageError::Cancelled(handle.id()));
            }
        }
        let handle = self.binding.handle();
        let snapshot = handle.snapshot();
        let own = Some(handle.id());
        while let Some((key, chain)) = self.inner.next() {
            let Some(value) = chain.visible(snapshot, own) else {
                continue;
            };
            handle.record_read(self.table.id(), key.clone());
            self.metrics
                .iter_scan_key_counts
                .with_label_values(&[self.table.name()])
                .inc();
            self.position = key.clone();
            self.yielded += 1;
            return Ok(Some((key, value)));
        }
        self.done = true;
        Ok(None)
    }

    /// Drains the iterator into a vector. Used where callers need the
    /// eager form, e.g. replaying prefix deletes or filling the cache.
    pub fn materialize(mut self) -> StorageResult<Vec<(Bytes, Bytes)>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl Iterator for StoreIter {
    type Item = StorageResult<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
