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

//! The transactional table store: per-table ordered maps of versioned
//! values, point operations and bounded scans under multi-statement
//! transactions with snapshot isolation.

pub mod iter;
pub mod table;
pub mod txn;
pub mod version;

use std::num::NonZeroUsize;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use graphstore_common::catalog::{TableId, TableKind};
use graphstore_common::config::{IsolationLevel, StoreConfig};
use tracing::{debug, warn};

use self::iter::{ReadGuard, StoreIter, TxBinding};
use self::table::Table;
use self::txn::{TransactionManager, TxHandle, TxId, TxState};
use crate::cache::QueryCache;
use crate::error::{StorageError, StorageResult};
use crate::monitor::{global_store_metrics, StoreMetrics};
use crate::registry::TableRegistry;
use crate::wal::{CommitRecord, Durability};

/// The storage engine. One long-lived instance per store environment,
/// safe for concurrent use from multiple sessions.
pub struct StorageEngine {
    config: StoreConfig,
    registry: TableRegistry,
    txn: Arc<TransactionManager>,
    durability: Option<Arc<dyn Durability>>,
    cache: Option<QueryCache>,
    metrics: Arc<StoreMetrics>,
    closed: AtomicBool,
}

impl StorageEngine {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_durability(config, None)
    }

    pub fn with_durability(config: StoreConfig, durability: Option<Arc<dyn Durability>>) -> Self {
        let cache = NonZeroUsize::new(config.cache_max_entries)
            .map(|capacity| QueryCache::new(capacity, config.cache_ttl_ms));
        StorageEngine {
            config,
            registry: TableRegistry::new(),
            txn: Arc::new(TransactionManager::new()),
            durability,
            cache,
            metrics: global_store_metrics(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn for_test() -> Self {
        Self::new(StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::InvalidState("store is shut down".into()));
        }
        Ok(())
    }

    // ----- table lifecycle -----

    /// Creates the table, or returns the existing handle for the name.
    pub fn create_table(&self, name: &str, kind: TableKind) -> StorageResult<Arc<Table>> {
        self.ensure_open()?;
        self.registry.create(name, kind)
    }

    /// Drops the table and all its keys.
    pub fn drop_table(&self, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.registry.drop_table(name)?;
        // Handles are gone; cached reads for them must go too.
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        Ok(())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.registry.exists(name)
    }

    /// Removes all keys of the table but keeps its handle live.
    pub fn truncate_table(&self, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let table = self.registry.open(name)?;
        table.clear();
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        debug!(name, "truncated table");
        Ok(())
    }

    pub fn table_stats(&self, table_id: TableId) -> StorageResult<table::TableStats> {
        Ok(self.registry.get(table_id)?.stats())
    }

    /// Splits the table's key population into at most `shard_count`
    /// half-open slices for parallel scanning; together they cover the
    /// whole key space.
    pub fn table_shards(
        &self,
        table_id: TableId,
        shard_count: usize,
    ) -> StorageResult<Vec<table::KeyShard>> {
        self.ensure_open()?;
        Ok(self.registry.get(table_id)?.split_shards(shard_count))
    }

    // ----- transaction lifecycle -----

    /// Begins a read-write transaction.
    pub fn begin(&self) -> StorageResult<TxId> {
        self.ensure_open()?;
        Ok(self.txn.begin(false).id())
    }

    /// Begins a read-only transaction. Mutations under it fail with
    /// `ReadOnlyViolation` at the call, and commit skips validation.
    pub fn begin_read_only(&self) -> StorageResult<TxId> {
        self.ensure_open()?;
        Ok(self.txn.begin(true).id())
    }

    /// Commits in one atomic step: validate the write set against the
    /// snapshot, write ahead, publish, advance the clock. A validation
    /// failure aborts the transaction and surfaces as `WriteConflict`.
    pub fn commit(&self, tx: TxId) -> StorageResult<()> {
        self.ensure_open()?;
        if tx.is_auto_commit() {
            return Err(StorageError::InvalidState(
                "auto-commit transactions are committed by the engine".into(),
            ));
        }
        let handle = self.txn.lookup(tx).ok_or_else(|| {
            StorageError::InvalidState(format!("transaction {} is unknown or terminal", tx))
        })?;
        self.commit_handle(handle)
    }

    /// Aborts the transaction, discarding its pending writes. Aborting an
    /// unknown or terminal handle is a no-op; abort never fails.
    pub fn abort(&self, tx: TxId) {
        if tx.is_auto_commit() {
            return;
        }
        if let Some(handle) = self.txn.lookup(tx) {
            self.rollback_handle(&handle);
        }
    }

    /// Aborts transactions that outlived `transaction_timeout_ms`. The
    /// sweep is caller-driven; with the timeout unset this does nothing.
    pub fn abort_expired(&self) -> usize {
        if self.config.transaction_timeout_ms == 0 {
            return 0;
        }
        let timeout = Duration::from_millis(self.config.transaction_timeout_ms);
        self.txn
            .expired_transactions(timeout)
            .iter()
            .filter(|handle| {
                let aborted = self.rollback_handle(handle);
                if aborted {
                    warn!(tx = %handle.id(), "aborted expired transaction");
                }
                aborted
            })
            .count()
    }

    // ----- point operations -----

    /// Reads the newest committed value visible at the transaction's
    /// snapshot, or the transaction's own pending write. `None` if the key
    /// is absent or deleted there.
    pub fn get(&self, tx: TxId, table_id: TableId, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.ensure_open()?;
        let table = self.registry.get(table_id)?;
        self.metrics
            .point_op_counts
            .with_label_values(&[table.name(), "get"])
            .inc();
        if !tx.is_auto_commit() {
            let handle = self.op_handle(tx)?;
            let value = table.get_visible(key, handle.snapshot(), Some(tx));
            handle.record_read(table_id, Bytes::copy_from_slice(key));
            return Ok(value);
        }

        if let Some(cache) = &self.cache {
            if let Some(value) = cache.get(table_id, key) {
                self.metrics
                    .cache_lookup_counts
                    .with_label_values(&["hit"])
                    .inc();
                return Ok(value);
            }
            self.metrics
                .cache_lookup_counts
                .with_label_values(&["miss"])
                .inc();
        }
        let handle = self.txn.begin(true);
        let snapshot = handle.snapshot();
        let value = table.get_visible(key, snapshot, Some(handle.id()));
        self.txn.finish(&handle, TxState::Committed);
        if let Some(cache) = &self.cache {
            cache.insert_if_current(
                table_id,
                Bytes::copy_from_slice(key),
                value.clone(),
                snapshot,
                || self.txn.last_commit_ts(),
            );
        }
        Ok(value)
    }

    /// Stages a write. With `tx = 0` the engine wraps the write in a
    /// single-statement transaction and commits it before returning.
    pub fn put(&self, tx: TxId, table_id: TableId, key: Bytes, value: Bytes) -> StorageResult<()> {
        self.mutate(tx, table_id, key, Some(value), "put")
    }

    /// Stages a tombstone. Deleting a missing key is not an error.
    pub fn delete(&self, tx: TxId, table_id: TableId, key: Bytes) -> StorageResult<()> {
        self.mutate(tx, table_id, key, None, "delete")
    }

    fn mutate(
        &self,
        tx: TxId,
        table_id: TableId,
        key: Bytes,
        value: Option<Bytes>,
        op: &'static str,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        let table = self.registry.get(table_id)?;
        self.metrics
            .point_op_counts
            .with_label_values(&[table.name(), op])
            .inc();
        if tx.is_auto_commit() {
            let handle = self.txn.begin(false);
            match self.stage_on(&handle, &table, key, value) {
                Ok(()) => self.commit_handle(handle),
                Err(e) => {
                    self.rollback_handle(&handle);
                    Err(e)
                }
            }
        } else {
            let handle = self.op_handle(tx)?;
            if handle.read_only() {
                return Err(StorageError::ReadOnlyViolation(tx));
            }
            self.stage_on(&handle, &table, key, value)
        }
    }

    fn stage_on(
        &self,
        handle: &Arc<TxHandle>,
        table: &Arc<Table>,
        key: Bytes,
        value: Option<Bytes>,
    ) -> StorageResult<()> {
        table
            .stage_write(handle.id(), key.clone(), value)
            .map_err(|_owner| StorageError::WriteConflict {
                table: table.id(),
                key: key.clone(),
            })?;
        handle.record_write(table.id(), key.clone());
        if handle.state() != TxState::Active {
            // lost a race with a concurrent abort whose cleanup missed this
            // entry; undo it so the key is not blocked forever
            let keys = std::collections::BTreeSet::from([key]);
            table.unstage_all(handle.id(), &keys);
            return Err(StorageError::Cancelled(handle.id()));
        }
        Ok(())
    }

    // ----- scans -----

    /// Opens an ordered scan of `[lo, hi]` with the stated inclusiveness;
    /// `None` bounds are unbounded. `limit = 0` means no limit. The
    /// iterator holds the transaction's snapshot (or its own auto-commit
    /// snapshot) for its lifetime.
    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &self,
        tx: TxId,
        table_id: TableId,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        lo_inclusive: bool,
        hi_inclusive: bool,
        limit: usize,
    ) -> StorageResult<StoreIter> {
        let lo = match lo {
            None => Bound::Unbounded,
            Some(k) if lo_inclusive => Bound::Included(Bytes::copy_from_slice(k)),
            Some(k) => Bound::Excluded(Bytes::copy_from_slice(k)),
        };
        let hi = match hi {
            None => Bound::Unbounded,
            Some(k) if hi_inclusive => Bound::Included(Bytes::copy_from_slice(k)),
            Some(k) => Bound::Excluded(Bytes::copy_from_slice(k)),
        };
        self.scan_bounds(tx, table_id, (lo, hi), limit)
    }

    pub(crate) fn scan_bounds(
        &self,
        tx: TxId,
        table_id: TableId,
        range: (Bound<Bytes>, Bound<Bytes>),
        limit: usize,
    ) -> StorageResult<StoreIter> {
        self.ensure_open()?;
        let table = self.registry.get(table_id)?;
        self.metrics
            .point_op_counts
            .with_label_values(&[table.name(), "scan"])
            .inc();
        let binding = if tx.is_auto_commit() {
            TxBinding::Auto(ReadGuard::new(self.txn.clone(), self.txn.begin(true)))
        } else {
            TxBinding::Caller(self.op_handle(tx)?)
        };
        Ok(StoreIter::new(
            table,
            range,
            binding,
            limit,
            self.metrics.clone(),
        ))
    }

    // ----- recovery and teardown -----

    /// Applies a committed write-ahead stream, in commit-timestamp order,
    /// before the engine serves traffic. Records for unknown tables are
    /// skipped with a warning.
    pub fn replay(&self, records: &[CommitRecord]) -> StorageResult<()> {
        self.ensure_open()?;
        let _commit_guard = self.txn.commit_lock();
        let mut last_ts = self.txn.last_commit_ts();
        for record in records {
            if record.commit_ts < last_ts {
                return Err(StorageError::InvalidState(format!(
                    "write-ahead records out of order: {} after {}",
                    record.commit_ts, last_ts
                )));
            }
            let Some(table) = self.registry.try_get(record.table_id) else {
                warn!(table = %record.table_id, "skipping replay record for unknown table");
                continue;
            };
            table.install_committed(record.key.clone(), record.commit_ts, record.value.clone());
            last_ts = record.commit_ts;
        }
        self.txn.advance_commit_ts(last_ts);
        debug!(commit_ts = last_ts, "replayed write-ahead stream");
        Ok(())
    }

    /// Drains active transactions and drops all tables. Idempotent; all
    /// handles are invalid afterwards.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.txn.active_transactions() {
            self.rollback_handle(&handle);
        }
        self.registry.clear();
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        debug!("storage engine shut down");
    }

    // ----- internals -----

    /// Resolves a caller-supplied handle for an operation. Terminal and
    /// unknown handles fail with `Cancelled`.
    fn op_handle(&self, tx: TxId) -> StorageResult<Arc<TxHandle>> {
        self.txn.lookup(tx).ok_or(StorageError::Cancelled(tx))
    }

    fn commit_handle(&self, handle: Arc<TxHandle>) -> StorageResult<()> {
        let _commit_guard = self.txn.commit_lock();
        if handle.state() != TxState::Active {
            return Err(StorageError::InvalidState(format!(
                "transaction {} is already terminal",
                handle.id()
            )));
        }
        let writes = handle.write_set();
        if handle.read_only() || writes.is_empty() {
            self.txn.finish(&handle, TxState::Committed);
            self.metrics
                .tx_finish_counts
                .with_label_values(&["committed"])
                .inc();
            return Ok(());
        }

        let snapshot = handle.snapshot();
        let mut conflict: Option<(TableId, Bytes)> = None;
        'validate: for (&table_id, keys) in &writes {
            // A table dropped mid-flight took its pending entries with it.
            let Some(table) = self.registry.try_get(table_id) else {
                continue;
            };
            for key in keys {
                if table.newest_commit_ts(key).is_some_and(|ts| ts > snapshot) {
                    conflict = Some((table_id, key.clone()));
                    break 'validate;
                }
            }
        }
        if conflict.is_none() && self.config.isolation_level == IsolationLevel::Serializable {
            for (table_id, key) in handle.read_set() {
                if writes.get(&table_id).is_some_and(|keys| keys.contains(&key)) {
                    continue;
                }
                let Some(table) = self.registry.try_get(table_id) else {
                    continue;
                };
                if table.newest_commit_ts(&key).is_some_and(|ts| ts > snapshot) {
                    conflict = Some((table_id, key));
                    break;
                }
            }
        }
        if let Some((table_id, key)) = conflict {
            self.rollback_writes(&handle, &writes);
            self.txn.finish(&handle, TxState::Aborted);
            self.metrics
                .tx_finish_counts
                .with_label_values(&["conflict"])
                .inc();
            debug!(tx = %handle.id(), table = %table_id, "commit validation failed");
            return Err(StorageError::WriteConflict {
                table: table_id,
                key,
            });
        }

        let commit_ts = self.txn.last_commit_ts() + 1;
        if let Some(durability) = &self.durability {
            let mut records = Vec::new();
            for (&table_id, keys) in &writes {
                let Some(table) = self.registry.try_get(table_id) else {
                    continue;
                };
                for key in keys {
                    if let Some(value) = table.pending_value(handle.id(), key) {
                        records.push(CommitRecord {
                            commit_ts,
                            table_id,
                            key: key.clone(),
                            value,
                        });
                    }
                }
            }
            if let Err(e) = durability.append(&records) {
                self.rollback_writes(&handle, &writes);
                self.txn.finish(&handle, TxState::Aborted);
                self.metrics
                    .tx_finish_counts
                    .with_label_values(&["aborted"])
                    .inc();
                return Err(e);
            }
        }

        // Publish per table in ascending handle order, then advance the
        // clock; the writes become visible to new snapshots atomically.
        let watermark = self.txn.oldest_live_snapshot();
        let mut published = 0usize;
        for (&table_id, keys) in &writes {
            let Some(table) = self.registry.try_get(table_id) else {
                continue;
            };
            table.publish(handle.id(), keys, commit_ts, watermark);
            published += keys.len();
        }
        self.txn.advance_commit_ts(commit_ts);
        if let Some(cache) = &self.cache {
            cache.invalidate(
                writes
                    .iter()
                    .flat_map(|(&table_id, keys)| keys.iter().map(move |key| (table_id, key))),
            );
        }
        self.txn.finish(&handle, TxState::Committed);
        self.metrics.commit_write_set_size.observe(published as f64);
        self.metrics
            .tx_finish_counts
            .with_label_values(&["committed"])
            .inc();
        Ok(())
    }

    /// Aborts the transaction unless it already reached a terminal state.
    /// Returns whether this call performed the abort.
    fn rollback_handle(&self, handle: &Arc<TxHandle>) -> bool {
        let _commit_guard = self.txn.commit_lock();
        if handle.state() != TxState::Active || self.txn.lookup(handle.id()).is_none() {
            return false;
        }
        let writes = handle.write_set();
        self.rollback_writes(handle, &writes);
        self.txn.finish(handle, TxState::Aborted);
        self.metrics
            .tx_finish_counts
            .with_label_values(&["aborted"])
            .inc();
        true
    }

    fn rollback_writes(
        &self,
        handle: &Arc<TxHandle>,
        writes: &std::collections::BTreeMap<TableId, std::collections::BTreeSet<Bytes>>,
    ) {
        for (&table_id, keys) in writes {
            if let Some(table) = self.registry.try_get(table_id) {
                table.unstage_all(handle.id(), keys);
            }
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine").finish_non_exhaustive()
    }
}
