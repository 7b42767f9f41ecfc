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

//! Sessions buffer writes against named tables and replay them in
//! insertion order inside one transaction at commit. Reads are never
//! buffered; they run immediately under the session's open transaction, or
//! under auto-commit.

pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use graphstore_common::catalog::TableId;
use graphstore_common::util::key::prefixed_range;
use graphstore_common::util::value_encoding::{
    deserialize_columns, deserialize_counter, serialize_columns, serialize_counter, ColumnPair,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::iter::StoreIter;
use crate::engine::txn::{TxId, AUTO_COMMIT_TX};
use crate::engine::StorageEngine;
use crate::error::{StorageError, StorageResult};

/// Internal retry budget for counter read-modify-write transactions.
/// Counter conflicts are rare; anything beyond this surfaces to the caller.
const COUNTER_RETRY_LIMIT: usize = 5;

#[derive(Clone, Debug)]
enum PendingOp {
    Put {
        table: String,
        key: Bytes,
        value: Bytes,
    },
    Delete {
        table: String,
        key: Bytes,
    },
    DeletePrefix {
        table: String,
        prefix: Bytes,
    },
    DeleteRange {
        table: String,
        lo: Bytes,
        hi: Bytes,
    },
}

struct SessionInner {
    buffer: Vec<PendingOp>,
    tx: Option<TxId>,
    /// Table handles resolved by name, re-validated against the registry
    /// on use so a drop-and-recreate is picked up.
    table_ids: HashMap<String, TableId>,
    closed: bool,
}

/// A per-caller handle onto the engine. Not meant to be shared between
/// threads; obtain one per thread from the [`pool::SessionPool`].
pub struct Session {
    engine: Arc<StorageEngine>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Session {
            engine,
            inner: Mutex::new(SessionInner {
                buffer: Vec::new(),
                tx: None,
                table_ids: HashMap::new(),
                closed: false,
            }),
        }
    }

    // ----- transaction control -----

    /// Begins an explicit transaction owned by this session. Reads and the
    /// commit replay run under it until commit or rollback.
    pub fn begin(&self) -> StorageResult<TxId> {
        let mut inner = self.lock_open()?;
        if inner.tx.is_some() {
            return Err(StorageError::InvalidState(
                "session already has an active transaction".into(),
            ));
        }
        let tx = self.engine.begin()?;
        inner.tx = Some(tx);
        Ok(tx)
    }

    pub fn current_tx(&self) -> Option<TxId> {
        self.inner.lock().tx
    }

    /// Replays the buffered operations in insertion order inside one
    /// transaction and commits it. An empty buffer with no open
    /// transaction is a successful no-op. On failure the transaction is
    /// aborted and the buffer is left cleared.
    pub fn commit(&self) -> StorageResult<()> {
        let mut inner = self.lock_open()?;
        self.commit_locked(&mut inner)
    }

    /// Clears the buffer and aborts the open transaction, if any.
    pub fn rollback(&self) -> StorageResult<()> {
        let mut inner = self.lock_open()?;
        self.rollback_locked(&mut inner);
        Ok(())
    }

    pub fn has_changes(&self) -> bool {
        let inner = self.inner.lock();
        !inner.buffer.is_empty()
    }

    // ----- buffered writes -----

    pub fn put(&self, table: &str, key: Bytes, value: Bytes) -> StorageResult<()> {
        self.append(PendingOp::Put {
            table: table.to_owned(),
            key,
            value,
        })
    }

    pub fn delete(&self, table: &str, key: Bytes) -> StorageResult<()> {
        self.append(PendingOp::Delete {
            table: table.to_owned(),
            key,
        })
    }

    /// Buffers the deletion of every key starting with `prefix`. The
    /// matching keys are enumerated at commit time, inside the commit's
    /// transaction, so the expansion is atomic with the rest of the batch.
    pub fn delete_prefix(&self, table: &str, prefix: Bytes) -> StorageResult<()> {
        self.append(PendingOp::DeletePrefix {
            table: table.to_owned(),
            prefix,
        })
    }

    /// Buffers the deletion of every key in `[lo, hi)`, expanded at commit
    /// time like [`delete_prefix`](Session::delete_prefix).
    pub fn delete_range(&self, table: &str, lo: Bytes, hi: Bytes) -> StorageResult<()> {
        self.append(PendingOp::DeleteRange {
            table: table.to_owned(),
            lo,
            hi,
        })
    }

    fn append(&self, op: PendingOp) -> StorageResult<()> {
        let mut inner = self.lock_open()?;
        // batch_max_ops is a soft ceiling: reaching it flushes the buffer
        // before the new op is buffered.
        if inner.buffer.len() >= self.engine.config().batch_max_ops {
            debug!(
                buffered = inner.buffer.len(),
                "session buffer reached batch_max_ops, flushing"
            );
            self.flush_locked(&mut inner)?;
        }
        inner.buffer.push(op);
        Ok(())
    }

    // ----- immediate reads -----

    pub fn get(&self, table: &str, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let (tid, tx) = {
            let mut inner = self.lock_open()?;
            let tid = self.resolve(&mut inner, table)?;
            (tid, inner.tx.unwrap_or(AUTO_COMMIT_TX))
        };
        self.engine.get(tx, tid, key)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &self,
        table: &str,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        lo_inclusive: bool,
        hi_inclusive: bool,
        limit: usize,
    ) -> StorageResult<StoreIter> {
        let (tid, tx) = {
            let mut inner = self.lock_open()?;
            let tid = self.resolve(&mut inner, table)?;
            (tid, inner.tx.unwrap_or(AUTO_COMMIT_TX))
        };
        self.engine
            .scan(tx, tid, lo, hi, lo_inclusive, hi_inclusive, limit)
    }

    /// Buffers a put of a column row, serialized with the value codec.
    pub fn put_columns(
        &self,
        table: &str,
        key: Bytes,
        columns: &[ColumnPair],
    ) -> StorageResult<()> {
        let value = serialize_columns(columns)?;
        self.put(table, key, value)
    }

    /// Reads a column row back, decoding the stored value.
    pub fn get_columns(&self, table: &str, key: &[u8]) -> StorageResult<Option<Vec<ColumnPair>>> {
        match self.get(table, key)? {
            Some(raw) => Ok(Some(deserialize_columns(&raw)?)),
            None => Ok(None),
        }
    }

    // ----- counters -----

    /// Atomically adds `delta` to the unsigned counter under `key`,
    /// creating it at zero if absent, and returns the new value.
    ///
    /// The pending buffer is flushed first; the read-modify-write then runs
    /// as its own transaction, observing the latest committed value, with a
    /// small internal retry budget for conflicts.
    pub fn increase(&self, table: &str, key: &[u8], delta: u64) -> StorageResult<u64> {
        let tid = {
            let mut inner = self.lock_open()?;
            if inner.tx.is_some() {
                return Err(StorageError::InvalidState(
                    "counter increase is not supported inside an explicit transaction".into(),
                ));
            }
            self.commit_locked(&mut inner)?;
            self.resolve(&mut inner, table)?
        };

        let endianness = self.engine.config().counter_endianness;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tx = self.engine.begin()?;
            let result: StorageResult<u64> = (|| {
                let current = match self.engine.get(tx, tid, key)? {
                    Some(raw) => deserialize_counter(&raw, endianness)?,
                    None => 0,
                };
                let next = current.wrapping_add(delta);
                self.engine.put(
                    tx,
                    tid,
                    Bytes::copy_from_slice(key),
                    serialize_counter(next, endianness),
                )?;
                Ok(next)
            })();
            match result {
                Ok(next) => match self.engine.commit(tx) {
                    Ok(()) => return Ok(next),
                    Err(e) if e.is_write_conflict() && attempt < COUNTER_RETRY_LIMIT => {
                        debug!(table, attempt, "counter increase conflicted, retrying");
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    self.engine.abort(tx);
                    if e.is_write_conflict() && attempt < COUNTER_RETRY_LIMIT {
                        debug!(table, attempt, "counter increase conflicted, retrying");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    // ----- lifecycle -----

    /// Closes the session. Pending state is rolled back with a warning.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if !inner.buffer.is_empty() || inner.tx.is_some() {
            warn!(
                buffered = inner.buffer.len(),
                open_tx = inner.tx.is_some(),
                "closing session with pending state, rolling back"
            );
            self.rollback_locked(&mut inner);
        }
        inner.closed = true;
    }

    // ----- internals -----

    fn lock_open(&self) -> StorageResult<parking_lot::MutexGuard<'_, SessionInner>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(StorageError::InvalidState("session is closed".into()));
        }
        Ok(inner)
    }

    fn commit_locked(&self, inner: &mut SessionInner) -> StorageResult<()> {
        let ops = std::mem::take(&mut inner.buffer);
        if ops.is_empty() && inner.tx.is_none() {
            return Ok(());
        }
        let tx = match inner.tx.take() {
            Some(tx) => tx,
            None => self.engine.begin()?,
        };
        match self.replay(inner, tx, ops) {
            Ok(()) => self.engine.commit(tx),
            Err(e) => {
                self.engine.abort(tx);
                Err(e)
            }
        }
    }

    /// Drains the buffer without ending an explicitly begun transaction:
    /// buffered ops are replayed into it, staying atomic with the rest of
    /// that transaction. With no open transaction this is a commit cycle.
    fn flush_locked(&self, inner: &mut SessionInner) -> StorageResult<()> {
        match inner.tx {
            Some(tx) => {
                let ops = std::mem::take(&mut inner.buffer);
                self.replay(inner, tx, ops).inspect_err(|_| {
                    self.engine.abort(tx);
                    inner.tx = None;
                })
            }
            None => self.commit_locked(inner),
        }
    }

    fn rollback_locked(&self, inner: &mut SessionInner) {
        inner.buffer.clear();
        if let Some(tx) = inner.tx.take() {
            self.engine.abort(tx);
        }
    }

    fn replay(&self, inner: &mut SessionInner, tx: TxId, ops: Vec<PendingOp>) -> StorageResult<()> {
        for op in ops {
            match op {
                PendingOp::Put { table, key, value } => {
                    let tid = self.resolve(inner, &table)?;
                    self.engine.put(tx, tid, key, value)?;
                }
                PendingOp::Delete { table, key } => {
                    let tid = self.resolve(inner, &table)?;
                    self.engine.delete(tx, tid, key)?;
                }
                PendingOp::DeletePrefix { table, prefix } => {
                    let tid = self.resolve(inner, &table)?;
                    let range = prefixed_range::<_, &[u8]>(.., &prefix);
                    let entries = self.engine.scan_bounds(tx, tid, range, 0)?.materialize()?;
                    for (key, _) in entries {
                        self.engine.delete(tx, tid, key)?;
                    }
                }
                PendingOp::DeleteRange { table, lo, hi } => {
                    let tid = self.resolve(inner, &table)?;
                    self.delete_scanned(tx, tid, Some(&lo), Some(&hi))?;
                }
            }
        }
        Ok(())
    }

    /// Deletes every live key of `[lo, hi)`, enumerated inside `tx`.
    fn delete_scanned(
        &self,
        tx: TxId,
        tid: TableId,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> StorageResult<()> {
        let entries = self
            .engine
            .scan(tx, tid, lo, hi, true, false, 0)?
            .materialize()?;
        for (key, _) in entries {
            self.engine.delete(tx, tid, key)?;
        }
        Ok(())
    }

    /// Looks the table up by name, caching the numeric handle and
    /// re-resolving if the cached handle went stale.
    fn resolve(&self, inner: &mut SessionInner, table: &str) -> StorageResult<TableId> {
        if let Some(&id) = inner.table_ids.get(table) {
            if self.engine.registry().try_get(id).is_some() {
                return Ok(id);
            }
            inner.table_ids.remove(table);
        }
        let id = self.engine.registry().open(table)?.id();
        inner.table_ids.insert(table.to_owned(), id);
        Ok(id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use graphstore_common::catalog::TableKind;
    use graphstore_common::config::StoreConfig;

    use super::*;

    fn session_with_table() -> Session {
        let engine = Arc::new(StorageEngine::for_test());
        engine.create_table("t", TableKind::Unknown).unwrap();
        Session::new(engine)
    }

    fn b(raw: &'static [u8]) -> Bytes {
        Bytes::from_static(raw)
    }

    #[test]
    fn test_buffered_writes_invisible_until_commit() {
        let session = session_with_table();
        session.put("t", b(b"k"), b(b"v")).unwrap();
        assert!(session.has_changes());
        assert_eq!(session.get("t", b"k").unwrap(), None);

        session.commit().unwrap();
        assert!(!session.has_changes());
        assert_eq!(session.get("t", b"k").unwrap(), Some(b(b"v")));
    }

    #[test]
    fn test_replay_preserves_insertion_order() {
        let session = session_with_table();
        session.put("t", b(b"k"), b(b"first")).unwrap();
        session.delete("t", b(b"k")).unwrap();
        session.put("t", b(b"k"), b(b"last")).unwrap();
        session.commit().unwrap();
        assert_eq!(session.get("t", b"k").unwrap(), Some(b(b"last")));
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let session = session_with_table();
        session.commit().unwrap();
    }

    #[test]
    fn test_rollback_clears_buffer() {
        let session = session_with_table();
        session.put("t", b(b"k"), b(b"v")).unwrap();
        session.rollback().unwrap();
        assert!(!session.has_changes());
        session.commit().unwrap();
        assert_eq!(session.get("t", b"k").unwrap(), None);
    }

    #[test]
    fn test_delete_prefix_expansion_is_atomic() {
        let session = session_with_table();
        session.put("t", b(b"pfx_a"), b(b"1")).unwrap();
        session.put("t", b(b"pfx_b"), b(b"2")).unwrap();
        session.put("t", b(b"other"), b(b"3")).unwrap();
        session.commit().unwrap();

        session.delete_prefix("t", b(b"pfx")).unwrap();
        session.commit().unwrap();
        assert_eq!(session.get("t", b"pfx_a").unwrap(), None);
        assert_eq!(session.get("t", b"pfx_b").unwrap(), None);
        assert_eq!(session.get("t", b"other").unwrap(), Some(b(b"3")));
    }

    #[test]
    fn test_delete_range_half_open() {
        let session = session_with_table();
        for key in [b"a", b"b", b"c", b"d"] {
            session
                .put("t", Bytes::copy_from_slice(key), b(b"v"))
                .unwrap();
        }
        session.commit().unwrap();

        session.delete_range("t", b(b"b"), b(b"d")).unwrap();
        session.commit().unwrap();
        assert_eq!(session.get("t", b"a").unwrap(), Some(b(b"v")));
        assert_eq!(session.get("t", b"b").unwrap(), None);
        assert_eq!(session.get("t", b"c").unwrap(), None);
        assert_eq!(session.get("t", b"d").unwrap(), Some(b(b"v")));
    }

    #[test]
    fn test_commit_replays_into_explicit_transaction() {
        let session = session_with_table();
        session.begin().unwrap();
        session.put("t", b(b"k"), b(b"v")).unwrap();
        // buffered, not yet staged under the transaction
        assert_eq!(session.get("t", b"k").unwrap(), None);
        session.commit().unwrap();
        assert_eq!(session.current_tx(), None);
        assert_eq!(session.get("t", b"k").unwrap(), Some(b(b"v")));
    }

    #[test]
    fn test_auto_flush_at_batch_ceiling() {
        let engine = Arc::new(StorageEngine::new(StoreConfig {
            batch_max_ops: 2,
            ..StoreConfig::default()
        }));
        engine.create_table("t", TableKind::Unknown).unwrap();
        let session = Session::new(engine);

        session.put("t", b(b"a"), b(b"1")).unwrap();
        session.put("t", b(b"b"), b(b"2")).unwrap();
        // the third append flushes the first two
        session.put("t", b(b"c"), b(b"3")).unwrap();
        assert_eq!(session.get("t", b"a").unwrap(), Some(b(b"1")));
        assert_eq!(session.get("t", b"c").unwrap(), None);
        session.commit().unwrap();
        assert_eq!(session.get("t", b"c").unwrap(), Some(b(b"3")));
    }

    #[test]
    fn test_column_round_trip_through_session() {
        let session = session_with_table();
        let columns = vec![
            ColumnPair::new(&b"label"[..], &b"person"[..]),
            ColumnPair::new(&b"name"[..], &b"ada"[..]),
        ];
        session.put_columns("t", b(b"v1"), &columns).unwrap();
        session.commit().unwrap();
        assert_eq!(session.get_columns("t", b"v1").unwrap(), Some(columns));
        assert_eq!(session.get_columns("t", b"v2").unwrap(), None);
    }

    #[test]
    fn test_counter_increase() {
        let session = session_with_table();
        assert_eq!(session.increase("t", b"ctr", 5).unwrap(), 5);
        assert_eq!(session.increase("t", b"ctr", 3).unwrap(), 8);

        let endianness = StoreConfig::default().counter_endianness;
        let raw = session.get("t", b"ctr").unwrap().unwrap();
        assert_eq!(deserialize_counter(&raw, endianness).unwrap(), 8);
    }

    #[test]
    fn test_counter_increase_flushes_buffer_first() {
        let session = session_with_table();
        session.put("t", b(b"k"), b(b"v")).unwrap();
        session.increase("t", b"ctr", 1).unwrap();
        // the buffered put was committed by the flush
        assert!(!session.has_changes());
        assert_eq!(session.get("t", b"k").unwrap(), Some(b(b"v")));
    }

    #[test]
    fn test_close_rolls_back_pending_state() {
        let engine = Arc::new(StorageEngine::for_test());
        engine.create_table("t", TableKind::Unknown).unwrap();
        let session = Session::new(engine.clone());
        session.put("t", b(b"k"), b(b"v")).unwrap();
        session.close();

        let fresh = Session::new(engine);
        assert_eq!(fresh.get("t", b"k").unwrap(), None);
    }

    #[test]
    fn test_closed_session_rejects_ops() {
        let session = session_with_table();
        session.close();
        assert!(matches!(
            session.put("t", b(b"k"), b(b"v")),
            Err(StorageError::InvalidState(_))
        ));
        assert!(matches!(
            session.get("t", b"k"),
            Err(StorageError::InvalidState(_))
        ));
    }

    #[test]
    fn test_stale_table_handle_is_rescued() {
        let session = session_with_table();
        session.put("t", b(b"k"), b(b"v")).unwrap();
        session.commit().unwrap();

        let engine = session.engine.clone();
        engine.drop_table("t").unwrap();
        engine.create_table("t", TableKind::Unknown).unwrap();

        // the cached handle is stale; the session re-resolves by name
        assert_eq!(session.get("t", b"k").unwrap(), None);
        session.put("t", b(b"k"), b(b"v2")).unwrap();
        session.commit().unwrap();
        assert_eq!(session.get("t", b"k").unwrap(), Some(b(b"v2")));
    }
}
