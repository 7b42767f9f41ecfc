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

//! Transaction bookkeeping: handle allocation, snapshot registration, the
//! commit clock, and read/write set tracking.
//!
//! The manager owns no table data. Validation and publish walk the tables
//! from the engine, serialized by the manager's commit lock; see
//! `engine::StorageEngine::commit`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use graphstore_common::catalog::TableId;
use parking_lot::{Mutex, MutexGuard};

use crate::engine::version::CommitTs;

/// Transaction handle. Zero is reserved for auto-commit: the engine
/// allocates a single-statement transaction internally, runs the op,
/// commits, and frees it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(u64);

/// The auto-commit sentinel accepted by the engine's operation API.
pub const AUTO_COMMIT_TX: TxId = TxId(0);

impl TxId {
    pub const fn new(id: u64) -> Self {
        TxId(id)
    }

    pub fn is_auto_commit(self) -> bool {
        self == AUTO_COMMIT_TX
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a transaction. `Committed` and `Aborted` are sticky; a
/// terminal handle is never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TxState {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

impl TxState {
    fn from_u8(raw: u8) -> TxState {
        match raw {
            0 => TxState::Active,
            1 => TxState::Committed,
            _ => TxState::Aborted,
        }
    }
}

/// The keys a transaction touched, tracked for conflict detection.
#[derive(Debug, Default)]
pub(crate) struct AccessSets {
    pub reads: HashSet<(TableId, Bytes)>,
    pub writes: BTreeMap<TableId, BTreeSet<Bytes>>,
}

/// Shared per-transaction record. Iterators keep a reference to observe
/// aborts between advances.
#[derive(Debug)]
pub(crate) struct TxHandle {
    id: TxId,
    snapshot: CommitTs,
    read_only: bool,
    started_at: Instant,
    state: AtomicU8,
    pub(crate) sets: Mutex<AccessSets>,
}

impl TxHandle {
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn snapshot(&self) -> CommitTs {
        self.snapshot
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn state(&self) -> TxState {
        TxState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TxState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn record_read(&self, table: TableId, key: Bytes) {
        self.sets.lock().reads.insert((table, key));
    }

    pub fn record_write(&self, table: TableId, key: Bytes) {
        self.sets
            .lock()
            .writes
            .entry(table)
            .or_default()
            .insert(key);
    }

    /// Write set grouped by table, in ascending handle order.
    pub fn write_set(&self) -> BTreeMap<TableId, BTreeSet<Bytes>> {
        self.sets.lock().writes.clone()
    }

    pub fn read_set(&self) -> HashSet<(TableId, Bytes)> {
        self.sets.lock().reads.clone()
    }
}

#[derive(Default)]
struct ManagerInner {
    active: HashMap<TxId, Arc<TxHandle>>,
    /// Refcounted live snapshots, for the trim watermark.
    snapshots: BTreeMap<CommitTs, usize>,
}

/// Allocates transactions and tracks the global commit clock and the set of
/// live snapshots.
pub(crate) struct TransactionManager {
    next_tx_id: AtomicU64,
    last_commit_ts: AtomicU64,
    inner: Mutex<ManagerInner>,
    /// Serializes validate-and-publish; held for the whole commit step.
    commit_lock: Mutex<()>,
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            next_tx_id: AtomicU64::new(1),
            last_commit_ts: AtomicU64::new(0),
            inner: Mutex::new(ManagerInner::default()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Allocates a fresh handle with a snapshot at the current commit clock
    /// and registers it.
    pub fn begin(&self, read_only: bool) -> Arc<TxHandle> {
        let id = TxId(self.next_tx_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock();
        // The snapshot is taken under the registration lock so a concurrent
        // commit cannot trim past it before it is refcounted.
        let snapshot = self.last_commit_ts.load(Ordering::Acquire);
        let handle = Arc::new(TxHandle {
            id,
            snapshot,
            read_only,
            started_at: Instant::now(),
            state: AtomicU8::new(TxState::Active as u8),
            sets: Mutex::new(AccessSets::default()),
        });
        inner.active.insert(id, handle.clone());
        *inner.snapshots.entry(snapshot).or_insert(0) += 1;
        handle
    }

    pub fn lookup(&self, tx: TxId) -> Option<Arc<TxHandle>> {
        self.inner.lock().active.get(&tx).cloned()
    }

    pub fn last_commit_ts(&self) -> CommitTs {
        self.last_commit_ts.load(Ordering::Acquire)
    }

    /// Makes every version stamped `commit_ts` visible to new snapshots.
    /// Only called with the commit lock held, after publish completes.
    pub fn advance_commit_ts(&self, commit_ts: CommitTs) {
        self.last_commit_ts.store(commit_ts, Ordering::Release);
    }

    pub fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Moves a transaction to its terminal state and deregisters it.
    pub fn finish(&self, handle: &TxHandle, state: TxState) {
        debug_assert!(state != TxState::Active);
        let mut inner = self.inner.lock();
        if inner.active.remove(&handle.id()).is_some() {
            handle.set_state(state);
            if let Some(count) = inner.snapshots.get_mut(&handle.snapshot()) {
                *count -= 1;
                if *count == 0 {
                    inner.snapshots.remove(&handle.snapshot());
                }
            }
        }
    }

    /// The oldest snapshot any live transaction reads at; versions below it
    /// are unobservable and may be trimmed.
    pub fn oldest_live_snapshot(&self) -> CommitTs {
        self.inner
            .lock()
            .snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.last_commit_ts())
    }

    pub fn active_transactions(&self) -> Vec<Arc<TxHandle>> {
        self.inner.lock().active.values().cloned().collect()
    }

    /// Transactions that outlived `timeout`. The core never aborts on a
    /// timer; callers drive the sweep.
    pub fn expired_transactions(&self, timeout: Duration) -> Vec<Arc<TxHandle>> {
        let now = Instant::now();
        self.inner
            .lock()
            .active
            .values()
            .filter(|handle| now.duration_since(handle.started_at) >= timeout)
            .cloned()
            .collect()
    }
}
