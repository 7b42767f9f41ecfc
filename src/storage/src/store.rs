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

//! The programmatic surface the graph layer consumes: a long-lived store
//! environment plus typed store views (schema / graph / system) that
//! pre-register their table rosters over the same engine.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use graphstore_common::catalog::{TableId, TableKind};
use graphstore_common::config::StoreConfig;
use tracing::debug;

use crate::dispatch::{self, QueryIter, TableQuery};
use crate::engine::iter::StoreIter;
use crate::engine::txn::TxId;
use crate::engine::StorageEngine;
use crate::error::StorageResult;
use crate::session::pool::SessionPool;
use crate::session::Session;
use crate::wal::Durability;

/// The three store roles of a graph deployment. Each pre-registers a fixed
/// roster of kind-tagged tables; the polymorphism is data, not dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Schema,
    Graph,
    System,
}

impl StoreKind {
    /// The tables a store of this role registers at open.
    pub fn table_roster(&self) -> &'static [(&'static str, TableKind)] {
        match self {
            StoreKind::Schema => &[
                ("property_keys", TableKind::PropertyKey),
                ("vertex_labels", TableKind::VertexLabel),
                ("edge_labels", TableKind::EdgeLabel),
                ("index_labels", TableKind::IndexLabel),
                ("schema_counters", TableKind::Counter),
            ],
            StoreKind::Graph => &[
                ("vertices", TableKind::Vertex),
                ("out_edges", TableKind::EdgeOut),
                ("in_edges", TableKind::EdgeIn),
                ("secondary_indexes", TableKind::SecondaryIndex),
                ("range_indexes", TableKind::RangeIndex),
                ("search_indexes", TableKind::SearchIndex),
                ("graph_counters", TableKind::Counter),
            ],
            StoreKind::System => &[
                ("system_meta", TableKind::SystemMeta),
                ("system_counters", TableKind::Counter),
            ],
        }
    }
}

static GLOBAL_STORE_ENV: OnceLock<Arc<StoreEnv>> = OnceLock::new();

/// The long-lived engine object of a process: constructed by
/// [`init`](StoreEnv::init) (or [`new`](StoreEnv::new) for a private
/// instance) and consumed by [`shutdown`](StoreEnv::shutdown).
pub struct StoreEnv {
    engine: Arc<StorageEngine>,
    pool: SessionPool,
}

impl StoreEnv {
    /// A private environment, unrelated to the process-wide one.
    pub fn new(config: StoreConfig) -> Arc<StoreEnv> {
        Self::with_durability(config, None)
    }

    pub fn with_durability(
        config: StoreConfig,
        durability: Option<Arc<dyn Durability>>,
    ) -> Arc<StoreEnv> {
        let engine = Arc::new(StorageEngine::with_durability(config, durability));
        let pool = SessionPool::new(engine.clone());
        Arc::new(StoreEnv { engine, pool })
    }

    /// Initializes the process-wide environment exactly once.
    /// Re-initialization is a no-op returning the existing instance.
    pub fn init(config: StoreConfig) -> Arc<StoreEnv> {
        let mut fresh = false;
        let env = GLOBAL_STORE_ENV.get_or_init(|| {
            fresh = true;
            StoreEnv::new(config)
        });
        if !fresh {
            debug!("store environment already initialized, reusing it");
        }
        env.clone()
    }

    /// The initialized process-wide environment, if any.
    pub fn try_global() -> Option<Arc<StoreEnv>> {
        GLOBAL_STORE_ENV.get().cloned()
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// The calling thread's session.
    pub fn session(&self) -> Arc<Session> {
        self.pool.session()
    }

    pub fn session_pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Opens a typed store view, registering its table roster (idempotent).
    pub fn open_store(&self, kind: StoreKind) -> StorageResult<Store> {
        for &(name, table_kind) in kind.table_roster() {
            self.engine.create_table(name, table_kind)?;
        }
        Ok(Store {
            engine: self.engine.clone(),
            kind,
        })
    }

    /// Drains active transactions, closes sessions, and drops all tables.
    /// Idempotent; every handle is invalid afterwards.
    pub fn shutdown(&self) {
        self.pool.close_all();
        self.engine.shutdown();
    }

    // ----- direct operation surface -----

    /// Creates a caller-defined table (idempotent), returning its handle.
    pub fn create_table(&self, name: &str) -> StorageResult<TableId> {
        Ok(self.engine.create_table(name, TableKind::Unknown)?.id())
    }

    pub fn drop_table(&self, name: &str) -> StorageResult<()> {
        self.engine.drop_table(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.engine.has_table(name)
    }

    pub fn begin_tx(&self) -> StorageResult<TxId> {
        self.engine.begin()
    }

    pub fn commit_tx(&self, tx: TxId) -> StorageResult<()> {
        self.engine.commit(tx)
    }

    pub fn abort_tx(&self, tx: TxId) {
        self.engine.abort(tx)
    }

    pub fn get(&self, tx: TxId, table: &str, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.engine.get(tx, self.table(table)?, key)
    }

    pub fn put(&self, tx: TxId, table: &str, key: Bytes, value: Bytes) -> StorageResult<()> {
        self.engine.put(tx, self.table(table)?, key, value)
    }

    pub fn delete(&self, tx: TxId, table: &str, key: Bytes) -> StorageResult<()> {
        self.engine.delete(tx, self.table(table)?, key)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn scan(
        &self,
        tx: TxId,
        table: &str,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        lo_inclusive: bool,
        hi_inclusive: bool,
        limit: usize,
    ) -> StorageResult<StoreIter> {
        self.engine
            .scan(tx, self.table(table)?, lo, hi, lo_inclusive, hi_inclusive, limit)
    }

    fn table(&self, name: &str) -> StorageResult<TableId> {
        Ok(self.engine.registry().open(name)?.id())
    }
}

impl std::fmt::Debug for StoreEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEnv").finish_non_exhaustive()
    }
}

/// A typed view over the shared engine, scoped to one store role's tables.
pub struct Store {
    engine: Arc<StorageEngine>,
    kind: StoreKind,
}

impl Store {
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Handle of one of this store's roster tables.
    pub fn table(&self, name: &str) -> StorageResult<TableId> {
        Ok(self.engine.registry().open(name)?.id())
    }

    /// Dispatches a classified query against one of this store's tables.
    pub fn query(&self, tx: TxId, table: &str, query: TableQuery) -> StorageResult<QueryIter> {
        let table_id = self.table(table)?;
        dispatch::dispatch(&self.engine, tx, table_id, query)
    }

    /// Clears every roster table of this store, keeping the handles live.
    pub fn truncate(&self) -> StorageResult<()> {
        for &(name, _) in self.kind.table_roster() {
            self.engine.truncate_table(name)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("kind", &self.kind).finish()
    }
}
