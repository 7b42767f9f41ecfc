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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use graphstore_common::catalog::{TableId, TableKind};
use itertools::Itertools;
use parking_lot::RwLock;
use tracing::debug;

use crate::engine::table::Table;
use crate::error::{StorageError, StorageResult};

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, TableId>,
    tables: BTreeMap<TableId, Arc<Table>>,
    next_table_id: u32,
}

/// Owner of all table handles.
///
/// Names are unique while a table is live. Dropping a table and recreating
/// the name yields a fresh handle; the old handle stays invalid forever.
/// Mutations serialize on the writer lock, lookups share the reader lock.
pub struct TableRegistry {
    inner: RwLock<RegistryInner>,
}

impl TableRegistry {
    pub fn new() -> Self {
        TableRegistry {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Creates the table, or returns the existing handle if the name is
    /// already registered with the same kind. Idempotent at the caller
    /// level; a kind mismatch is a real collision.
    pub fn create(&self, name: &str, kind: TableKind) -> StorageResult<Arc<Table>> {
        assert!(!name.is_empty(), "table name must not be empty");
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_name.get(name) {
            let table = inner.tables[&id].clone();
            if table.kind() != kind {
                return Err(StorageError::AlreadyExists(format!(
                    "table {:?} exists with kind {}",
                    name,
                    table.kind()
                )));
            }
            return Ok(table);
        }
        let id = TableId::new(inner.next_table_id);
        inner.next_table_id = inner
            .next_table_id
            .checked_add(1)
            .ok_or_else(|| StorageError::Fatal("table handle space exhausted".into()))?;
        let table = Arc::new(Table::new(id, name.to_owned(), kind));
        inner.by_name.insert(name.to_owned(), id);
        inner.tables.insert(id, table.clone());
        debug!(name, %id, ?kind, "created table");
        Ok(table)
    }

    /// Drops the table behind the handle, removing all of its keys.
    /// Subsequent use of the handle fails with `InvalidHandle`.
    pub fn drop_handle(&self, id: TableId) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let Some(table) = inner.tables.remove(&id) else {
            return Err(StorageError::NotFound(format!("table handle {}", id)));
        };
        inner.by_name.remove(table.name());
        table.clear();
        debug!(name = table.name(), %id, "dropped table");
        Ok(())
    }

    /// Drops the table by name.
    pub fn drop_table(&self, name: &str) -> StorageResult<()> {
        let id = {
            let inner = self.inner.read();
            inner.by_name.get(name).copied()
        };
        match id {
            Some(id) => self.drop_handle(id),
            None => Err(StorageError::NotFound(format!("table {:?}", name))),
        }
    }

    pub fn open(&self, name: &str) -> StorageResult<Arc<Table>> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .map(|id| inner.tables[id].clone())
            .ok_or_else(|| StorageError::NotFound(format!("table {:?}", name)))
    }

    pub fn get(&self, id: TableId) -> StorageResult<Arc<Table>> {
        self.try_get(id).ok_or(StorageError::InvalidHandle(id))
    }

    pub fn try_get(&self, id: TableId) -> Option<Arc<Table>> {
        self.inner.read().tables.get(&id).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.read().by_name.contains_key(name)
    }

    /// All live tables as `(name, handle)`, ordered by name.
    pub fn list(&self) -> Vec<(String, TableId)> {
        self.inner
            .read()
            .by_name
            .iter()
            .map(|(name, &id)| (name.clone(), id))
            .sorted()
            .collect_vec()
    }

    /// Drops every table. Part of engine teardown; handle allocation is
    /// not reset, so stale handles stay invalid.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        for table in inner.tables.values() {
            table.clear();
        }
        inner.tables.clear();
        inner.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_idempotent() {
        let registry = TableRegistry::new();
        let t1 = registry.create("t", TableKind::Unknown).unwrap();
        let t2 = registry.create("t", TableKind::Unknown).unwrap();
        assert_eq!(t1.id(), t2.id());
    }

    #[test]
    fn test_create_with_other_kind_collides() {
        let registry = TableRegistry::new();
        registry.create("t", TableKind::Unknown).unwrap();
        assert!(matches!(
            registry.create("t", TableKind::Vertex),
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_drop_then_recreate_never_reuses_handle() {
        let registry = TableRegistry::new();
        let old = registry.create("t", TableKind::Unknown).unwrap();
        registry.drop_table("t").unwrap();
        let new = registry.create("t", TableKind::Unknown).unwrap();
        assert_ne!(old.id(), new.id());
        assert!(matches!(
            registry.get(old.id()),
            Err(StorageError::InvalidHandle(_))
        ));
        assert_eq!(registry.get(new.id()).unwrap().id(), new.id());
    }

    #[test]
    fn test_drop_missing_fails_not_found() {
        let registry = TableRegistry::new();
        assert!(registry.drop_table("ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn test_open_exists_list() {
        let registry = TableRegistry::new();
        registry.create("b", TableKind::Unknown).unwrap();
        registry.create("a", TableKind::Vertex).unwrap();

        assert!(registry.exists("a"));
        assert!(!registry.exists("c"));
        assert!(registry.open("a").is_ok());
        assert!(registry.open("c").unwrap_err().is_not_found());

        let names: Vec<_> = registry.list().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
