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

use std::sync::Arc;

use bytes::Bytes;
use graphstore_common::catalog::TableKind;
use graphstore_common::config::StoreConfig;
use graphstore_common::util::key::encode_key;
use graphstore_common::util::value_encoding::{serialize_columns, ColumnPair};
use graphstore_storage::dispatch::{Query, RowFilter, TableQuery};
use graphstore_storage::{StoreEnv, StoreKind, AUTO_COMMIT_TX};
use pretty_assertions::assert_eq;

use crate::test_utils::b;

fn graph_env() -> (Arc<StoreEnv>, graphstore_storage::Store) {
    let env = StoreEnv::new(StoreConfig::default());
    let store = env.open_store(StoreKind::Graph).unwrap();
    (env, store)
}

fn put_vertex(env: &StoreEnv, id: &[u8], label: &[u8]) {
    let key = encode_key(TableKind::Vertex, id);
    let value = serialize_columns(&[ColumnPair::new(
        Bytes::from_static(b"label"),
        Bytes::copy_from_slice(label),
    )])
    .unwrap();
    env.put(AUTO_COMMIT_TX, "vertices", key, value).unwrap();
}

#[test]
fn test_point_lookup_through_store() {
    let (env, store) = graph_env();
    put_vertex(&env, b"v1", b"person");

    let query = TableQuery::new(Query::ById {
        ids: vec![encode_key(TableKind::Vertex, b"v1")],
    });
    let entries = store
        .query(AUTO_COMMIT_TX, "vertices", query)
        .unwrap()
        .materialize()
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, encode_key(TableKind::Vertex, b"v1"));
}

#[test]
fn test_full_scan_bounded_by_kind_range() {
    let (env, store) = graph_env();
    put_vertex(&env, b"v1", b"person");
    put_vertex(&env, b"v2", b"place");
    // a stray key outside the vertex kind range must not surface
    env.put(AUTO_COMMIT_TX, "vertices", b(b"zzz_stray"), b(b"noise"))
        .unwrap();

    let query = TableQuery::new(Query::ById { ids: vec![] });
    let entries = store
        .query(AUTO_COMMIT_TX, "vertices", query)
        .unwrap()
        .materialize()
        .unwrap();
    assert_eq!(
        entries.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>(),
        vec![
            encode_key(TableKind::Vertex, b"v1"),
            encode_key(TableKind::Vertex, b"v2"),
        ]
    );
}

#[test]
fn test_prefix_query_resumes_from_cursor() {
    let (env, store) = graph_env();
    for id in [b"p/1", b"p/2", b"p/3"] {
        put_vertex(&env, id, b"person");
    }
    let prefix = encode_key(TableKind::Vertex, b"p/");

    let query = TableQuery::new(Query::ByPrefix {
        prefix: prefix.clone(),
        start: None,
        inclusive_start: true,
    })
    .with_limit(1);
    let mut iter = store.query(AUTO_COMMIT_TX, "vertices", query).unwrap();
    let first = iter.next_entry().unwrap().unwrap();
    assert_eq!(first.0, encode_key(TableKind::Vertex, b"p/1"));
    let cursor = iter.position().clone();

    // resume strictly after the cursor
    let query = TableQuery::new(Query::ByPrefix {
        prefix,
        start: Some(cursor),
        inclusive_start: false,
    });
    let rest = store
        .query(AUTO_COMMIT_TX, "vertices", query)
        .unwrap()
        .materialize()
        .unwrap();
    assert_eq!(
        rest.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>(),
        vec![
            encode_key(TableKind::Vertex, b"p/2"),
            encode_key(TableKind::Vertex, b"p/3"),
        ]
    );
}

#[test]
fn test_limit_plus_one_signals_more() {
    let (env, store) = graph_env();
    for id in [b"a", b"b", b"c", b"d"] {
        put_vertex(&env, id, b"person");
    }
    let query = TableQuery::new(Query::ById { ids: vec![] }).with_limit(2);
    let entries = store
        .query(AUTO_COMMIT_TX, "vertices", query)
        .unwrap()
        .materialize()
        .unwrap();
    // two requested, a third proves there is more
    assert_eq!(entries.len(), 3);
}

#[test]
fn test_condition_query_filters_after_decode() {
    let (env, store) = graph_env();
    put_vertex(&env, b"v1", b"person");
    put_vertex(&env, b"v2", b"place");
    put_vertex(&env, b"v3", b"person");

    let filter: RowFilter = Arc::new(|_key, columns| {
        columns
            .iter()
            .any(|col| col.name.as_ref() == b"label" && col.value.as_ref() == b"person")
    });
    let query = TableQuery::new(Query::ByCondition {
        shard: None,
        filter,
    });
    let entries = store
        .query(AUTO_COMMIT_TX, "vertices", query)
        .unwrap()
        .materialize()
        .unwrap();
    assert_eq!(
        entries.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>(),
        vec![
            encode_key(TableKind::Vertex, b"v1"),
            encode_key(TableKind::Vertex, b"v3"),
        ]
    );
}

#[test]
fn test_paging_loop_drains_table() {
    let (env, store) = graph_env();
    for id in [b"a", b"b", b"c", b"d", b"e"] {
        put_vertex(&env, id, b"person");
    }

    // page through with a logical limit of 2: the extra entry signals more
    let mut cursor: Option<Bytes> = None;
    let mut seen = Vec::new();
    loop {
        let mut query = TableQuery::new(Query::ById { ids: vec![] }).with_limit(2);
        if let Some(cursor) = cursor.clone() {
            query = query.with_page_position(cursor);
        }
        let mut iter = store.query(AUTO_COMMIT_TX, "vertices", query).unwrap();
        let mut page = Vec::new();
        while let Some((key, _)) = iter.next_entry().unwrap() {
            page.push(key);
        }
        let more = page.len() > 2;
        page.truncate(2);
        // skip the first entry of resumed pages: the cursor is inclusive
        let skip = usize::from(cursor.is_some());
        seen.extend(page.iter().skip(skip).cloned());
        if !more {
            break;
        }
        cursor = page.last().cloned();
    }
    assert_eq!(seen.len(), 5);
    assert_eq!(seen.first().unwrap(), &encode_key(TableKind::Vertex, b"a"));
    assert_eq!(seen.last().unwrap(), &encode_key(TableKind::Vertex, b"e"));
}

#[test]
fn test_queries_observe_transaction_snapshot() {
    let (env, store) = graph_env();
    put_vertex(&env, b"v1", b"person");

    let tx = env.begin_tx().unwrap();
    // committed after the snapshot was taken
    put_vertex(&env, b"v2", b"person");

    let query = TableQuery::new(Query::ById { ids: vec![] });
    let entries = store
        .query(tx, "vertices", query)
        .unwrap()
        .materialize()
        .unwrap();
    assert_eq!(entries.len(), 1);
    env.abort_tx(tx);
}
