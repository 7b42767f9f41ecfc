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

//! Query dispatch: classifies an incoming table query (id, id-set, prefix,
//! range, full, condition) into point gets or a bounded ordered scan with
//! the right boundary semantics, and wraps the result in one iterator
//! shape.

use std::ops::Bound;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use graphstore_common::catalog::{TableId, TableKind};
use graphstore_common::util::key::{end_bound_of_prefix, scan_end, scan_start};
use graphstore_common::util::value_encoding::{deserialize_columns, ColumnPair};
use tracing::trace;

use crate::engine::iter::StoreIter;
use crate::engine::txn::TxId;
use crate::engine::StorageEngine;
use crate::error::{StorageError, StorageResult};

/// Point-get fan-out ceiling; larger id sets become range scans when the
/// ids form a dense sorted run, and stay batched otherwise.
pub const BATCH_GET_THRESHOLD: usize = 100;

bitflags! {
    /// Boundary classification of a scan.
    ///
    /// `GTE_BEGIN` carries `GT_BEGIN`'s bit and `LTE_END` carries
    /// `LT_END`'s, so the subset-bits test [`match_scan_type`] answers
    /// "does this scan have a (possibly inclusive) lower/upper bound"
    /// with the weaker flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanType: u32 {
        const PREFIX_BEGIN = 0x01;
        const PREFIX_END = 0x02;
        const GT_BEGIN = 0x04;
        const GTE_BEGIN = 0x0c;
        const LT_END = 0x10;
        const LTE_END = 0x30;
        const ANY = 0x80;
    }
}

/// The subset-bits test: every bit of `expected` is set in `actual`.
pub fn match_scan_type(expected: ScanType, actual: ScanType) -> bool {
    actual.contains(expected)
}

/// Per-entry predicate of a condition query, evaluated after the stored
/// value is decoded back into columns.
pub type RowFilter = Arc<dyn Fn(&[u8], &[ColumnPair]) -> bool + Send + Sync>;

/// One table query, before dispatch.
pub enum Query {
    /// Point gets. Empty id set with no conditions means a full scan of
    /// the table's kind range.
    ById { ids: Vec<Bytes> },
    /// Every key starting with `prefix`, resuming from `start` when given
    /// (`start` must itself begin at or after the prefix).
    ByPrefix {
        prefix: Bytes,
        start: Option<Bytes>,
        inclusive_start: bool,
    },
    ByRange {
        start: Option<Bytes>,
        end: Option<Bytes>,
        inclusive_start: bool,
        inclusive_end: bool,
    },
    /// Condition query: a range scan when the condition pins a single
    /// shard, otherwise a full scan, post-filtered per entry.
    ByCondition {
        shard: Option<(Bytes, Bytes)>,
        filter: RowFilter,
    },
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Query::ById { ids } => f.debug_struct("ById").field("ids", &ids.len()).finish(),
            Query::ByPrefix { prefix, start, inclusive_start } => f
                .debug_struct("ByPrefix")
                .field("prefix", prefix)
                .field("start", start)
                .field("inclusive_start", inclusive_start)
                .finish(),
            Query::ByRange { start, end, inclusive_start, inclusive_end } => f
                .debug_struct("ByRange")
                .field("start", start)
                .field("end", end)
                .field("inclusive_start", inclusive_start)
                .field("inclusive_end", inclusive_end)
                .finish(),
            Query::ByCondition { shard, .. } => {
                f.debug_struct("ByCondition").field("shard", shard).finish()
            }
        }
    }
}

/// A [`Query`] plus limit and paging state.
#[derive(Debug)]
pub struct TableQuery {
    pub query: Query,
    /// Logical limit. `None` means no limit; zero yields an empty iterator
    /// without touching the engine. The engine sees `limit + 1` so the
    /// caller can detect "more available".
    pub limit: Option<u64>,
    /// Resumption cursor: replaces the scan's lower bound, inclusively.
    /// Must not precede the query's own lower bound.
    pub page_position: Option<Bytes>,
}

impl TableQuery {
    pub fn new(query: Query) -> Self {
        TableQuery {
            query,
            limit: None,
            page_position: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_page_position(mut self, page_position: Bytes) -> Self {
        self.page_position = Some(page_position);
        self
    }
}

/// Unified result shape of a dispatch: materialized point gets and lazy
/// scans look the same to the caller, including the resumable
/// [`position`](QueryIter::position) cursor.
pub struct QueryIter {
    inner: QueryIterInner,
    position: Bytes,
}

enum QueryIterInner {
    Empty,
    Materialized(std::vec::IntoIter<(Bytes, Bytes)>),
    Scan(StoreIter),
    Filtered {
        iter: StoreIter,
        filter: RowFilter,
        remaining: Option<u64>,
    },
}

impl QueryIter {
    fn empty() -> Self {
        QueryIter {
            inner: QueryIterInner::Empty,
            position: Bytes::new(),
        }
    }

    fn materialized(entries: Vec<(Bytes, Bytes)>) -> Self {
        QueryIter {
            inner: QueryIterInner::Materialized(entries.into_iter()),
            position: Bytes::new(),
        }
    }

    fn scan(iter: StoreIter) -> Self {
        QueryIter {
            inner: QueryIterInner::Scan(iter),
            position: Bytes::new(),
        }
    }

    fn filtered(iter: StoreIter, filter: RowFilter, remaining: Option<u64>) -> Self {
        QueryIter {
            inner: QueryIterInner::Filtered {
                iter,
                filter,
                remaining,
            },
            position: Bytes::new(),
        }
    }

    /// The key of the last yielded entry; empty on a fresh iterator.
    pub fn position(&self) -> &Bytes {
        &self.position
    }

    pub fn next_entry(&mut self) -> StorageResult<Option<(Bytes, Bytes)>> {
        let next = match &mut self.inner {
            QueryIterInner::Empty => None,
            QueryIterInner::Materialized(entries) => entries.next(),
            QueryIterInner::Scan(iter) => iter.next_entry()?,
            QueryIterInner::Filtered {
                iter,
                filter,
                remaining,
            } => loop {
                if *remaining == Some(0) {
                    break None;
                }
                let Some((key, value)) = iter.next_entry()? else {
                    break None;
                };
                let columns = deserialize_columns(&value)?;
                if filter(&key, &columns) {
                    if let Some(remaining) = remaining {
                        *remaining -= 1;
                    }
                    break Some((key, value));
                }
            },
        };
        if let Some((key, _)) = &next {
            self.position = key.clone();
        }
        Ok(next)
    }

    pub fn materialize(mut self) -> StorageResult<Vec<(Bytes, Bytes)>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl Iterator for QueryIter {
    type Item = StorageResult<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Classifies and executes `query` against one table.
pub fn dispatch(
    engine: &StorageEngine,
    tx: TxId,
    table_id: TableId,
    query: TableQuery,
) -> StorageResult<QueryIter> {
    let TableQuery {
        query,
        limit,
        page_position,
    } = query;
    // A zero limit never touches the engine.
    if limit == Some(0) {
        return Ok(QueryIter::empty());
    }
    let kind = engine.registry().get(table_id)?.kind();
    trace!(%table_id, ?query, ?limit, "dispatching query");
    match query {
        Query::ById { ids } if ids.is_empty() => {
            let flags = ScanType::ANY;
            let bounds = resolve_bounds(kind, flags, None, None, page_position)?;
            let iter = engine.scan_bounds(tx, table_id, bounds, engine_limit(limit))?;
            Ok(QueryIter::scan(iter))
        }
        Query::ById { ids } => dispatch_by_id(engine, tx, table_id, kind, ids, limit, page_position),
        Query::ByPrefix {
            prefix,
            start,
            inclusive_start,
        } => {
            // without a resume point the lower bound is the prefix itself
            let (flags, start) = match start {
                Some(start) if start >= prefix => {
                    let begin = if inclusive_start {
                        ScanType::GTE_BEGIN
                    } else {
                        ScanType::GT_BEGIN
                    };
                    (ScanType::PREFIX_END | begin, start)
                }
                _ => (
                    ScanType::PREFIX_BEGIN | ScanType::PREFIX_END,
                    prefix.clone(),
                ),
            };
            let bounds = resolve_bounds(kind, flags, Some(start), Some(prefix), page_position)?;
            let iter = engine.scan_bounds(tx, table_id, bounds, engine_limit(limit))?;
            Ok(QueryIter::scan(iter))
        }
        Query::ByRange {
            start,
            end,
            inclusive_start,
            inclusive_end,
        } => {
            let mut flags = ScanType::empty();
            if start.is_some() {
                flags |= if inclusive_start {
                    ScanType::GTE_BEGIN
                } else {
                    ScanType::GT_BEGIN
                };
            }
            if end.is_some() {
                flags |= if inclusive_end {
                    ScanType::LTE_END
                } else {
                    ScanType::LT_END
                };
            }
            let bounds = resolve_bounds(kind, flags, start, end, page_position)?;
            let iter = engine.scan_bounds(tx, table_id, bounds, engine_limit(limit))?;
            Ok(QueryIter::scan(iter))
        }
        Query::ByCondition { shard, filter } => {
            let (flags, begin, end) = match shard {
                Some((lo, hi)) => (
                    ScanType::GTE_BEGIN | ScanType::LT_END,
                    Some(lo),
                    Some(hi),
                ),
                None => (ScanType::ANY, None, None),
            };
            let bounds = resolve_bounds(kind, flags, begin, end, page_position)?;
            // the filter applies after decoding, so the limit must too
            let iter = engine.scan_bounds(tx, table_id, bounds, 0)?;
            let remaining = limit.map(|l| l.saturating_add(1));
            Ok(QueryIter::filtered(iter, filter, remaining))
        }
    }
}

fn dispatch_by_id(
    engine: &StorageEngine,
    tx: TxId,
    table_id: TableId,
    kind: TableKind,
    mut ids: Vec<Bytes>,
    limit: Option<u64>,
    page_position: Option<Bytes>,
) -> StorageResult<QueryIter> {
    ids.sort();
    ids.dedup();
    if let Some(page) = page_position {
        // the cursor must lie within the id set's logical bounds
        if ids.first().is_some_and(|first| &page < first) {
            return Err(StorageError::InvalidPage(page));
        }
        ids.retain(|id| *id >= page);
    }

    if ids.len() > BATCH_GET_THRESHOLD && dense_sorted_run(&ids) {
        // a dense run of ids covers a contiguous key range
        let flags = ScanType::GTE_BEGIN | ScanType::LTE_END;
        let first = ids.first().cloned();
        let last = ids.last().cloned();
        let bounds = resolve_bounds(kind, flags, first, last, None)?;
        let iter = engine.scan_bounds(tx, table_id, bounds, engine_limit(limit))?;
        return Ok(QueryIter::scan(iter));
    }

    let cap = engine_limit(limit);
    let mut entries = Vec::with_capacity(ids.len().min(cap.max(1)));
    for id in ids {
        if cap != 0 && entries.len() >= cap {
            break;
        }
        if let Some(value) = engine.get(tx, table_id, &id)? {
            entries.push((id, value));
        }
    }
    Ok(QueryIter::materialized(entries))
}

/// Whether the sorted, deduplicated ids are a dense run of fixed-width
/// big-endian integers, i.e. they cover their span without gaps.
fn dense_sorted_run(ids: &[Bytes]) -> bool {
    let Some(first) = ids.first() else {
        return false;
    };
    let width = first.len();
    if width == 0 || width > 8 || ids.iter().any(|id| id.len() != width) {
        return false;
    }
    let as_int = |id: &Bytes| id.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
    let span = as_int(ids.last().expect("non-empty")) - as_int(first);
    span == ids.len() as u64 - 1
}

/// Translates a logical limit into the engine's: `L + 1` so the caller can
/// detect "more available"; overflow and "no limit" are both unbounded.
fn engine_limit(limit: Option<u64>) -> usize {
    match limit {
        None => 0,
        Some(l) => l
            .checked_add(1)
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(0),
    }
}

/// Turns scan flags plus boundary keys into engine bounds, applying the
/// paging override to the lower bound.
fn resolve_bounds(
    kind: TableKind,
    flags: ScanType,
    begin: Option<Bytes>,
    end: Option<Bytes>,
    page_position: Option<Bytes>,
) -> StorageResult<(Bound<Bytes>, Bound<Bytes>)> {
    let mut lo = if match_scan_type(ScanType::ANY, flags) {
        // full scans stay inside the table's kind range; caller-defined
        // tables carry no kind tag and scan unbounded
        match kind {
            TableKind::Unknown => Bound::Unbounded,
            kind => Bound::Included(scan_start(kind, None)),
        }
    } else {
        match begin {
            // a prefix lower bound is always inclusive of itself
            Some(begin) if match_scan_type(ScanType::PREFIX_BEGIN, flags) => {
                Bound::Included(begin)
            }
            Some(begin) if match_scan_type(ScanType::GTE_BEGIN, flags) => Bound::Included(begin),
            Some(begin) if match_scan_type(ScanType::GT_BEGIN, flags) => Bound::Excluded(begin),
            Some(begin) => Bound::Included(begin),
            None => Bound::Unbounded,
        }
    };
    let hi = if match_scan_type(ScanType::ANY, flags) {
        match kind {
            TableKind::Unknown => Bound::Unbounded,
            kind => Bound::Excluded(scan_end(kind, None)),
        }
    } else if match_scan_type(ScanType::PREFIX_END, flags) {
        match end {
            Some(prefix) => end_bound_of_prefix(&prefix),
            None => Bound::Unbounded,
        }
    } else {
        match end {
            Some(end) if match_scan_type(ScanType::LTE_END, flags) => Bound::Included(end),
            Some(end) if match_scan_type(ScanType::LT_END, flags) => Bound::Excluded(end),
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        }
    };
    if let Some(page) = page_position {
        let in_bounds = match &lo {
            Bound::Included(bound) => page >= *bound,
            Bound::Excluded(bound) => page > *bound,
            Bound::Unbounded => true,
        };
        if !in_bounds {
            return Err(StorageError::InvalidPage(page));
        }
        lo = Bound::Included(page);
    }
    Ok((lo, hi))
}
