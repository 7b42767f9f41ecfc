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

use std::sync::{Arc, LazyLock};

use prometheus::core::{AtomicU64, GenericCounterVec};
use prometheus::{
    exponential_buckets, histogram_opts, register_histogram_with_registry,
    register_int_counter_vec_with_registry, Histogram, Registry,
};

/// [`StoreMetrics`] tracks the utilization of the storage engine: point
/// operations, scanned keys, and transaction outcomes, labelled by table
/// or by outcome.
#[derive(Debug)]
pub struct StoreMetrics {
    pub point_op_counts: GenericCounterVec<AtomicU64>,
    pub iter_scan_key_counts: GenericCounterVec<AtomicU64>,
    pub tx_finish_counts: GenericCounterVec<AtomicU64>,
    pub commit_write_set_size: Histogram,
    pub cache_lookup_counts: GenericCounterVec<AtomicU64>,
}

impl StoreMetrics {
    pub fn new(registry: Registry) -> Self {
        let point_op_counts = register_int_counter_vec_with_registry!(
            "store_point_op_counts",
            "Total number of point operations served by the engine",
            &["table", "op"],
            registry
        )
        .unwrap();

        let iter_scan_key_counts = register_int_counter_vec_with_registry!(
            "store_iter_scan_key_counts",
            "Total number of keys yielded by scan iterators",
            &["table"],
            registry
        )
        .unwrap();

        let tx_finish_counts = register_int_counter_vec_with_registry!(
            "store_tx_finish_counts",
            "Total number of finished transactions by outcome",
            &["outcome"],
            registry
        )
        .unwrap();

        let opts = histogram_opts!(
            "store_commit_write_set_size",
            "Number of keys published per commit",
            exponential_buckets(1.0, 2.0, 16).unwrap()
        );
        let commit_write_set_size = register_histogram_with_registry!(opts, registry).unwrap();

        let cache_lookup_counts = register_int_counter_vec_with_registry!(
            "store_cache_lookup_counts",
            "Point-read cache lookups by result",
            &["result"],
            registry
        )
        .unwrap();

        StoreMetrics {
            point_op_counts,
            iter_scan_key_counts,
            tx_finish_counts,
            commit_write_set_size,
            cache_lookup_counts,
        }
    }

    /// Creates a metrics instance backed by a throwaway registry.
    pub fn unused() -> Self {
        StoreMetrics::new(Registry::new())
    }
}

pub static GLOBAL_STORE_METRICS: LazyLock<Arc<StoreMetrics>> =
    LazyLock::new(|| Arc::new(StoreMetrics::new(prometheus::default_registry().clone())));

pub fn global_store_metrics() -> Arc<StoreMetrics> {
    GLOBAL_STORE_METRICS.clone()
}
