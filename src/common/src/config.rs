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

use serde::{Deserialize, Serialize};
use serde_default::DefaultFromSerde;

/// Isolation level transactions run under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Readers see a stable snapshot; only write-write conflicts abort.
    Snapshot,
    /// Snapshot plus read-set validation at commit.
    Serializable,
}

/// Byte order of the fixed-width unsigned integers stored under counter
/// keys. Must match across all sessions sharing a counter key; mixing
/// stores with different endianness in one deployment is unsupported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterEndianness {
    Host,
    Little,
    Big,
}

/// The configuration the storage core recognizes.
///
/// All fields default sensibly so an empty config section deserializes to a
/// working engine.
#[derive(Clone, Debug, Serialize, Deserialize, DefaultFromSerde)]
pub struct StoreConfig {
    #[serde(default = "default::isolation_level")]
    pub isolation_level: IsolationLevel,

    /// Transactions older than this are eligible for the caller-driven
    /// expiry sweep. `0` means unbounded: the core never considers a
    /// transaction expired.
    #[serde(default = "default::transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,

    /// Soft ceiling for a session's write buffer. Appending past it flushes
    /// the buffer first.
    #[serde(default = "default::batch_max_ops")]
    pub batch_max_ops: usize,

    #[serde(default = "default::counter_endianness")]
    pub counter_endianness: CounterEndianness,

    /// Capacity of the point-read cache. `0` disables the cache.
    #[serde(default = "default::cache_max_entries")]
    pub cache_max_entries: usize,

    /// Time-to-live of cached point reads. `0` means no expiry.
    #[serde(default = "default::cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

pub mod default {
    use super::{CounterEndianness, IsolationLevel};

    pub fn isolation_level() -> IsolationLevel {
        IsolationLevel::Snapshot
    }

    pub fn transaction_timeout_ms() -> u64 {
        0
    }

    pub fn batch_max_ops() -> usize {
        500
    }

    pub fn counter_endianness() -> CounterEndianness {
        CounterEndianness::Big
    }

    pub fn cache_max_entries() -> usize {
        0
    }

    pub fn cache_ttl_ms() -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_section_deserializes_to_defaults() {
        let config: StoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.isolation_level, IsolationLevel::Snapshot);
        assert_eq!(config.transaction_timeout_ms, 0);
        assert_eq!(config.batch_max_ops, 500);
        assert_eq!(config.counter_endianness, CounterEndianness::Big);
        assert_eq!(config.cache_max_entries, 0);
    }

    #[test]
    fn test_overrides() {
        let config: StoreConfig = serde_json::from_str(
            r#"{
                "isolation_level": "serializable",
                "counter_endianness": "little",
                "cache_max_entries": 1024,
                "cache_ttl_ms": 200
            }"#,
        )
        .unwrap();
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
        assert_eq!(config.counter_endianness, CounterEndianness::Little);
        assert_eq!(config.cache_max_entries, 1024);
        assert_eq!(config.cache_ttl_ms, 200);
    }
}
