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
use graphstore_common::config::StoreConfig;
use graphstore_storage::{StoreEnv, StoreIter};

pub fn b(raw: &'static [u8]) -> Bytes {
    Bytes::from_static(raw)
}

/// A private environment with the caller-defined table `"t"` registered.
pub fn env_with_table() -> Arc<StoreEnv> {
    let env = StoreEnv::new(StoreConfig::default());
    env.create_table("t").unwrap();
    env
}

pub fn collect_keys(iter: StoreIter) -> Vec<Bytes> {
    iter.materialize()
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect()
}
