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

//! The transactional ordered key-value core backing the graph layer.
//!
//! Tables map binary keys to binary values under multi-statement
//! transactions with snapshot isolation. Sessions buffer writes and replay
//! them atomically; the dispatcher turns id/prefix/range/condition queries
//! into point gets or bounded ordered scans.

mod cache;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod session;
pub mod store;
pub mod wal;

pub use engine::iter::StoreIter;
pub use engine::txn::{TxId, AUTO_COMMIT_TX};
pub use engine::StorageEngine;
pub use error::{StorageError, StorageResult};
pub use store::{Store, StoreEnv, StoreKind};
