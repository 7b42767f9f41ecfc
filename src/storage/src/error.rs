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

use bytes::Bytes;
use graphstore_common::catalog::TableId;
use graphstore_common::error::CodecError;
use thiserror::Error;

use crate::engine::txn::TxId;

/// The caller-visible failures of the storage core.
///
/// Session and store layers propagate these without mapping; retrying a
/// `WriteConflict` is the caller's prerogative.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("table already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid table handle: {0}")]
    InvalidHandle(TableId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("write conflict on key {key:?} of table {table}")]
    WriteConflict { table: TableId, key: Bytes },

    #[error("mutation attempted under read-only transaction {0}")]
    ReadOnlyViolation(TxId),

    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("malformed value: {0}")]
    MalformedValue(String),

    #[error("page position {0:?} lies outside the query bounds")]
    InvalidPage(Bytes),

    #[error("transaction {0} is no longer active")]
    Cancelled(TxId),

    #[error("fatal storage failure: {0}")]
    Fatal(String),
}

impl StorageError {
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, StorageError::WriteConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<CodecError> for StorageError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::MalformedKey(msg) => StorageError::MalformedKey(msg),
            CodecError::MalformedValue(msg) => StorageError::MalformedValue(msg),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
