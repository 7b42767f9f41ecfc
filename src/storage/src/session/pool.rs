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

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::debug;

use super::Session;
use crate::engine::StorageEngine;

/// Hands each caller thread its own [`Session`].
///
/// Sessions are created on first use and stay bound to their thread until
/// closed. The engine underneath is shared; only the session handle is
/// per-thread.
pub struct SessionPool {
    engine: Arc<StorageEngine>,
    sessions: Mutex<HashMap<ThreadId, Arc<Session>>>,
}

impl SessionPool {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        SessionPool {
            engine,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The calling thread's session, created on first use.
    pub fn session(&self) -> Arc<Session> {
        let thread_id = thread::current().id();
        let mut sessions = self.sessions.lock();
        sessions
            .entry(thread_id)
            .or_insert_with(|| {
                debug!(?thread_id, "opening session");
                Arc::new(Session::new(self.engine.clone()))
            })
            .clone()
    }

    /// Closes and forgets the calling thread's session. Pending state is
    /// rolled back by the close.
    pub fn close_session(&self) {
        let thread_id = thread::current().id();
        if let Some(session) = self.sessions.lock().remove(&thread_id) {
            session.close();
        }
    }

    /// Closes every pooled session. Used at store teardown.
    pub fn close_all(&self) {
        let mut sessions = self.sessions.lock();
        for (_, session) in sessions.drain() {
            session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use graphstore_common::catalog::TableKind;

    use super::*;

    fn pool() -> SessionPool {
        let engine = Arc::new(StorageEngine::for_test());
        engine.create_table("t", TableKind::Unknown).unwrap();
        SessionPool::new(engine)
    }

    #[test]
    fn test_same_thread_gets_same_session() {
        let pool = pool();
        let s1 = pool.session();
        let s2 = pool.session();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_threads_get_distinct_sessions() {
        let pool = Arc::new(pool());
        let s1 = pool.session();
        let other = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.session().current_tx()).join()
        };
        assert!(other.is_ok());
        assert_eq!(pool.len(), 2);
        drop(s1);
    }

    #[test]
    fn test_close_session_detaches_current_thread() {
        let pool = pool();
        let session = pool.session();
        pool.close_session();
        assert!(pool.is_empty());
        // the closed handle rejects further use
        assert!(session.get("t", b"k").is_err());
        // a fresh session replaces it
        assert!(pool.session().get("t", b"k").unwrap().is_none());
    }

    #[test]
    fn test_close_all() {
        let pool = pool();
        let session = pool.session();
        session.put("t", bytes::Bytes::from_static(b"k"), bytes::Bytes::from_static(b"v")).unwrap();
        pool.close_all();
        assert!(pool.is_empty());
        // buffered state was rolled back on close
        assert!(pool.session().get("t", b"k").unwrap().is_none());
    }
}
