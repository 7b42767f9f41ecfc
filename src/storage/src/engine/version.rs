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
use smallvec::SmallVec;

use crate::engine::txn::TxId;

/// Logical commit timestamp. The commit clock starts at zero; the first
/// committed transaction publishes at timestamp one.
pub type CommitTs = u64;

/// Who a version belongs to: a committed transaction (by timestamp) or an
/// in-flight one (by handle).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionStamp {
    Committed(CommitTs),
    Pending(TxId),
}

/// One version of a key. `value == None` is a tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionEntry {
    pub stamp: VersionStamp,
    pub value: Option<Bytes>,
}

/// The versions of a single key, newest first.
///
/// Invariants: at most one pending entry, always at the front; committed
/// entries are ordered by descending timestamp. Pending entries only exist
/// while their transaction is active.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionChain {
    entries: SmallVec<[VersionEntry; 2]>,
}

impl VersionChain {
    /// The value visible to a reader at `snapshot`, preferring the reader's
    /// own pending write. `None` covers both "no entry" and "tombstone".
    pub fn visible(&self, snapshot: CommitTs, own: Option<TxId>) -> Option<Bytes> {
        for entry in &self.entries {
            match entry.stamp {
                VersionStamp::Pending(tx) if own == Some(tx) => return entry.value.clone(),
                VersionStamp::Pending(_) => continue,
                VersionStamp::Committed(ts) if ts <= snapshot => return entry.value.clone(),
                VersionStamp::Committed(_) => continue,
            }
        }
        None
    }

    /// The transaction owning this chain's pending entry, if any.
    pub fn pending_tx(&self) -> Option<TxId> {
        match self.entries.first() {
            Some(VersionEntry {
                stamp: VersionStamp::Pending(tx),
                ..
            }) => Some(*tx),
            _ => None,
        }
    }

    /// Stages a write for `tx`. Replacing the transaction's own pending
    /// entry is fine; a pending entry of another transaction is a conflict
    /// and is returned as the error.
    pub fn stage(&mut self, tx: TxId, value: Option<Bytes>) -> Result<(), TxId> {
        match self.pending_tx() {
            Some(owner) if owner != tx => Err(owner),
            Some(_) => {
                self.entries[0].value = value;
                Ok(())
            }
            None => {
                self.entries.insert(
                    0,
                    VersionEntry {
                        stamp: VersionStamp::Pending(tx),
                        value,
                    },
                );
                Ok(())
            }
        }
    }

    /// Drops `tx`'s pending entry, if present.
    pub fn unstage(&mut self, tx: TxId) {
        if self.pending_tx() == Some(tx) {
            self.entries.remove(0);
        }
    }

    /// Promotes `tx`'s pending entry to a committed version at `commit_ts`.
    /// Returns whether a promotion happened.
    pub fn promote(&mut self, tx: TxId, commit_ts: CommitTs) -> bool {
        if self.pending_tx() == Some(tx) {
            self.entries[0].stamp = VersionStamp::Committed(commit_ts);
            true
        } else {
            false
        }
    }

    /// Installs an already-committed version, used by write-ahead replay.
    /// Versions must arrive in ascending timestamp order.
    pub fn install_committed(&mut self, commit_ts: CommitTs, value: Option<Bytes>) {
        self.entries.insert(
            0,
            VersionEntry {
                stamp: VersionStamp::Committed(commit_ts),
                value,
            },
        );
    }

    /// Timestamp of the newest committed version.
    pub fn newest_commit_ts(&self) -> Option<CommitTs> {
        self.entries.iter().find_map(|entry| match entry.stamp {
            VersionStamp::Committed(ts) => Some(ts),
            VersionStamp::Pending(_) => None,
        })
    }

    /// Value of `tx`'s pending entry (outer `None` if there is none).
    pub fn pending_value(&self, tx: TxId) -> Option<Option<Bytes>> {
        if self.pending_tx() == Some(tx) {
            self.entries.first().map(|entry| entry.value.clone())
        } else {
            None
        }
    }

    /// Drops committed versions no live reader can observe: everything
    /// older than the newest committed version at or below `watermark`
    /// (the oldest live snapshot).
    pub fn trim(&mut self, watermark: CommitTs) {
        let mut keep_one_below = true;
        self.entries.retain(|entry| match entry.stamp {
            VersionStamp::Pending(_) => true,
            VersionStamp::Committed(ts) if ts > watermark => true,
            VersionStamp::Committed(_) => std::mem::replace(&mut keep_one_below, false),
        });
    }

    /// Whether the chain can be removed from the table map entirely: no
    /// pending entry and nothing but a tombstone at or below `watermark`.
    pub fn is_obsolete(&self, watermark: CommitTs) -> bool {
        match self.entries.as_slice() {
            [] => true,
            [VersionEntry {
                stamp: VersionStamp::Committed(ts),
                value: None,
            }] => *ts <= watermark,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TX1: TxId = TxId::new(1);
    const TX2: TxId = TxId::new(2);

    fn value(v: &'static [u8]) -> Option<Bytes> {
        Some(Bytes::from_static(v))
    }

    #[test]
    fn test_visibility_by_snapshot() {
        let mut chain = VersionChain::default();
        chain.install_committed(1, value(b"v1"));
        chain.install_committed(3, value(b"v3"));

        assert_eq!(chain.visible(0, None), None);
        assert_eq!(chain.visible(1, None), value(b"v1"));
        assert_eq!(chain.visible(2, None), value(b"v1"));
        assert_eq!(chain.visible(3, None), value(b"v3"));
        assert_eq!(chain.visible(u64::MAX, None), value(b"v3"));
    }

    #[test]
    fn test_tombstone_hides_value() {
        let mut chain = VersionChain::default();
        chain.install_committed(1, value(b"v1"));
        chain.install_committed(2, None);
        assert_eq!(chain.visible(1, None), value(b"v1"));
        assert_eq!(chain.visible(2, None), None);
    }

    #[test]
    fn test_own_pending_write_is_visible() {
        let mut chain = VersionChain::default();
        chain.install_committed(1, value(b"committed"));
        chain.stage(TX1, value(b"pending")).unwrap();

        assert_eq!(chain.visible(1, Some(TX1)), value(b"pending"));
        // other readers skip the pending entry
        assert_eq!(chain.visible(1, None), value(b"committed"));
        assert_eq!(chain.visible(1, Some(TX2)), value(b"committed"));
    }

    #[test]
    fn test_pending_pending_collision() {
        let mut chain = VersionChain::default();
        chain.stage(TX1, value(b"a")).unwrap();
        // replacing our own pending write is fine
        chain.stage(TX1, value(b"b")).unwrap();
        assert_eq!(chain.stage(TX2, value(b"c")), Err(TX1));
    }

    #[test]
    fn test_promote_and_unstage() {
        let mut chain = VersionChain::default();
        chain.stage(TX1, value(b"a")).unwrap();
        assert!(chain.promote(TX1, 5));
        assert_eq!(chain.visible(5, None), value(b"a"));
        assert_eq!(chain.pending_tx(), None);

        chain.stage(TX2, None).unwrap();
        chain.unstage(TX2);
        assert_eq!(chain.visible(5, None), value(b"a"));
    }

    #[test]
    fn test_trim_keeps_watermark_version() {
        let mut chain = VersionChain::default();
        chain.install_committed(1, value(b"v1"));
        chain.install_committed(2, value(b"v2"));
        chain.install_committed(4, value(b"v4"));
        chain.trim(3);
        // v2 is still needed by a reader at snapshot 3; v1 is not.
        assert_eq!(chain.visible(3, None), value(b"v2"));
        assert_eq!(chain.visible(1, None), None);
        assert_eq!(chain.visible(4, None), value(b"v4"));
    }

    #[test]
    fn test_obsolete_tombstone() {
        let mut chain = VersionChain::default();
        chain.install_committed(2, None);
        assert!(!chain.is_obsolete(1));
        assert!(chain.is_obsolete(2));

        chain.stage(TX1, value(b"x")).unwrap();
        assert!(!chain.is_obsolete(u64::MAX));
    }
}
