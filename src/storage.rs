// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local storage integration traits.
//!
//! The replicator reads and writes the local database only through
//! [`Storage`] and reads attachment bytes through [`BlobStore`]. All writes
//! happen between `begin_transaction()` and `end_transaction(commit)`; use
//! [`in_transaction`] to get commit-on-success for free.
//!
//! Local change notifications are delivered on a broadcast channel. A
//! [`ChangeSubscription`] unsubscribes when dropped, so an observer's
//! lifetime bounds its subscription.

use crate::error::{Result, Status};
use crate::revision::{Revision, RevisionList};
use crate::transport::BlobReader;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Predicate selecting which local revisions are pushed.
pub type RevisionFilter = Arc<dyn Fn(&Revision) -> bool + Send + Sync>;

/// A revision that was just added to the local store.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub revision: Revision,
    /// Remote URL the revision was pulled from; `None` for local edits.
    pub source: Option<String>,
    /// Whether `revision` is now the document's winning revision.
    pub is_winner: bool,
}

/// Receiving half of the local change feed. Dropping it unsubscribes.
pub struct ChangeSubscription {
    rx: broadcast::Receiver<DocumentChange>,
}

impl ChangeSubscription {
    pub fn new(rx: broadcast::Receiver<DocumentChange>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the store is gone.
    ///
    /// If the subscriber fell behind, the skipped notifications are logged and
    /// the stream resumes with the oldest one still buffered.
    pub async fn recv(&mut self) -> Option<DocumentChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change subscriber lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The local document store, as seen by the replicator.
pub trait Storage: Send + Sync + 'static {
    /// Stable random ID of this database (checkpoint IDs derive from it).
    fn private_uuid(&self) -> String;

    /// Start a (possibly nested) transaction. The matching `end_transaction`
    /// must run on the same thread, with no `.await` in between.
    fn begin_transaction(&self) -> Result<()>;

    /// Commit if `commit`, otherwise roll back to the matching begin.
    fn end_transaction(&self, commit: bool) -> Result<()>;

    /// Insert a revision that arrived from `source` with its full history,
    /// newest first. Returns `Forbidden` when validation rejects it.
    fn force_insert(&self, rev: &Revision, history: &[String], source: Option<&str>) -> Result<Status>;

    /// Remove every revision the store already has from `revs`.
    fn find_missing_revisions(&self, revs: &mut RevisionList) -> Result<()>;

    /// Leaf revisions (conflict-resolution tombstones included) with a local
    /// sequence above `since`, ascending.
    fn changes_since(&self, since: i64, filter: Option<&RevisionFilter>) -> Result<RevisionList>;

    /// All known rev IDs of a document, or only its open leaves.
    fn get_all_revision_ids(&self, doc_id: &str, only_current: bool) -> Result<Vec<String>>;

    /// Revision with body, if known.
    fn load_revision(&self, doc_id: &str, rev_id: &str) -> Result<Option<Revision>>;

    /// Ancestry of a revision, newest first.
    fn revision_history(&self, doc_id: &str, rev_id: &str) -> Result<Vec<String>>;

    fn select_winning_revision(&self, doc_id: &str) -> Result<Option<Revision>>;

    /// End the losing branch with a tombstone and optionally write a merged
    /// revision on top of the winner. Both get fresh sequences and show up in
    /// `changes_since`. Atomic with respect to readers of the document.
    fn resolve_conflict(
        &self,
        doc_id: &str,
        winning_rev_id: &str,
        losing_rev_id: &str,
        merged_body: Option<Map<String, Value>>,
    ) -> Result<Status>;

    fn subscribe(&self) -> ChangeSubscription;
}

/// Content-addressed attachment bytes.
pub trait BlobStore: Send + Sync + 'static {
    fn has_key(&self, digest: &str) -> bool;

    fn stream_for_key(&self, digest: &str) -> Option<BlobReader>;

    /// Store bytes and return their digest.
    fn store_blob(&self, data: &[u8]) -> Result<String>;
}

/// Run `f` inside a storage transaction, committing only if it succeeds.
pub fn in_transaction<S, T, F>(storage: &S, f: F) -> Result<T>
where
    S: Storage + ?Sized,
    F: FnOnce() -> Result<T>,
{
    storage.begin_transaction()?;
    match f() {
        Ok(value) => {
            storage.end_transaction(true)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = storage.end_transaction(false) {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}
