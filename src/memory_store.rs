// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory [`Storage`] and [`BlobStore`] implementations.
//!
//! `MemoryStore` keeps one [`RevisionTree`] per document behind its own lock
//! (a `DashMap` of `Arc<Mutex<RevisionTree>>`), so structural changes to one
//! document never contend with another.
//!
//! # Transactions
//!
//! Writers are serialized by a reentrant gate owned by one thread at a time.
//! `begin_transaction()` takes the gate and `end_transaction()` releases it, so
//! a write from any other thread waits for the open transaction instead of
//! joining it. A transaction must begin and end on the same thread without
//! awaiting in between (see [`in_transaction`](crate::storage::in_transaction)).
//!
//! Each tree is copied the first time a transaction writes it; a rollback
//! restores those copies in place and leaves every other document alone.
//! Change notifications raised inside a transaction are held until commit and
//! discarded on rollback.
//!
//! Intended for embedding, tests and as the reference semantics for a
//! persistent store.

use crate::config::RevisionTreeConfig;
use crate::error::{ReplicationError, Result, Status};
use crate::rev_tree::{PutOutcome, ResolveOutcome, RevisionTree};
use crate::revision::{Revision, RevisionList};
use crate::storage::{BlobStore, ChangeSubscription, DocumentChange, RevisionFilter, Storage};
use crate::transport::BlobReader;
use base64::Engine;
use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Validation hook: return `false` to reject a revision as `Forbidden`.
pub type ValidationFn = Arc<dyn Fn(&Revision) -> bool + Send + Sync>;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Transaction {
    depth: usize,
    rollback_only: bool,
    /// Trees as they were before their first write; `None` if the document
    /// did not exist yet.
    touched: HashMap<String, Option<RevisionTree>>,
    start_sequence: i64,
    pending_changes: Vec<DocumentChange>,
}

#[derive(Default)]
struct WriterGate {
    owner: Option<ThreadId>,
    holds: usize,
}

/// One hold on the writer gate, released on drop.
struct WriterHold<'a> {
    store: &'a MemoryStore,
}

impl Drop for WriterHold<'_> {
    fn drop(&mut self) {
        self.store.release_writer();
    }
}

/// Document store held entirely in memory.
pub struct MemoryStore {
    uuid: String,
    docs: DashMap<String, Arc<Mutex<RevisionTree>>>,
    last_sequence: AtomicI64,
    max_depth: usize,
    transaction: Mutex<Transaction>,
    gate: Mutex<WriterGate>,
    gate_released: Condvar,
    changes_tx: broadcast::Sender<DocumentChange>,
    blobs: Option<Arc<dyn BlobStore>>,
    validation: Option<ValidationFn>,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    /// Empty store with a random private UUID and 20-deep history.
    pub fn new() -> Self {
        let seed = format!("{:?}-{}", std::time::SystemTime::now(), std::process::id());
        let uuid = hex::encode(&Sha256::digest(seed.as_bytes())[..16]);
        Self::with_uuid(uuid)
    }

    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            uuid: uuid.into(),
            docs: DashMap::new(),
            last_sequence: AtomicI64::new(0),
            max_depth: RevisionTreeConfig::default().max_depth,
            transaction: Mutex::new(Transaction::default()),
            gate: Mutex::new(WriterGate::default()),
            gate_released: Condvar::new(),
            changes_tx,
            blobs: None,
            validation: None,
            fail_next_commit: AtomicBool::new(false),
        }
    }

    pub fn with_revision_tree_config(mut self, config: &RevisionTreeConfig) -> Self {
        self.max_depth = config.max_depth;
        self
    }

    /// Inline attachment data on incoming revisions is moved into `blobs`.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_validation(mut self, validation: ValidationFn) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Make the next outermost commit fail and roll back.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn last_sequence(&self) -> i64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub fn document_count(&self) -> usize {
        self.docs.len()
    }

    /// Winning revision of a document (tombstones included).
    pub fn get_document(&self, doc_id: &str) -> Option<Revision> {
        let tree = self.tree_handle(doc_id)?;
        let winner = lock(&tree).winning_revision();
        winner
    }

    /// Copy of a document's revision tree.
    pub fn revision_tree(&self, doc_id: &str) -> Option<RevisionTree> {
        let tree = self.tree_handle(doc_id)?;
        let copy = lock(&tree).clone();
        Some(copy)
    }

    /// Local edit. `prev_rev_id` must be the current leaf being replaced.
    pub fn put(
        &self,
        doc_id: &str,
        properties: Map<String, Value>,
        prev_rev_id: Option<&str>,
    ) -> Result<PutOutcome> {
        self.write_local(doc_id, properties, false, prev_rev_id)
    }

    /// Local deletion of the leaf `rev_id`.
    pub fn delete(&self, doc_id: &str, rev_id: &str) -> Result<PutOutcome> {
        self.write_local(doc_id, Map::new(), true, Some(rev_id))
    }

    fn write_local(
        &self,
        doc_id: &str,
        mut properties: Map<String, Value>,
        deleted: bool,
        prev_rev_id: Option<&str>,
    ) -> Result<PutOutcome> {
        let next_generation = prev_rev_id.map(crate::revision::generation).unwrap_or(0) + 1;
        self.store_inline_attachments(&mut properties, next_generation)?;
        for key in ["_id", "_rev", "_deleted", "_revisions"] {
            properties.remove(key);
        }

        crate::storage::in_transaction(self, || {
            self.touch(doc_id);
            let tree = self.tree_handle_or_create(doc_id);
            let mut tree = lock(&tree);
            let sequence = self.next_sequence();
            let outcome = tree.put(properties, deleted, prev_rev_id, sequence);
            if let Some(rev) = &outcome.revision {
                tree.prune(self.max_depth);
                let is_winner = tree.winning_revision().map(|w| w.rev_id == rev.rev_id).unwrap_or(false);
                self.record_change(DocumentChange {
                    revision: rev.clone(),
                    source: None,
                    is_winner,
                });
            }
            Ok(outcome)
        })
    }

    fn next_sequence(&self) -> i64 {
        self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn tree_handle(&self, doc_id: &str) -> Option<Arc<Mutex<RevisionTree>>> {
        self.docs.get(doc_id).map(|entry| Arc::clone(entry.value()))
    }

    fn tree_handle_or_create(&self, doc_id: &str) -> Arc<Mutex<RevisionTree>> {
        let entry = self
            .docs
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RevisionTree::new(doc_id))));
        Arc::clone(entry.value())
    }

    fn record_change(&self, change: DocumentChange) {
        let mut txn = lock(&self.transaction);
        if txn.depth > 0 {
            txn.pending_changes.push(change);
        } else {
            drop(txn);
            let _ = self.changes_tx.send(change);
        }
    }

    /// Replace inline base64 `data` with stubs pointing into the blob store.
    fn store_inline_attachments(&self, properties: &mut Map<String, Value>, generation: u64) -> Result<()> {
        let Some(blobs) = &self.blobs else {
            return Ok(());
        };
        let Some(Value::Object(attachments)) = properties.get_mut("_attachments") else {
            return Ok(());
        };

        for (name, meta) in attachments.iter_mut() {
            let Some(meta) = meta.as_object_mut() else {
                continue;
            };
            if let Some(Value::String(data)) = meta.remove("data") {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| ReplicationError::InvalidRevision(format!("attachment {name}: {e}")))?;
                let digest = blobs.store_blob(&bytes)?;
                meta.insert("digest".to_string(), Value::String(digest));
                meta.insert("length".to_string(), Value::from(bytes.len() as u64));
                meta.insert("stub".to_string(), Value::Bool(true));
                meta.remove("follows");
            }
            meta.entry("revpos").or_insert_with(|| Value::from(generation));
        }
        Ok(())
    }

    /// Block until no other thread owns the writer gate, then take a hold.
    fn hold_writer(&self) {
        let me = std::thread::current().id();
        let mut gate = lock(&self.gate);
        while gate.owner.is_some_and(|owner| owner != me) {
            gate = self.gate_released.wait(gate).unwrap_or_else(|e| e.into_inner());
        }
        gate.owner = Some(me);
        gate.holds += 1;
    }

    fn release_writer(&self) {
        let mut gate = lock(&self.gate);
        gate.holds = gate.holds.saturating_sub(1);
        if gate.holds == 0 {
            gate.owner = None;
            self.gate_released.notify_all();
        }
    }

    fn writer(&self) -> WriterHold<'_> {
        self.hold_writer();
        WriterHold { store: self }
    }

    /// Remember a document's tree before the open transaction first writes it.
    fn touch(&self, doc_id: &str) {
        {
            let txn = lock(&self.transaction);
            if txn.depth == 0 || txn.touched.contains_key(doc_id) {
                return;
            }
        }
        let before = self.tree_handle(doc_id).map(|tree| lock(&tree).clone());
        lock(&self.transaction)
            .touched
            .entry(doc_id.to_string())
            .or_insert(before);
    }

    fn roll_back(&self, touched: HashMap<String, Option<RevisionTree>>, start_sequence: i64) {
        for (doc_id, before) in touched {
            match (before, self.tree_handle(&doc_id)) {
                (Some(tree), Some(handle)) => *lock(&handle) = tree,
                (Some(tree), None) => {
                    self.docs.insert(doc_id, Arc::new(Mutex::new(tree)));
                }
                (None, _) => {
                    self.docs.remove(&doc_id);
                }
            }
        }
        self.last_sequence.store(start_sequence, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStore {
    fn private_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn begin_transaction(&self) -> Result<()> {
        self.hold_writer();
        let mut txn = lock(&self.transaction);
        if txn.depth == 0 {
            txn.touched.clear();
            txn.start_sequence = self.last_sequence();
            txn.rollback_only = false;
        }
        txn.depth += 1;
        Ok(())
    }

    fn end_transaction(&self, commit: bool) -> Result<()> {
        let mut txn = lock(&self.transaction);
        if txn.depth == 0 {
            return Err(ReplicationError::Storage("end_transaction without begin".to_string()));
        }
        let _hold = WriterHold { store: self };
        txn.depth -= 1;
        if !commit {
            txn.rollback_only = true;
        }
        if txn.depth > 0 {
            return Ok(());
        }

        let injected_failure = commit && self.fail_next_commit.swap(false, Ordering::SeqCst);
        let touched = std::mem::take(&mut txn.touched);
        let changes = std::mem::take(&mut txn.pending_changes);
        let rolled_back = txn.rollback_only || injected_failure;
        let start_sequence = txn.start_sequence;
        drop(txn);

        if rolled_back {
            self.roll_back(touched, start_sequence);
            debug!(discarded_changes = changes.len(), "Transaction rolled back");
            if injected_failure {
                return Err(ReplicationError::Storage("commit failed".to_string()));
            }
            return Ok(());
        }

        for change in changes {
            let _ = self.changes_tx.send(change);
        }
        Ok(())
    }

    fn force_insert(&self, rev: &Revision, history: &[String], source: Option<&str>) -> Result<Status> {
        if let Some(validate) = &self.validation {
            if !validate(rev) {
                return Ok(Status::Forbidden);
            }
        }

        let mut rev = rev.clone();
        let revpos = rev.generation().max(1);
        if let Some(properties) = rev.properties.as_mut() {
            self.store_inline_attachments(properties, revpos)?;
            for key in ["_id", "_rev", "_deleted", "_revisions"] {
                properties.remove(key);
            }
        }

        let _writer = self.writer();
        self.touch(&rev.doc_id);
        let tree = self.tree_handle_or_create(&rev.doc_id);
        let mut tree = lock(&tree);
        if tree.contains(&rev.rev_id) {
            return Ok(Status::Ok);
        }
        let sequence = self.next_sequence();
        let status = tree.force_insert(&rev, history, sequence);
        if status == Status::Created {
            tree.prune(self.max_depth);
            if let Some(stored) = tree.get(&rev.rev_id) {
                let is_winner = tree
                    .winning_revision()
                    .map(|w| w.rev_id == stored.rev_id)
                    .unwrap_or(false);
                self.record_change(DocumentChange {
                    revision: stored,
                    source: source.map(str::to_string),
                    is_winner,
                });
            }
        } else if tree.is_empty() {
            drop(tree);
            self.docs.remove(&rev.doc_id);
        }
        Ok(status)
    }

    fn find_missing_revisions(&self, revs: &mut RevisionList) -> Result<()> {
        revs.retain(|rev| match self.tree_handle(&rev.doc_id) {
            Some(tree) => !lock(&tree).contains(&rev.rev_id),
            None => true,
        });
        Ok(())
    }

    fn changes_since(&self, since: i64, filter: Option<&RevisionFilter>) -> Result<RevisionList> {
        let trees: Vec<Arc<Mutex<RevisionTree>>> = self.docs.iter().map(|e| Arc::clone(e.value())).collect();
        let mut changes: RevisionList = trees
            .iter()
            .flat_map(|tree| lock(tree).all_leaves())
            .filter(|rev| rev.sequence > since)
            .filter(|rev| filter.map(|f| f(rev)).unwrap_or(true))
            .collect();
        changes.sort_by_key(|rev| rev.sequence);
        Ok(changes)
    }

    fn get_all_revision_ids(&self, doc_id: &str, only_current: bool) -> Result<Vec<String>> {
        let Some(tree) = self.tree_handle(doc_id) else {
            return Ok(Vec::new());
        };
        let tree = lock(&tree);
        Ok(if only_current {
            tree.current_revision_ids()
        } else {
            tree.all_revision_ids()
        })
    }

    fn load_revision(&self, doc_id: &str, rev_id: &str) -> Result<Option<Revision>> {
        Ok(self.tree_handle(doc_id).and_then(|tree| lock(&tree).get(rev_id)))
    }

    fn revision_history(&self, doc_id: &str, rev_id: &str) -> Result<Vec<String>> {
        Ok(self
            .tree_handle(doc_id)
            .map(|tree| lock(&tree).history(rev_id))
            .unwrap_or_default())
    }

    fn select_winning_revision(&self, doc_id: &str) -> Result<Option<Revision>> {
        Ok(self.get_document(doc_id))
    }

    fn resolve_conflict(
        &self,
        doc_id: &str,
        winning_rev_id: &str,
        losing_rev_id: &str,
        merged_body: Option<Map<String, Value>>,
    ) -> Result<Status> {
        let Some(tree) = self.tree_handle(doc_id) else {
            return Ok(Status::NotFound);
        };
        crate::storage::in_transaction(self, || {
            self.touch(doc_id);
            let mut tree = lock(&tree);
            let ResolveOutcome {
                status,
                tombstone,
                merged,
            } = tree.resolve_conflict(winning_rev_id, losing_rev_id, merged_body, || self.next_sequence());
            if let Some(rev) = tombstone {
                self.record_change(DocumentChange {
                    revision: rev,
                    source: None,
                    is_winner: false,
                });
            }
            if let Some(rev) = merged {
                self.record_change(DocumentChange {
                    revision: rev,
                    source: None,
                    is_winner: true,
                });
            }
            if !status.is_successful() {
                warn!(doc_id, winning_rev_id, losing_rev_id, %status, "Conflict resolution rejected");
            }
            Ok(status)
        })
    }

    fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription::new(self.changes_tx.subscribe())
    }
}

// =============================================================================
// Blob store
// =============================================================================

/// Digest used as a blob key: `sha256-<base64>`.
pub fn blob_digest(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("sha256-{}", base64::engine::general_purpose::STANDARD.encode(hash))
}

/// Attachment bytes keyed by digest.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Arc<Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn get(&self, digest: &str) -> Option<Vec<u8>> {
        self.blobs.get(digest).map(|b| b.as_ref().clone())
    }
}

impl BlobStore for MemoryBlobStore {
    fn has_key(&self, digest: &str) -> bool {
        self.blobs.contains_key(digest)
    }

    fn stream_for_key(&self, digest: &str) -> Option<BlobReader> {
        let bytes = Arc::clone(self.blobs.get(digest)?.value());
        Some(Box::pin(std::io::Cursor::new(bytes.as_ref().clone())))
    }

    fn store_blob(&self, data: &[u8]) -> Result<String> {
        let digest = blob_digest(data);
        self.blobs
            .entry(digest.clone())
            .or_insert_with(|| Arc::new(data.to_vec()));
        Ok(digest)
    }
}
