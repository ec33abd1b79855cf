// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull replication: remote change feed into the local store.
//!
//! ```text
//! ChangeTracker ──mpsc──▶ inbox Batcher ──▶ find_missing_revisions
//!                                                │
//!                                                ▼
//!                          SequenceMap ◀── revs_to_pull (VecDeque)
//!                              ▲                 │ ≤ max_open_http_connections
//!                              │                 ▼
//!                              │        GET /<doc>?rev=&revs=true&attachments=true
//!                              │                 │
//!                              │                 ▼
//!                              └──── insert Batcher ──▶ force_insert (one transaction)
//! ```
//!
//! # Checkpointing
//!
//! Every change that enters the inbox gets a [`SequenceMap`] slot. The slot is
//! released when the revision is inserted, rejected as `Forbidden`, or found
//! to be present already. Fetch failures and failed inserts keep their slot,
//! so the checkpoint never passes them and the next run pulls them again.
//!
//! # Back-pressure
//!
//! While `max_pending_revisions` revisions wait to be fetched, the puller
//! stops reading tracker events; the bounded channel then stalls the tracker.

use super::{Replicator, ReplicatorContext, ReplicatorCore, SessionIdGenerator};
use crate::batch::{BatchConfig, Batcher};
use crate::change_tracker::{ChangeTracker, ChangeTrackerMode, RemoteChange, TrackerEvent};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result, Status};
use crate::metrics;
use crate::replicator::types::Direction;
use crate::resilience::Bulkhead;
use crate::revision::{parse_revision_history, Revision, RevisionList};
use crate::sequence_map::SequenceMap;
use crate::storage::in_transaction;
use crate::transport::{encode_component, expect_object, Method};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// A missing revision waiting for a fetch slot.
#[derive(Debug)]
struct PendingFetch {
    doc_id: String,
    rev_id: String,
    seq: u64,
}

/// A fetched revision waiting for the insert batch.
#[derive(Debug)]
struct FetchedRevision {
    rev: Revision,
    history: Vec<String>,
    seq: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pulls revisions from the remote into local storage.
pub struct Puller {
    core: Arc<ReplicatorCore>,
    pending_sequences: SequenceMap,
    revs_to_pull: Mutex<VecDeque<PendingFetch>>,
    fetch_slots: Bulkhead,
    fetch_capacity: Notify,
    inbox: Batcher<RemoteChange>,
    inserter: Batcher<FetchedRevision>,
    tracker_shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Puller {
    /// Must be called inside a Tokio runtime (the batchers spawn workers).
    pub fn new(config: ReplicatorConfig, context: &ReplicatorContext, session_ids: &SessionIdGenerator) -> Arc<Self> {
        let inbox_config = BatchConfig::new(config.puller.inbox_capacity, config.puller.inbox_delay());
        let insert_config = BatchConfig::new(config.puller.insert_batch_capacity, config.puller.insert_batch_delay());
        let fetch_slots = Bulkhead::new(config.puller.max_open_http_connections.max(1));
        let core = Arc::new(ReplicatorCore::new(Direction::Pull, config, context, session_ids));
        let (tracker_shutdown, _) = watch::channel(false);

        Arc::new_cyclic(|weak: &Weak<Puller>| {
            let inbox_owner = weak.clone();
            let inbox = Batcher::new("puller_inbox", inbox_config, move |changes: Vec<RemoteChange>| {
                let puller = inbox_owner.upgrade();
                async move {
                    match puller {
                        Some(puller) => puller.process_inbox(changes).await,
                        None => Ok(()),
                    }
                }
            });

            let insert_owner = weak.clone();
            let inserter = Batcher::new("puller_insert", insert_config, move |revs: Vec<FetchedRevision>| {
                let puller = insert_owner.upgrade();
                async move {
                    match puller {
                        Some(puller) => puller.insert_revisions(revs).await,
                        None => Ok(()),
                    }
                }
            });

            Self {
                core,
                pending_sequences: SequenceMap::new(),
                revs_to_pull: Mutex::new(VecDeque::new()),
                fetch_slots,
                fetch_capacity: Notify::new(),
                inbox,
                inserter,
                tracker_shutdown,
                tasks: Mutex::new(Vec::new()),
            }
        })
    }

    /// Revisions queued for fetching (not counting fetches in flight).
    pub fn pending_fetch_count(&self) -> usize {
        lock(&self.revs_to_pull).len()
    }

    pub fn fetches_in_flight(&self) -> usize {
        self.fetch_slots.in_flight()
    }

    fn begin_replicating(self: &Arc<Self>, since: Option<String>) {
        if !self.core.begin_replicating() {
            return;
        }

        let config = self.core.config();
        let mode = if self.core.is_continuous() {
            ChangeTrackerMode::LongPoll
        } else {
            ChangeTrackerMode::OneShot
        };
        let tracker = ChangeTracker::new(Arc::clone(self.core.transport()), mode, config.change_tracker.clone(), since)
            .with_filter(config.filter.clone(), config.filter_params.clone())
            .with_doc_ids(config.doc_ids.clone());

        let (events_tx, events_rx) = mpsc::channel(config.puller.inbox_capacity.max(1));
        let tracker_task = tokio::spawn(tracker.run(events_tx, self.tracker_shutdown.subscribe()));
        let events_task = tokio::spawn(Arc::clone(self).handle_tracker_events(events_rx));
        lock(&self.tasks).extend([tracker_task, events_task]);
    }

    async fn handle_tracker_events(self: Arc<Self>, mut events: mpsc::Receiver<TrackerEvent>) {
        let span = info_span!("pull", remote = %self.core.remote_url(), session = %self.core.session_id());

        async move {
            loop {
                self.wait_for_fetch_capacity().await;
                let Some(event) = events.recv().await else {
                    break;
                };
                match event {
                    TrackerEvent::Change(change) => {
                        self.core.add_changes_total(1);
                        self.inbox.queue(change);
                    }
                    TrackerEvent::Error(e) => self.core.record_error(e),
                    TrackerEvent::Stopped(error) => {
                        let failed = error.is_some();
                        if let Some(e) = error {
                            self.core.record_error(e);
                        }
                        if failed || !self.core.is_continuous() {
                            debug!(failed, "Change tracker finished, stopping puller");
                            tokio::spawn(Arc::clone(&self).stop());
                        }
                        break;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn wait_for_fetch_capacity(&self) {
        let max_pending = self.core.config().puller.max_pending_revisions;
        loop {
            let notified = self.fetch_capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_fetch_count() < max_pending {
                return;
            }
            debug!(pending = self.pending_fetch_count(), "Fetch queue full, pausing change feed");
            notified.await;
        }
    }

    /// Filter an inbox batch down to what the local store lacks and queue it.
    async fn process_inbox(self: &Arc<Self>, changes: Vec<RemoteChange>) -> Result<()> {
        let _task = self.core.begin_task();
        let received = changes.len();

        let mut revs: RevisionList = changes
            .iter()
            .map(|c| Revision::new(c.doc_id.as_str(), c.rev_id.as_str(), c.deleted))
            .collect();
        if let Err(e) = self.core.storage().find_missing_revisions(&mut revs) {
            // Hold the sequences so the checkpoint cannot pass this batch.
            for change in &changes {
                self.pending_sequences.add_value(change.remote_seq.as_str());
            }
            self.core.add_changes_processed(received);
            self.core.record_error(e);
            return Ok(());
        }
        let missing: HashSet<(String, String)> = revs.into_iter().map(|r| (r.doc_id, r.rev_id)).collect();
        metrics::record_missing_revisions(received, missing.len());

        let mut already_present = 0;
        {
            let mut queue = lock(&self.revs_to_pull);
            for change in changes {
                let seq = self.pending_sequences.add_value(change.remote_seq.as_str());
                if missing.contains(&(change.doc_id.clone(), change.rev_id.clone())) {
                    queue.push_back(PendingFetch {
                        doc_id: change.doc_id,
                        rev_id: change.rev_id,
                        seq,
                    });
                } else {
                    self.pending_sequences.remove_sequence(seq);
                    already_present += 1;
                }
            }
        }

        debug!(received, missing = missing.len(), "Processed inbox");
        self.core.add_changes_processed(already_present);
        self.update_last_sequence();
        self.pull_remote_revisions();
        Ok(())
    }

    /// Start fetches until the queue is empty or every slot is taken.
    fn pull_remote_revisions(self: &Arc<Self>) {
        loop {
            let Some(permit) = self.fetch_slots.try_acquire() else {
                break;
            };
            let Some(fetch) = lock(&self.revs_to_pull).pop_front() else {
                break;
            };
            let task = self.core.begin_task();
            metrics::set_fetches_in_flight(self.fetch_slots.in_flight());

            let puller = Arc::clone(self);
            tokio::spawn(async move {
                puller.pull_remote_revision(fetch).await;
                drop(permit);
                puller.fetch_capacity.notify_waiters();
                puller.pull_remote_revisions();
                drop(task);
            });
        }
    }

    /// Fetch one revision with its history and hand it to the insert batch.
    async fn pull_remote_revision(&self, fetch: PendingFetch) {
        let start = Instant::now();
        let known = match self.core.storage().get_all_revision_ids(&fetch.doc_id, true) {
            Ok(known) => known,
            Err(e) => {
                warn!(doc_id = %fetch.doc_id, error = %e, "Could not read local leaves");
                Vec::new()
            }
        };

        let mut path = format!(
            "{}?rev={}&revs=true&attachments=true",
            encode_component(&fetch.doc_id),
            encode_component(&fetch.rev_id)
        );
        if !known.is_empty() {
            let known = Value::from(known).to_string();
            path.push_str(&format!("&atts_since={}", encode_component(&known)));
        }

        let fetched = self
            .core
            .transport()
            .send_request(Method::Get, &path, None)
            .await
            .and_then(|body| expect_object(body, "revision"))
            .and_then(|body| {
                let history = parse_revision_history(&body);
                let rev = Revision::from_properties(body)?;
                let history = match history {
                    Some(history) => history,
                    None if rev.generation() == 1 => vec![rev.rev_id.clone()],
                    None => {
                        return Err(ReplicationError::InvalidRevision(format!(
                            "{} {}: response has no _revisions",
                            rev.doc_id, rev.rev_id
                        )))
                    }
                };
                Ok((rev, history))
            });
        metrics::record_revision_fetch(fetched.is_ok(), start.elapsed());

        match fetched {
            Ok((rev, history)) => {
                debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, generations = history.len(), "Fetched revision");
                self.inserter.queue(FetchedRevision {
                    rev,
                    history,
                    seq: fetch.seq,
                });
            }
            Err(e) => {
                warn!(doc_id = %fetch.doc_id, rev_id = %fetch.rev_id, error = %e, "Revision fetch failed");
                self.core.record_error(e);
                self.core.add_changes_processed(1);
            }
        }
    }

    /// Insert one batch of fetched revisions in a single transaction.
    ///
    /// A revision the store refuses is counted as failed and keeps its
    /// sequence pending; the rest of the batch still commits. Only a failed
    /// begin or commit discards the whole batch.
    async fn insert_revisions(self: &Arc<Self>, mut batch: Vec<FetchedRevision>) -> Result<()> {
        let _task = self.core.begin_task();
        batch.sort_by_key(|fetched| fetched.seq);

        let storage = self.core.storage();
        let source = self.core.remote_url();
        let result = in_transaction(storage.as_ref(), || {
            Ok(batch
                .iter()
                .map(|fetched| storage.force_insert(&fetched.rev, &fetched.history, Some(source)))
                .collect::<Vec<Result<Status>>>())
        });

        match result {
            Ok(statuses) => {
                let (mut inserted, mut forbidden, mut failed) = (0, 0, 0);
                for (fetched, status) in batch.iter().zip(statuses) {
                    match status {
                        Ok(Status::Ok | Status::Created) => {
                            inserted += 1;
                            self.pending_sequences.remove_sequence(fetched.seq);
                        }
                        Ok(Status::Forbidden) => {
                            forbidden += 1;
                            info!(doc_id = %fetched.rev.doc_id, rev_id = %fetched.rev.rev_id, "Revision rejected by validation");
                            self.pending_sequences.remove_sequence(fetched.seq);
                        }
                        Ok(other) => {
                            failed += 1;
                            self.core.record_error(ReplicationError::Storage(format!(
                                "insert {} {}: {}",
                                fetched.rev.doc_id, fetched.rev.rev_id, other
                            )));
                        }
                        Err(e) => {
                            failed += 1;
                            warn!(doc_id = %fetched.rev.doc_id, rev_id = %fetched.rev.rev_id, error = %e, "Revision insert failed");
                            self.core.record_error(e);
                        }
                    }
                }
                metrics::record_revisions_inserted(inserted, forbidden, failed);
                debug!(inserted, forbidden, failed, "Inserted revisions");
            }
            Err(e) => {
                metrics::record_revisions_inserted(0, 0, batch.len());
                self.core.record_error(e);
            }
        }

        self.core.add_changes_processed(batch.len());
        self.update_last_sequence();
        Ok(())
    }

    fn update_last_sequence(&self) {
        if let Some(sequence) = self.pending_sequences.checkpointed_value() {
            self.core.set_last_sequence(sequence);
        }
    }

    /// Flush both batchers until nothing is queued or in flight.
    async fn drain(&self) {
        loop {
            self.inbox.flush().await;
            self.core.wait_for_async_tasks().await;
            self.inserter.flush().await;
            self.core.wait_for_async_tasks().await;
            if self.inbox.count() == 0 && self.inserter.count() == 0 && self.pending_fetch_count() == 0 {
                break;
            }
        }
    }
}

impl Replicator for Puller {
    fn core(&self) -> &Arc<ReplicatorCore> {
        &self.core
    }

    fn start(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match self.core.start_session().await {
                Ok(since) => {
                    self.begin_replicating(since);
                    Ok(())
                }
                Err(e @ ReplicationError::InvalidState { .. }) => Err(e),
                Err(e) => {
                    self.core.record_error(e);
                    self.stop().await;
                    Ok(())
                }
            }
        })
    }

    fn stop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if !self.core.begin_stopping() {
                self.core.wait_until_stopped().await;
                return;
            }

            self.tracker_shutdown.send_replace(true);
            let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Puller task ended abnormally");
                }
            }

            self.drain().await;
            self.inbox.close().await;
            self.inserter.close().await;
            self.core.finish_stop().await;
        })
    }
}
