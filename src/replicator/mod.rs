// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicators and their shared lifecycle.
//!
//! [`Puller`] and [`Pusher`] each wrap a [`ReplicatorCore`], which owns
//! everything the two directions have in common:
//!
//! - the state machine and the [`ReplicatorStatus`] watch channel
//! - session negotiation against `/_session`
//! - reading and saving the `_local/<checkpoint_id>` checkpoint
//! - the async task counter `stop()` drains before reporting `Stopped`
//!
//! # Checkpoint saves
//!
//! ```text
//! set_last_sequence ──▶ (debounce save_delay) ──▶ save_last_sequence
//!                                                   │
//!          unchanged since last save ◀── no-op ─────┤
//!          save already in flight    ◀── overdue ───┤
//!                                                   ▼
//!                                     PUT _local/<id> {..., lastSequence}
//!                                       200 → keep _rev, persist locally
//!                                       404 → forget remote body, rerun
//!                                       409 → re-read remote body, rerun
//! ```

pub mod puller;
pub mod pusher;
pub mod types;

pub use puller::Puller;
pub use pusher::Pusher;
pub use types::{Direction, ReplicatorState, ReplicatorStatus, SessionIdGenerator, StartPhase};

use crate::change_tracker::normalize_seq;
use crate::checkpoint::{checkpoint_id, CheckpointStore};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::storage::{BlobStore, RevisionFilter, Storage};
use crate::transport::{expect_object, Authorizer, Method, Transport};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Save attempts per `save_last_sequence` call (404/409 trigger a rerun).
const MAX_CHECKPOINT_SAVE_ROUNDS: usize = 3;

/// A pull or push replication.
pub trait Replicator: Send + Sync + 'static {
    fn core(&self) -> &Arc<ReplicatorCore>;

    /// Check the session, read the checkpoint and begin replicating.
    ///
    /// Only fails when called twice. Startup failures stop the replicator
    /// and are reported through [`ReplicatorStatus::last_error`].
    fn start(self: Arc<Self>) -> BoxFuture<'static, Result<()>>;

    /// Stop admitting work, drain what is in flight, save the checkpoint.
    fn stop(self: Arc<Self>) -> BoxFuture<'static, ()>;

    fn status(&self) -> ReplicatorStatus {
        self.core().status()
    }

    fn subscribe(&self) -> watch::Receiver<ReplicatorStatus> {
        self.core().subscribe()
    }
}

/// Collaborators a replicator works against.
#[derive(Clone)]
pub struct ReplicatorContext {
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub checkpoints: Arc<CheckpointStore>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// Attachment bytes for pushes.
    pub blobs: Option<Arc<dyn BlobStore>>,
    /// Push filters, selected by `ReplicatorConfig::filter`.
    pub filters: HashMap<String, RevisionFilter>,
}

impl ReplicatorContext {
    pub fn new(transport: Arc<dyn Transport>, storage: Arc<dyn Storage>, checkpoints: Arc<CheckpointStore>) -> Self {
        Self {
            transport,
            storage,
            checkpoints,
            authorizer: None,
            blobs: None,
            filters: HashMap::new(),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, filter: RevisionFilter) -> Self {
        self.filters.insert(name.into(), filter);
        self
    }
}

#[derive(Debug, Default)]
struct CheckpointState {
    /// Last remote checkpoint body (carries `_rev` and foreign fields).
    remote_body: Option<Map<String, Value>>,
    last_saved: Option<String>,
    saving: bool,
    overdue: bool,
    save_scheduled: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps the async task count raised while alive.
pub struct AsyncTask {
    core: Arc<ReplicatorCore>,
}

impl Drop for AsyncTask {
    fn drop(&mut self) {
        if self.core.async_task_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.core.tasks_idle.notify_waiters();
        }
    }
}

/// State and protocol steps shared by pull and push.
pub struct ReplicatorCore {
    direction: Direction,
    session_id: String,
    config: ReplicatorConfig,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    checkpoints: Arc<CheckpointStore>,
    authorizer: Option<Arc<dyn Authorizer>>,
    checkpoint_id: String,
    continuous: AtomicBool,
    async_task_count: AtomicUsize,
    tasks_idle: Notify,
    status_tx: watch::Sender<ReplicatorStatus>,
    checkpoint: Mutex<CheckpointState>,
}

impl ReplicatorCore {
    pub fn new(
        direction: Direction,
        config: ReplicatorConfig,
        context: &ReplicatorContext,
        session_ids: &SessionIdGenerator,
    ) -> Self {
        let checkpoint_id = checkpoint_id(&context.storage.private_uuid(), &config.remote_url, direction.is_push());
        let (status_tx, _) = watch::channel(ReplicatorStatus::default());
        Self {
            direction,
            session_id: session_ids.next_id(),
            continuous: AtomicBool::new(config.continuous),
            config,
            transport: Arc::clone(&context.transport),
            storage: Arc::clone(&context.storage),
            checkpoints: Arc::clone(&context.checkpoints),
            authorizer: context.authorizer.clone(),
            checkpoint_id,
            async_task_count: AtomicUsize::new(0),
            tasks_idle: Notify::new(),
            status_tx,
            checkpoint: Mutex::new(CheckpointState::default()),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn remote_url(&self) -> &str {
        &self.config.remote_url
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous.load(Ordering::SeqCst)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status
    // ═══════════════════════════════════════════════════════════════════════

    pub fn status(&self) -> ReplicatorStatus {
        self.status_tx.borrow().clone()
    }

    pub fn state(&self) -> ReplicatorState {
        self.status_tx.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status_tx.subscribe()
    }

    /// Wait until the replicator reaches `Stopped` and return its final status.
    pub async fn wait_until_stopped(&self) -> ReplicatorStatus {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|status| status.state.is_terminal()).await.map(|s| s.clone());
        result.unwrap_or_else(|_| self.status())
    }

    fn set_state(&self, state: ReplicatorState) {
        self.status_tx.send_modify(|status| status.state = state);
        metrics::set_replicator_state(self.direction.as_str(), &state.to_string());
        debug!(session = %self.session_id, direction = %self.direction, state = ?state, "Replicator state changed");
    }

    /// Record an error as the latest one. Replication carries on.
    pub fn record_error(&self, error: ReplicationError) {
        let kind = match &error {
            ReplicationError::Http { status, .. } => format!("http_{status}"),
            ReplicationError::Network(_) => "network".to_string(),
            ReplicationError::Storage(_) => "storage".to_string(),
            _ => "other".to_string(),
        };
        metrics::record_error(self.direction.as_str(), &kind);
        warn!(session = %self.session_id, direction = %self.direction, error = %error, "Replication error");
        let error = Arc::new(error);
        self.status_tx.send_modify(|status| status.last_error = Some(error));
    }

    pub fn add_changes_total(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.status_tx.send_modify(|status| status.changes_total += count as u64);
        metrics::record_changes_received(self.direction.as_str(), count);
        self.publish_progress();
    }

    pub fn add_changes_processed(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.status_tx.send_modify(|status| status.changes_processed += count as u64);
        self.publish_progress();
    }

    fn publish_progress(&self) {
        let (processed, total) = {
            let status = self.status_tx.borrow();
            (status.changes_processed, status.changes_total)
        };
        metrics::set_changes_progress(self.direction.as_str(), processed, total);
    }

    pub fn last_sequence(&self) -> Option<String> {
        self.status_tx.borrow().last_sequence.clone()
    }

    /// Update the checkpointable sequence and schedule a debounced save.
    pub fn set_last_sequence(self: &Arc<Self>, sequence: String) {
        let changed = self.status_tx.send_if_modified(|status| {
            if status.last_sequence.as_deref() == Some(sequence.as_str()) {
                return false;
            }
            status.last_sequence = Some(sequence);
            true
        });
        if changed {
            self.schedule_checkpoint_save();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Async task accounting
    // ═══════════════════════════════════════════════════════════════════════

    /// Count an in-flight operation until the returned guard is dropped.
    pub fn begin_task(self: &Arc<Self>) -> AsyncTask {
        self.async_task_count.fetch_add(1, Ordering::SeqCst);
        AsyncTask { core: Arc::clone(self) }
    }

    pub fn async_task_count(&self) -> usize {
        self.async_task_count.load(Ordering::SeqCst)
    }

    pub async fn wait_for_async_tasks(&self) {
        loop {
            let notified = self.tasks_idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.async_task_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// `Idle → Started(CheckingSession) → Started(FetchingCheckpoint)`.
    ///
    /// Returns the sequence to resume from.
    pub async fn start_session(&self) -> Result<Option<String>> {
        let mut actual = ReplicatorState::Idle;
        let started = self.status_tx.send_if_modified(|status| {
            actual = status.state;
            if status.state != ReplicatorState::Idle {
                return false;
            }
            status.state = ReplicatorState::Started(StartPhase::CheckingSession);
            true
        });
        if !started {
            return Err(ReplicationError::InvalidState {
                expected: ReplicatorState::Idle.to_string(),
                actual: actual.to_string(),
            });
        }
        metrics::set_replicator_state(self.direction.as_str(), "Started");
        info!(
            session = %self.session_id,
            direction = %self.direction,
            remote = %self.config.remote_url,
            continuous = self.is_continuous(),
            "Starting replication"
        );

        self.check_session().await?;
        self.set_state(ReplicatorState::Started(StartPhase::FetchingCheckpoint));
        let since = self.fetch_remote_checkpoint().await?;
        self.status_tx.send_modify(|status| status.last_sequence = since.clone());
        Ok(since)
    }

    /// `Started → Replicating`. False if `stop()` got there first.
    pub fn begin_replicating(&self) -> bool {
        let replicating = self.status_tx.send_if_modified(|status| match status.state {
            ReplicatorState::Started(_) => {
                status.state = ReplicatorState::Replicating;
                true
            }
            _ => false,
        });
        if replicating {
            metrics::set_replicator_state(self.direction.as_str(), "Replicating");
            info!(session = %self.session_id, direction = %self.direction, "Replicating");
        }
        replicating
    }

    /// Enter `Stopping`. Returns false if already stopping or stopped.
    pub fn begin_stopping(&self) -> bool {
        let stopping = self.status_tx.send_if_modified(|status| match status.state {
            ReplicatorState::Stopping | ReplicatorState::Stopped => false,
            _ => {
                status.state = ReplicatorState::Stopping;
                true
            }
        });
        if stopping {
            self.continuous.store(false, Ordering::SeqCst);
            metrics::set_replicator_state(self.direction.as_str(), "Stopping");
            info!(session = %self.session_id, direction = %self.direction, "Stopping replication");
        }
        stopping
    }

    /// Drain async tasks, save the checkpoint one last time, enter `Stopped`.
    pub async fn finish_stop(self: &Arc<Self>) {
        self.wait_for_async_tasks().await;
        if let Err(e) = self.save_last_sequence().await {
            warn!(session = %self.session_id, error = %e, "Final checkpoint save failed");
        }
        self.wait_for_async_tasks().await;
        self.set_state(ReplicatorState::Stopped);

        let status = self.status();
        info!(
            session = %self.session_id,
            direction = %self.direction,
            processed = status.changes_processed,
            total = status.changes_total,
            last_sequence = ?status.last_sequence,
            error = status.last_error.is_some(),
            "Replication stopped"
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Session
    // ═══════════════════════════════════════════════════════════════════════

    async fn check_session(&self) -> Result<()> {
        let Some(authorizer) = self.authorizer.as_ref().filter(|a| a.uses_cookie_based_login()) else {
            return Ok(());
        };

        let session = match self.transport.send_request(Method::Get, "/_session", None).await {
            Err(e) if e.is_status(404) => {
                debug!("/_session not found, trying legacy path");
                self.transport.send_request(Method::Get, "_session", None).await?
            }
            other => other?,
        };

        let user = session
            .get("userCtx")
            .and_then(|ctx| ctx.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !user.is_empty() {
            debug!(user, "Already logged in");
            return Ok(());
        }

        let (Some(path), Some(params)) = (authorizer.login_path(), authorizer.login_parameters()) else {
            return Ok(());
        };
        info!(path = %path, "Logging in");
        self.transport
            .send_request(Method::Post, &path, Some(Value::Object(params)))
            .await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoint
    // ═══════════════════════════════════════════════════════════════════════

    fn checkpoint_path(&self) -> String {
        format!("_local/{}", self.checkpoint_id)
    }

    /// Read both checkpoints. Resume only when they agree.
    async fn fetch_remote_checkpoint(&self) -> Result<Option<String>> {
        let local = self.checkpoints.get(&self.checkpoint_id).await;
        let remote = match self.transport.send_request(Method::Get, &self.checkpoint_path(), None).await {
            Ok(body) => Some(expect_object(body, "checkpoint")?),
            Err(e) if e.is_status(404) => None,
            Err(e) => return Err(e),
        };
        let remote_seq = remote
            .as_ref()
            .and_then(|body| body.get("lastSequence"))
            .and_then(normalize_seq);

        let resume = match (&local, &remote_seq) {
            (Some(local), Some(remote)) if local == remote => {
                info!(last_sequence = %local, "Resuming from checkpoint");
                Some(local.clone())
            }
            (None, None) => {
                info!("No checkpoint, replicating from the beginning");
                None
            }
            _ => {
                warn!(
                    local = ?local,
                    remote = ?remote_seq,
                    "Local and remote checkpoints disagree, replicating from the beginning"
                );
                None
            }
        };

        let mut state = lock(&self.checkpoint);
        state.remote_body = remote;
        state.last_saved = resume.clone();
        Ok(resume)
    }

    fn schedule_checkpoint_save(self: &Arc<Self>) {
        {
            let mut state = lock(&self.checkpoint);
            if state.save_scheduled {
                return;
            }
            state.save_scheduled = true;
        }

        let core = Arc::clone(self);
        let delay = self.config.checkpoint.save_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = core.save_last_sequence().await {
                warn!(session = %core.session_id, error = %e, "Checkpoint save failed");
            }
        });
    }

    /// Write `lastSequence` to the remote and local checkpoints.
    ///
    /// No-op if it has not changed since the last successful save. If a save
    /// is already in flight this one is folded into it.
    pub async fn save_last_sequence(self: &Arc<Self>) -> Result<()> {
        let _task = self.begin_task();
        for _ in 0..MAX_CHECKPOINT_SAVE_ROUNDS {
            let (mut body, sequence) = {
                let mut state = lock(&self.checkpoint);
                state.save_scheduled = false;
                let Some(sequence) = self.last_sequence() else {
                    return Ok(());
                };
                if state.last_saved.as_deref() == Some(sequence.as_str()) {
                    return Ok(());
                }
                if state.saving {
                    state.overdue = true;
                    return Ok(());
                }
                state.saving = true;
                let mut body = state.remote_body.clone().unwrap_or_default();
                body.insert("lastSequence".to_string(), Value::String(sequence.clone()));
                (body, sequence)
            };

            let result = self
                .transport
                .send_request(Method::Put, &self.checkpoint_path(), Some(Value::Object(body.clone())))
                .await;

            let mut local_result = Ok(());
            match result {
                Ok(response) => {
                    if let Some(rev) = response.get("rev").cloned() {
                        body.insert("_rev".to_string(), rev);
                    }
                    {
                        let mut state = lock(&self.checkpoint);
                        state.remote_body = Some(body);
                        state.last_saved = Some(sequence.clone());
                    }
                    local_result = self.checkpoints.set(&self.checkpoint_id, &sequence).await;
                    metrics::record_checkpoint_save(self.direction.as_str(), "saved");
                    info!(session = %self.session_id, last_sequence = %sequence, "Checkpoint saved");
                }
                Err(e) if e.is_status(404) => {
                    metrics::record_checkpoint_save(self.direction.as_str(), "missing");
                    debug!("Remote checkpoint missing, saving a fresh one");
                    let mut state = lock(&self.checkpoint);
                    state.remote_body = None;
                    state.overdue = true;
                }
                Err(e) if e.is_status(409) => {
                    metrics::record_checkpoint_save(self.direction.as_str(), "conflict");
                    debug!("Checkpoint conflict, re-reading remote checkpoint");
                    let latest = self.transport.send_request(Method::Get, &self.checkpoint_path(), None).await;
                    let mut state = lock(&self.checkpoint);
                    match latest.and_then(|body| expect_object(body, "checkpoint")) {
                        Ok(remote) => {
                            state.remote_body = Some(remote);
                            state.overdue = true;
                        }
                        Err(e) => warn!(error = %e, "Could not re-read remote checkpoint"),
                    }
                }
                Err(e) => {
                    metrics::record_checkpoint_save(self.direction.as_str(), "error");
                    warn!(session = %self.session_id, error = %e, "Remote checkpoint save failed");
                }
            }

            let rerun = {
                let mut state = lock(&self.checkpoint);
                state.saving = false;
                std::mem::take(&mut state.overdue)
            };
            local_result?;
            if !rerun {
                return Ok(());
            }
        }
        warn!(session = %self.session_id, "Checkpoint save gave up after repeated reruns");
        Ok(())
    }
}
