// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push replication: local changes out to the remote.
//!
//! ```text
//! changes_since(last_sequence) ─┐
//!                               ├──▶ inbox Batcher ──▶ POST _revs_diff
//! subscribe() (continuous) ─────┘                          │
//!                                                          ▼
//!                                   load body + history for each missing rev
//!                                          │                      │
//!                               attachments follow          everything else
//!                                          ▼                      ▼
//!                      PUT /<doc>?new_edits=false     POST _bulk_docs {new_edits: false}
//!                        (multipart, or JSON on 415)
//! ```
//!
//! # Checkpointing
//!
//! Local sequences are ordered and inboxes are processed one at a time, so
//! the push checkpoint is the highest sequence below the first failure seen
//! this run. Without failures it is the last sequence of the latest inbox.

use super::{Replicator, ReplicatorContext, ReplicatorCore, SessionIdGenerator};
use crate::batch::{BatchConfig, Batcher};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::replicator::types::Direction;
use crate::revision::{encode_revision_history, generation, Revision};
use crate::storage::{BlobStore, ChangeSubscription, RevisionFilter};
use crate::transport::{encode_component, AttachmentPart, Method, MultipartBody};
use base64::Engine;
use futures::future::{join_all, BoxFuture};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// An attachment whose bytes go with the upload.
#[derive(Debug, Clone)]
struct FollowingAttachment {
    name: String,
    digest: String,
    content_type: Option<String>,
    length: Option<u64>,
}

/// A revision body ready to send with `new_edits=false`.
#[derive(Debug)]
struct PreparedRevision {
    doc_id: String,
    rev_id: String,
    sequence: i64,
    body: Map<String, Value>,
    following: Vec<FollowingAttachment>,
}

/// Pushes local revisions to the remote.
pub struct Pusher {
    core: Arc<ReplicatorCore>,
    inbox: Batcher<Revision>,
    filter: Option<RevisionFilter>,
    blobs: Option<Arc<dyn BlobStore>>,
    dont_send_multipart: AtomicBool,
    lowest_failed_sequence: Mutex<Option<i64>>,
    observer_shutdown: watch::Sender<bool>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl Pusher {
    /// Must be called inside a Tokio runtime (the inbox spawns a worker).
    ///
    /// Fails if `config.filter` names a filter the context does not register.
    pub fn new(config: ReplicatorConfig, context: &ReplicatorContext, session_ids: &SessionIdGenerator) -> Result<Arc<Self>> {
        let filter = push_filter(&config, context)?;
        let inbox_config = BatchConfig::new(config.pusher.inbox_capacity, config.pusher.inbox_delay());
        let core = Arc::new(ReplicatorCore::new(Direction::Push, config, context, session_ids));
        let (observer_shutdown, _) = watch::channel(false);

        Ok(Arc::new_cyclic(|weak: &Weak<Pusher>| {
            let owner = weak.clone();
            let inbox = Batcher::new("pusher_inbox", inbox_config, move |revs: Vec<Revision>| {
                let pusher = owner.upgrade();
                async move {
                    match pusher {
                        Some(pusher) => pusher.process_inbox(revs).await,
                        None => Ok(()),
                    }
                }
            });

            Self {
                core,
                inbox,
                filter,
                blobs: context.blobs.clone(),
                dont_send_multipart: AtomicBool::new(false),
                lowest_failed_sequence: Mutex::new(None),
                observer_shutdown,
                observer: Mutex::new(None),
            }
        }))
    }

    /// Set after the remote rejected a multipart upload with 415.
    pub fn sends_multipart(&self) -> bool {
        !self.dont_send_multipart.load(Ordering::SeqCst)
    }

    fn passes_filter(&self, rev: &Revision) -> bool {
        self.filter.as_ref().map(|f| f(rev)).unwrap_or(true)
    }

    async fn create_target(&self) -> Result<()> {
        match self.core.transport().send_request(Method::Put, "", None).await {
            Ok(_) => {
                info!(remote = %self.core.remote_url(), "Created target database");
                Ok(())
            }
            Err(e) if e.is_status(412) || e.is_status(409) => {
                debug!("Target database already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn begin_replicating(self: &Arc<Self>, since: Option<String>) -> Result<()> {
        if self.core.config().create_target {
            self.create_target().await?;
        }
        if !self.core.begin_replicating() {
            return Ok(());
        }

        // Subscribe before reading the backlog so nothing falls in between.
        let subscription = self.core.is_continuous().then(|| self.core.storage().subscribe());

        let since = since.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
        let backlog = self.core.storage().changes_since(since, self.filter.as_ref())?;
        let backlog_end = backlog.iter().map(|rev| rev.sequence).max().unwrap_or(since);
        info!(since, backlog = backlog.len(), backlog_end, "Queued local changes");
        self.core.add_changes_total(backlog.len());
        self.inbox.queue_all(backlog);

        match subscription {
            Some(subscription) => {
                let observer = tokio::spawn(Arc::clone(self).observe_changes(subscription, backlog_end));
                *lock(&self.observer) = Some(observer);
            }
            None => {
                let pusher = Arc::clone(self);
                tokio::spawn(async move {
                    pusher.inbox.flush().await;
                    pusher.core.wait_for_async_tasks().await;
                    pusher.stop().await;
                });
            }
        }
        Ok(())
    }

    /// Feed local changes into the inbox until stopped.
    ///
    /// Changes at or below `backlog_end` were already queued from the backlog.
    async fn observe_changes(self: Arc<Self>, mut subscription: ChangeSubscription, backlog_end: i64) {
        let span = info_span!("push", remote = %self.core.remote_url(), session = %self.core.session_id());
        let mut shutdown_rx = self.observer_shutdown.subscribe();

        async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.wait_for(|stop| *stop) => break,

                    change = subscription.recv() => {
                        let Some(change) = change else {
                            debug!("Local change feed closed");
                            break;
                        };
                        if change.revision.sequence <= backlog_end {
                            continue;
                        }
                        // Revisions pulled from this remote would only echo back.
                        if change.source.as_deref() == Some(self.core.remote_url()) {
                            continue;
                        }
                        if !self.passes_filter(&change.revision) {
                            continue;
                        }
                        self.core.add_changes_total(1);
                        self.inbox.queue(change.revision);
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Upload one inbox batch of what the remote is missing.
    async fn process_inbox(self: &Arc<Self>, revs: Vec<Revision>) -> Result<()> {
        let _task = self.core.begin_task();
        let count = revs.len();
        let Some(last_sequence) = revs.iter().map(|r| r.sequence).max() else {
            return Ok(());
        };

        let mut request = Map::new();
        for rev in &revs {
            if let Value::Array(ids) = request
                .entry(rev.doc_id.clone())
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                ids.push(Value::String(rev.rev_id.clone()));
            }
        }

        let diff = match self
            .core
            .transport()
            .send_request(Method::Post, "_revs_diff", Some(Value::Object(request)))
            .await
        {
            Ok(Value::Object(diff)) => diff,
            Ok(other) => {
                self.fail_inbox(&revs, ReplicationError::Internal(format!("_revs_diff: expected object, got {other}")));
                return Ok(());
            }
            Err(e) => {
                self.fail_inbox(&revs, e);
                return Ok(());
            }
        };

        let mut failed: Vec<i64> = Vec::new();
        let mut bulk: Vec<PreparedRevision> = Vec::new();
        let mut multipart: Vec<PreparedRevision> = Vec::new();
        let mut missing_count = 0;

        for rev in &revs {
            let Some(entry) = diff.get(&rev.doc_id) else {
                continue;
            };
            let missing = string_list(entry.get("missing"));
            if !missing.contains(&rev.rev_id) {
                continue;
            }
            missing_count += 1;
            let ancestors = string_list(entry.get("possible_ancestors"));

            match self.prepare_revision(rev, &ancestors) {
                Ok(Some(prepared)) if prepared.following.is_empty() => bulk.push(prepared),
                Ok(Some(prepared)) => multipart.push(prepared),
                Ok(None) => {}
                Err(e) => {
                    failed.push(rev.sequence);
                    self.core.record_error(e);
                }
            }
        }
        metrics::record_revs_diff(count, missing_count);
        debug!(revisions = count, missing = missing_count, multipart = multipart.len(), "Computed revs diff");

        failed.extend(self.upload_bulk(bulk).await);

        let uploads = multipart.into_iter().map(|prepared| async move {
            let sequence = prepared.sequence;
            match self.upload_with_attachments(prepared).await {
                Ok(()) => None,
                Err(e) => {
                    self.core.record_error(e);
                    Some(sequence)
                }
            }
        });
        failed.extend(join_all(uploads).await.into_iter().flatten());

        self.core.add_changes_processed(count);
        self.advance_checkpoint(last_sequence, failed.into_iter().min());
        Ok(())
    }

    /// `_revs_diff` itself failed: nothing in the inbox was sent.
    fn fail_inbox(&self, revs: &[Revision], error: ReplicationError) {
        if let Some(first) = revs.iter().map(|r| r.sequence).min() {
            self.hold_checkpoint_below(first);
        }
        self.core.add_changes_processed(revs.len());
        self.core.record_error(error);
    }

    fn hold_checkpoint_below(&self, sequence: i64) {
        let mut lowest = lock(&self.lowest_failed_sequence);
        *lowest = Some(lowest.map_or(sequence, |l| l.min(sequence)));
    }

    fn advance_checkpoint(&self, last_sequence: i64, first_failure: Option<i64>) {
        if let Some(failed) = first_failure {
            self.hold_checkpoint_below(failed);
        }
        let target = match *lock(&self.lowest_failed_sequence) {
            Some(failed) => last_sequence.min(failed - 1),
            None => last_sequence,
        };
        let current = self
            .core
            .last_sequence()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        if target > current {
            self.core.set_last_sequence(target.to_string());
        }
    }

    /// Load the body to send. `None` if the revision is gone locally.
    fn prepare_revision(&self, rev: &Revision, possible_ancestors: &[String]) -> Result<Option<PreparedRevision>> {
        let storage = self.core.storage();
        let Some(loaded) = storage.load_revision(&rev.doc_id, &rev.rev_id)? else {
            warn!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "Revision no longer stored, skipping");
            return Ok(None);
        };
        let history = storage.revision_history(&rev.doc_id, &rev.rev_id)?;

        // Attachments added at or before the newest revision the remote has
        // are already there.
        let known_generation = history
            .iter()
            .find(|id| possible_ancestors.contains(id))
            .map(|id| generation(id))
            .unwrap_or(0);

        let mut body = loaded.body();
        body.insert(
            "_revisions".to_string(),
            encode_revision_history(&history, Some(possible_ancestors)),
        );

        let mut following = Vec::new();
        if let Some(Value::Object(attachments)) = body.get_mut("_attachments") {
            for (name, meta) in attachments.iter_mut() {
                let Some(meta) = meta.as_object_mut() else {
                    continue;
                };
                let revpos = meta.get("revpos").and_then(Value::as_u64).unwrap_or(0);
                if known_generation > 0 && revpos <= known_generation {
                    meta.insert("stub".to_string(), Value::Bool(true));
                    meta.remove("follows");
                    meta.remove("data");
                    continue;
                }
                let digest = meta
                    .get("digest")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ReplicationError::InvalidRevision(format!("{} {}: attachment {name} has no digest", rev.doc_id, rev.rev_id))
                    })?
                    .to_string();
                meta.remove("stub");
                meta.remove("data");
                meta.insert("follows".to_string(), Value::Bool(true));
                following.push(FollowingAttachment {
                    name: name.clone(),
                    digest,
                    content_type: meta.get("content_type").and_then(Value::as_str).map(str::to_string),
                    length: meta.get("length").and_then(Value::as_u64),
                });
            }
        }

        Ok(Some(PreparedRevision {
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.clone(),
            sequence: rev.sequence,
            body,
            following,
        }))
    }

    /// `POST _bulk_docs`. Returns the sequences that failed.
    async fn upload_bulk(&self, revs: Vec<PreparedRevision>) -> Vec<i64> {
        if revs.is_empty() {
            return Vec::new();
        }
        let docs: Vec<Value> = revs.iter().map(|r| Value::Object(r.body.clone())).collect();
        let request = json!({ "docs": docs, "new_edits": false });

        let response = match self
            .core
            .transport()
            .send_request(Method::Post, "_bulk_docs", Some(request))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                metrics::record_revisions_uploaded("bulk_docs", revs.len(), false);
                self.core.record_error(e);
                return revs.iter().map(|r| r.sequence).collect();
            }
        };

        // Only per-item errors matter; the remote may omit successful items.
        let mut rejected: HashSet<(String, Option<String>)> = HashSet::new();
        for item in response.as_array().map(Vec::as_slice).unwrap_or_default() {
            let Some(error) = item.get("error").and_then(Value::as_str) else {
                continue;
            };
            let Some(doc_id) = item.get("id").and_then(Value::as_str) else {
                continue;
            };
            let rev_id = item.get("rev").and_then(Value::as_str).map(str::to_string);
            let status = item.get("status").and_then(Value::as_u64);
            if error == "forbidden" || status == Some(403) {
                info!(doc_id, rev_id = ?rev_id, "Remote rejected revision");
                continue;
            }
            let reason = item.get("reason").and_then(Value::as_str).unwrap_or(error);
            self.core.record_error(ReplicationError::http(
                status.and_then(|s| u16::try_from(s).ok()).unwrap_or(500),
                format!("{doc_id}: {reason}"),
            ));
            rejected.insert((doc_id.to_string(), rev_id));
        }

        let failed: Vec<i64> = revs
            .iter()
            .filter(|r| {
                rejected.contains(&(r.doc_id.clone(), Some(r.rev_id.clone())))
                    || rejected.contains(&(r.doc_id.clone(), None))
            })
            .map(|r| r.sequence)
            .collect();
        metrics::record_revisions_uploaded("bulk_docs", revs.len() - failed.len(), true);
        if !failed.is_empty() {
            metrics::record_revisions_uploaded("bulk_docs", failed.len(), false);
        }
        debug!(sent = revs.len(), failed = failed.len(), "Bulk upload done");
        failed
    }

    /// Multipart `PUT`, falling back to inline JSON if the remote refuses it.
    async fn upload_with_attachments(&self, rev: PreparedRevision) -> Result<()> {
        let path = format!("{}?new_edits=false", encode_component(&rev.doc_id));

        if self.sends_multipart() {
            let body = MultipartBody {
                json: rev.body.clone(),
                attachments: self.attachment_parts(&rev)?,
            };
            match self.core.transport().send_multipart_request(Method::Put, &path, body).await {
                Ok(_) => {
                    metrics::record_revisions_uploaded("multipart", 1, true);
                    debug!(doc_id = %rev.doc_id, rev_id = %rev.rev_id, "Uploaded revision with attachments");
                    return Ok(());
                }
                Err(e) if e.is_status(415) => {
                    info!("Remote does not accept multipart uploads, switching to inline attachments");
                    self.dont_send_multipart.store(true, Ordering::SeqCst);
                }
                Err(e) => {
                    metrics::record_revisions_uploaded("multipart", 1, false);
                    return Err(e);
                }
            }
        }

        let body = self.inline_attachments(&rev).await?;
        let result = self
            .core
            .transport()
            .send_request(Method::Put, &path, Some(Value::Object(body)))
            .await;
        metrics::record_revisions_uploaded("json", 1, result.is_ok());
        result.map(|_| ())
    }

    fn attachment_parts(&self, rev: &PreparedRevision) -> Result<Vec<AttachmentPart>> {
        rev.following
            .iter()
            .map(|att| {
                let reader = self
                    .blobs
                    .as_ref()
                    .and_then(|blobs| blobs.stream_for_key(&att.digest))
                    .ok_or_else(|| missing_blob(rev, att))?;
                Ok(AttachmentPart {
                    name: att.name.clone(),
                    content_type: att.content_type.clone(),
                    length: att.length,
                    reader,
                })
            })
            .collect()
    }

    async fn inline_attachments(&self, rev: &PreparedRevision) -> Result<Map<String, Value>> {
        let mut body = rev.body.clone();
        let mut encoded: HashMap<String, String> = HashMap::new();
        for att in &rev.following {
            let mut reader = self
                .blobs
                .as_ref()
                .and_then(|blobs| blobs.stream_for_key(&att.digest))
                .ok_or_else(|| missing_blob(rev, att))?;
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .await
                .map_err(|e| ReplicationError::Storage(format!("attachment {}: {e}", att.name)))?;
            encoded.insert(att.name.clone(), base64::engine::general_purpose::STANDARD.encode(bytes));
        }

        if let Some(Value::Object(attachments)) = body.get_mut("_attachments") {
            for (name, data) in encoded {
                if let Some(Value::Object(meta)) = attachments.get_mut(&name) {
                    meta.remove("follows");
                    meta.insert("data".to_string(), Value::String(data));
                }
            }
        }
        Ok(body)
    }
}

fn missing_blob(rev: &PreparedRevision, att: &FollowingAttachment) -> ReplicationError {
    ReplicationError::Storage(format!(
        "{} {}: attachment {} ({}) not in blob store",
        rev.doc_id, rev.rev_id, att.name, att.digest
    ))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Named filter from the context, narrowed to `doc_ids` if any are set.
fn push_filter(config: &ReplicatorConfig, context: &ReplicatorContext) -> Result<Option<RevisionFilter>> {
    let named = match &config.filter {
        Some(name) => Some(
            context
                .filters
                .get(name)
                .cloned()
                .ok_or_else(|| ReplicationError::Config(format!("filter {name:?} is not registered")))?,
        ),
        None => None,
    };
    if config.doc_ids.is_empty() {
        return Ok(named);
    }

    let doc_ids: HashSet<String> = config.doc_ids.iter().cloned().collect();
    Ok(Some(Arc::new(move |rev: &Revision| {
        doc_ids.contains(&rev.doc_id) && named.as_ref().map(|f| f(rev)).unwrap_or(true)
    })))
}

impl Replicator for Pusher {
    fn core(&self) -> &Arc<ReplicatorCore> {
        &self.core
    }

    fn start(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let since = match self.core.start_session().await {
                Ok(since) => since,
                Err(e @ ReplicationError::InvalidState { .. }) => return Err(e),
                Err(e) => {
                    self.core.record_error(e);
                    self.stop().await;
                    return Ok(());
                }
            };
            if let Err(e) = self.begin_replicating(since).await {
                self.core.record_error(e);
                self.stop().await;
            }
            Ok(())
        })
    }

    fn stop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if !self.core.begin_stopping() {
                self.core.wait_until_stopped().await;
                return;
            }

            self.observer_shutdown.send_replace(true);
            let observer = lock(&self.observer).take();
            if let Some(observer) = observer {
                if let Err(e) = observer.await {
                    warn!(error = %e, "Change observer ended abnormally");
                }
            }

            loop {
                self.inbox.flush().await;
                self.core.wait_for_async_tasks().await;
                if self.inbox.count() == 0 {
                    break;
                }
            }
            self.inbox.close().await;
            self.core.finish_stop().await;
        })
    }
}
