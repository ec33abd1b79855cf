// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote `_changes` feed consumer.
//!
//! The tracker polls the remote change feed and turns every `(doc, rev)`
//! pair in it into a [`TrackerEvent::Change`] on an mpsc channel. The
//! channel is bounded, so a slow consumer stalls the feed instead of
//! buffering it.
//!
//! ```text
//! Stopped ──▶ Starting ──▶ Polling ⇄ Waiting (long-poll, caught up)
//!                             │
//!                             └──▶ Error ──(retry)──▶ Polling
//! ```
//!
//! # Modes
//!
//! - [`ChangeTrackerMode::OneShot`]: `feed=normal`, pages through the feed
//!   `limit` entries at a time and stops once a page comes back short.
//! - [`ChangeTrackerMode::LongPoll`]: `feed=longpoll`, repeats until shut down.
//!
//! # Failures
//!
//! Transient errors (network, 5xx, 408, 429) are retried with exponential
//! backoff capped at the configured maximum delay. A one-shot feed gives up
//! once the attempts run out. A long-poll feed never gives up on transient
//! errors: when the attempts run out it reports the outage once with
//! [`TrackerEvent::Error`] and keeps retrying at the capped delay.
//!
//! Any other error is terminal and is reported through
//! `TrackerEvent::Stopped(Some(error))`.

use crate::config::ChangeTrackerConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::transport::{encode_component as encode, expect_object, Method, Transport};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Feed style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTrackerMode {
    OneShot,
    LongPoll,
}

impl ChangeTrackerMode {
    fn feed(self) -> &'static str {
        match self {
            Self::OneShot => "normal",
            Self::LongPoll => "longpoll",
        }
    }
}

/// Observable tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Stopped,
    Starting,
    Polling,
    /// Long-poll request outstanding with nothing left to catch up on.
    Waiting,
    /// Backing off after a failure.
    Error,
}

/// One revision reported by the remote feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Opaque remote sequence token, always as a string.
    pub remote_seq: String,
}

/// Message from the tracker to its client.
#[derive(Debug)]
pub enum TrackerEvent {
    Change(RemoteChange),
    /// A long-poll feed has been failing for the whole retry budget. The
    /// tracker keeps retrying.
    Error(ReplicationError),
    /// The tracker has exited; `Some` when it exited because of an error.
    Stopped(Option<ReplicationError>),
}

/// Render a remote `seq` as the opaque string the checkpoint stores.
pub fn normalize_seq(seq: &Value) -> Option<String> {
    match seq {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Parse a `_changes` response into changes plus the feed's `last_seq`.
pub fn parse_changes(body: &Map<String, Value>) -> Result<(Vec<RemoteChange>, Option<String>)> {
    let results = body
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplicationError::Internal("_changes: missing results".to_string()))?;

    let mut changes = Vec::new();
    let mut last_seq = None;
    for entry in results {
        let (Some(doc_id), Some(seq)) = (
            entry.get("id").and_then(Value::as_str),
            entry.get("seq").and_then(normalize_seq),
        ) else {
            warn!(entry = %entry, "Skipping malformed change entry");
            continue;
        };
        let deleted = entry.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        let revs = entry.get("changes").and_then(Value::as_array).into_iter().flatten();
        for rev in revs {
            if let Some(rev_id) = rev.get("rev").and_then(Value::as_str) {
                changes.push(RemoteChange {
                    doc_id: doc_id.to_string(),
                    rev_id: rev_id.to_string(),
                    deleted,
                    remote_seq: seq.clone(),
                });
            }
        }
        last_seq = Some(seq);
    }

    let last_seq = body.get("last_seq").and_then(normalize_seq).or(last_seq);
    Ok((changes, last_seq))
}

/// Remote change feed poller.
pub struct ChangeTracker {
    transport: Arc<dyn Transport>,
    mode: ChangeTrackerMode,
    config: ChangeTrackerConfig,
    since: Option<String>,
    filter: Option<String>,
    filter_params: Map<String, Value>,
    doc_ids: Vec<String>,
    state_tx: watch::Sender<TrackerState>,
}

impl ChangeTracker {
    pub fn new(
        transport: Arc<dyn Transport>,
        mode: ChangeTrackerMode,
        config: ChangeTrackerConfig,
        since: Option<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TrackerState::Stopped);
        Self {
            transport,
            mode,
            config,
            since,
            filter: None,
            filter_params: Map::new(),
            doc_ids: Vec::new(),
            state_tx,
        }
    }

    /// Named server-side filter with parameters.
    pub fn with_filter(mut self, filter: Option<String>, params: Map<String, Value>) -> Self {
        self.filter = filter;
        self.filter_params = params;
        self
    }

    /// Restrict the feed to these documents (overrides `filter`).
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = doc_ids;
        self
    }

    pub fn mode(&self) -> ChangeTrackerMode {
        self.mode
    }

    pub fn since(&self) -> Option<&str> {
        self.since.as_deref()
    }

    pub fn state(&self) -> watch::Receiver<TrackerState> {
        self.state_tx.subscribe()
    }

    /// Relative URL of the next `_changes` request.
    pub fn changes_path(&self) -> String {
        let mut path = format!(
            "_changes?feed={}&limit={}&heartbeat={}&style=all_docs",
            self.mode.feed(),
            self.config.longpoll_limit,
            self.config.heartbeat_ms
        );
        if let Some(since) = &self.since {
            path.push_str(&format!("&since={}", encode(since)));
        }

        if !self.doc_ids.is_empty() {
            let ids = Value::from(self.doc_ids.clone()).to_string();
            path.push_str(&format!("&filter=_doc_ids&doc_ids={}", encode(&ids)));
        } else if let Some(filter) = &self.filter {
            path.push_str(&format!("&filter={}", encode(filter)));
            for (key, value) in &self.filter_params {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                path.push_str(&format!("&{}={}", encode(key), encode(&value)));
            }
        }
        path
    }

    fn set_state(&self, state: TrackerState) {
        self.state_tx.send_replace(state);
    }

    /// Poll until the feed is exhausted (one-shot), shutdown is signalled, the
    /// receiver is dropped, or a terminal error occurs. Always ends with a
    /// `Stopped` event.
    pub async fn run(mut self, events: mpsc::Sender<TrackerEvent>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("change_tracker", remote = %self.transport.remote_url(), mode = ?self.mode);

        async move {
            info!(since = ?self.since, "Starting change tracker");
            self.set_state(TrackerState::Starting);

            let retry = self.config.retry_config();
            let mut failures = 0usize;
            let mut outage_reported = false;
            let mut outcome: Option<ReplicationError> = None;

            'poll: loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if *self.state_tx.borrow() != TrackerState::Waiting {
                    self.set_state(TrackerState::Polling);
                }

                let path = self.changes_path();
                let start = Instant::now();
                let result = tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received while polling");
                            break;
                        }
                        continue;
                    }

                    result = self.transport.send_request(Method::Get, &path, None) => result,
                };

                let parsed = result.and_then(|body| parse_changes(&expect_object(body, "_changes")?));
                match parsed {
                    Ok((changes, last_seq)) => {
                        if outage_reported {
                            info!(failures, "Change feed recovered");
                        }
                        failures = 0;
                        outage_reported = false;
                        let count = changes.len();
                        metrics::record_change_feed_request(self.mode.feed(), true, count, start.elapsed());
                        debug!(count, last_seq = ?last_seq, "Received changes");

                        for change in changes {
                            if events.send(TrackerEvent::Change(change)).await.is_err() {
                                debug!("Change receiver dropped");
                                break 'poll;
                            }
                        }
                        if last_seq.is_some() {
                            self.since = last_seq;
                        }

                        let caught_up = count < self.config.longpoll_limit;
                        match self.mode {
                            ChangeTrackerMode::OneShot if caught_up => break,
                            ChangeTrackerMode::LongPoll if caught_up => self.set_state(TrackerState::Waiting),
                            _ => self.set_state(TrackerState::Polling),
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        failures += 1;
                        metrics::record_change_feed_request(self.mode.feed(), false, 0, start.elapsed());
                        let exhausted = !retry.should_retry(failures);
                        if exhausted && self.mode == ChangeTrackerMode::OneShot {
                            error!(failures, error = %e, "Change feed retries exhausted");
                            self.set_state(TrackerState::Error);
                            outcome = Some(e);
                            break;
                        }

                        let delay = retry.delay_for_attempt(failures);
                        warn!(failures, delay_ms = delay.as_millis() as u64, error = %e, "Change feed request failed, retrying");
                        metrics::record_change_feed_retry(failures);
                        self.set_state(TrackerState::Error);

                        if exhausted && !outage_reported {
                            outage_reported = true;
                            error!(failures, "Change feed still failing, retrying at the maximum delay");
                            if events.send(TrackerEvent::Error(e)).await.is_err() {
                                debug!("Change receiver dropped");
                                break;
                            }
                        }

                        tokio::select! {
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Change feed failed permanently");
                        metrics::record_change_feed_request(self.mode.feed(), false, 0, start.elapsed());
                        self.set_state(TrackerState::Error);
                        outcome = Some(e);
                        break;
                    }
                }
            }

            self.set_state(TrackerState::Stopped);
            info!(since = ?self.since, error = outcome.is_some(), "Change tracker stopped");
            let _ = events.send(TrackerEvent::Stopped(outcome)).await;
        }
        .instrument(span)
        .await
    }
}
