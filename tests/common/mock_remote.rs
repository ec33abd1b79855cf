// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process fake of a remote document database.
//!
//! Implements [`Transport`] over a tiny revision store so replicators can be
//! driven end to end. Every request is recorded for assertions.
//! Configurable failures:
//! - per-path-prefix HTTP status overrides
//! - cookie login with a fixed password
//! - 415 on multipart uploads
//! - `forbidden` per-item errors in `_bulk_docs`

use doc_replicator::error::{ReplicationError, Result};
use doc_replicator::revision::{encode_revision_history, generation, parse_revision_history};
use doc_replicator::transport::{BoxFuture, Method, MultipartBody, Transport};
use percent_encoding::percent_decode_str;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A recorded request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

/// A recorded multipart upload with its attachment bytes drained.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub path: String,
    pub json: Map<String, Value>,
    pub attachments: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone)]
struct RemoteRevision {
    rev_id: String,
    body: Map<String, Value>,
    /// Newest first.
    history: Vec<String>,
}

#[derive(Debug, Clone)]
struct FeedEntry {
    seq: u64,
    doc_id: String,
    rev_id: String,
    deleted: bool,
}

#[derive(Default)]
struct RemoteDb {
    docs: HashMap<String, Vec<RemoteRevision>>,
    feed: Vec<FeedEntry>,
    checkpoints: HashMap<String, Map<String, Value>>,
}

impl RemoteDb {
    fn contains(&self, doc_id: &str, rev_id: &str) -> bool {
        self.docs
            .get(doc_id)
            .map(|revs| revs.iter().any(|r| r.rev_id == rev_id || r.history.iter().any(|h| h == rev_id)))
            .unwrap_or(false)
    }

    fn insert(&mut self, mut body: Map<String, Value>, fallback_history: Option<Vec<String>>) -> Option<()> {
        let doc_id = body.get("_id")?.as_str()?.to_string();
        let rev_id = body.get("_rev")?.as_str()?.to_string();
        let history = parse_revision_history(&body)
            .or(fallback_history)
            .unwrap_or_else(|| vec![rev_id.clone()]);
        body.remove("_revisions");
        if self.contains(&doc_id, &rev_id) {
            return Some(());
        }
        let deleted = body.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        self.docs.entry(doc_id.clone()).or_default().push(RemoteRevision {
            rev_id: rev_id.clone(),
            body,
            history,
        });
        let seq = self.feed.len() as u64 + 1;
        self.feed.push(FeedEntry {
            seq,
            doc_id,
            rev_id,
            deleted,
        });
        Some(())
    }
}

/// Fake remote database.
pub struct MockRemote {
    url: String,
    db: Mutex<RemoteDb>,
    requests: Mutex<Vec<RecordedRequest>>,
    multipart: Mutex<Vec<MultipartUpload>>,
    failures: Mutex<Vec<(String, u16)>>,
    forbidden_docs: Mutex<HashSet<String>>,
    login: Mutex<Option<(String, String)>>,
    session_user: Mutex<Option<String>>,
    reject_multipart: AtomicBool,
    db_exists: AtomicBool,
    checkpoint_revs: AtomicU64,
}

impl MockRemote {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            db: Mutex::new(RemoteDb::default()),
            requests: Mutex::new(Vec::new()),
            multipart: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            forbidden_docs: Mutex::new(HashSet::new()),
            login: Mutex::new(None),
            session_user: Mutex::new(None),
            reject_multipart: AtomicBool::new(false),
            db_exists: AtomicBool::new(true),
            checkpoint_revs: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Add a revision to the remote; it shows up in the change feed.
    pub fn add_revision(&self, doc_id: &str, rev_id: &str, body: Value, history: &[&str]) {
        let mut body = body.as_object().cloned().unwrap_or_default();
        body.insert("_id".to_string(), json!(doc_id));
        body.insert("_rev".to_string(), json!(rev_id));
        let history = history.iter().map(|s| s.to_string()).collect();
        lock(&self.db).insert(body, Some(history));
    }

    /// Answer requests whose path starts with `prefix` with `status`.
    pub fn fail_path(&self, prefix: &str, status: u16) {
        lock(&self.failures).push((prefix.to_string(), status));
    }

    /// Drop every injected failure.
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Reject multipart uploads with 415.
    pub fn reject_multipart(&self) {
        self.reject_multipart.store(true, Ordering::SeqCst);
    }

    /// Report a `forbidden` item error for this document in `_bulk_docs`.
    pub fn forbid_doc(&self, doc_id: &str) {
        lock(&self.forbidden_docs).insert(doc_id.to_string());
    }

    /// Require a cookie login with these credentials.
    pub fn require_login(&self, name: &str, password: &str) {
        *lock(&self.login) = Some((name.to_string(), password.to_string()));
    }

    /// Make the database itself absent until created with `PUT ""`.
    pub fn without_database(&self) {
        self.db_exists.store(false, Ordering::SeqCst);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn has_revision(&self, doc_id: &str, rev_id: &str) -> bool {
        lock(&self.db).contains(doc_id, rev_id)
    }

    pub fn revision_body(&self, doc_id: &str, rev_id: &str) -> Option<Map<String, Value>> {
        let db = lock(&self.db);
        db.docs
            .get(doc_id)?
            .iter()
            .find(|r| r.rev_id == rev_id)
            .map(|r| r.body.clone())
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<Map<String, Value>> {
        lock(&self.db).checkpoints.get(checkpoint_id).cloned()
    }

    /// Simulate another writer updating a checkpoint document.
    pub fn bump_checkpoint(&self, checkpoint_id: &str) {
        let rev = format!("0-{}", self.checkpoint_revs.fetch_add(1, Ordering::SeqCst) + 1);
        if let Some(body) = lock(&self.db).checkpoints.get_mut(checkpoint_id) {
            body.insert("_rev".to_string(), json!(rev));
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    /// Requests whose path starts with `prefix`.
    pub fn requests_to(&self, prefix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.starts_with(prefix))
            .collect()
    }

    /// Document GETs (everything that is not a protocol endpoint).
    pub fn document_fetches(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == Method::Get && !r.path.starts_with('_') && !r.path.starts_with("/_"))
            .count()
    }

    pub fn multipart_uploads(&self) -> Vec<MultipartUpload> {
        lock(&self.multipart).clone()
    }

    pub fn database_exists(&self) -> bool {
        self.db_exists.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Request handling
    // =========================================================================

    fn injected_failure(&self, path: &str) -> Option<ReplicationError> {
        lock(&self.failures)
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, status)| ReplicationError::http(*status, format!("injected failure for {path}")))
    }

    fn handle(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        if let Some(error) = self.injected_failure(path) {
            return Err(error);
        }
        let (resource, query) = match path.split_once('?') {
            Some((resource, query)) => (resource, query),
            None => (path, ""),
        };
        let params = parse_query(query);
        if !resource.ends_with("_session") {
            self.authorized()?;
        }

        match (method, resource) {
            (Method::Put, "") => {
                if self.db_exists.swap(true, Ordering::SeqCst) {
                    Err(ReplicationError::http(412, "file_exists"))
                } else {
                    Ok(json!({ "ok": true }))
                }
            }
            (Method::Get, "/_session") | (Method::Get, "_session") => {
                let user = lock(&self.session_user).clone();
                Ok(json!({ "ok": true, "userCtx": { "name": user } }))
            }
            (Method::Post, "_session") => self.login(body),
            (_, "_changes") => Ok(self.changes(&params)),
            (Method::Post, "_revs_diff") => Ok(self.revs_diff(body)),
            (Method::Post, "_bulk_docs") => Ok(self.bulk_docs(body)),
            (method, local) if local.starts_with("_local/") => self.local_doc(method, &local["_local/".len()..], body),
            (Method::Get, doc) => self.get_revision(&decode(doc), &params),
            (Method::Put, doc) => {
                let body = body.and_then(|b| b.as_object().cloned()).unwrap_or_default();
                let rev_id = body.get("_rev").cloned();
                lock(&self.db)
                    .insert(body, None)
                    .ok_or_else(|| ReplicationError::http(400, "bad document"))?;
                Ok(json!({ "ok": true, "id": decode(doc), "rev": rev_id }))
            }
            _ => Err(ReplicationError::http(404, format!("no handler for {method} {path}"))),
        }
    }

    fn login(&self, body: Option<Value>) -> Result<Value> {
        let Some((name, password)) = lock(&self.login).clone() else {
            return Ok(json!({ "ok": true }));
        };
        let given_name = body.as_ref().and_then(|b| b.get("name")).and_then(Value::as_str);
        let given_password = body.as_ref().and_then(|b| b.get("password")).and_then(Value::as_str);
        if given_name == Some(name.as_str()) && given_password == Some(password.as_str()) {
            *lock(&self.session_user) = Some(name);
            Ok(json!({ "ok": true }))
        } else {
            Err(ReplicationError::http(401, "name or password is incorrect"))
        }
    }

    fn authorized(&self) -> Result<()> {
        if lock(&self.login).is_some() && lock(&self.session_user).is_none() {
            return Err(ReplicationError::http(401, "login required"));
        }
        Ok(())
    }

    fn changes(&self, params: &HashMap<String, String>) -> Value {
        let since: u64 = params.get("since").and_then(|s| s.parse().ok()).unwrap_or(0);
        let limit: usize = params.get("limit").and_then(|s| s.parse().ok()).unwrap_or(usize::MAX);
        let db = lock(&self.db);
        let results: Vec<Value> = db
            .feed
            .iter()
            .filter(|entry| entry.seq > since)
            .take(limit)
            .map(|entry| {
                json!({
                    "seq": entry.seq,
                    "id": entry.doc_id,
                    "changes": [{ "rev": entry.rev_id }],
                    "deleted": entry.deleted,
                })
            })
            .collect();
        let last_seq = results.last().map(|r| r["seq"].clone()).unwrap_or(json!(since));
        json!({ "results": results, "last_seq": last_seq })
    }

    fn revs_diff(&self, body: Option<Value>) -> Value {
        let db = lock(&self.db);
        let mut diff = Map::new();
        let request = body.and_then(|b| b.as_object().cloned()).unwrap_or_default();
        for (doc_id, revs) in request {
            let missing: Vec<String> = revs
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .filter(|rev| !db.contains(&doc_id, rev))
                .map(str::to_string)
                .collect();
            if missing.is_empty() {
                continue;
            }
            let lowest = missing.iter().map(|r| generation(r)).min().unwrap_or(0);
            let ancestors: Vec<String> = db
                .docs
                .get(&doc_id)
                .into_iter()
                .flatten()
                .map(|r| r.rev_id.clone())
                .filter(|r| generation(r) < lowest)
                .collect();
            let mut entry = json!({ "missing": missing });
            if !ancestors.is_empty() {
                entry["possible_ancestors"] = json!(ancestors);
            }
            diff.insert(doc_id, entry);
        }
        Value::Object(diff)
    }

    fn bulk_docs(&self, body: Option<Value>) -> Value {
        let forbidden = lock(&self.forbidden_docs).clone();
        let docs = body
            .as_ref()
            .and_then(|b| b.get("docs"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut errors = Vec::new();
        let mut db = lock(&self.db);
        for doc in docs {
            let Some(doc) = doc.as_object().cloned() else {
                continue;
            };
            let doc_id = doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
            if forbidden.contains(&doc_id) {
                errors.push(json!({ "id": doc_id, "error": "forbidden", "reason": "not allowed", "status": 403 }));
                continue;
            }
            db.insert(doc, None);
        }
        Value::Array(errors)
    }

    fn local_doc(&self, method: Method, id: &str, body: Option<Value>) -> Result<Value> {
        let mut db = lock(&self.db);
        match method {
            Method::Get => db
                .checkpoints
                .get(id)
                .cloned()
                .map(Value::Object)
                .ok_or_else(|| ReplicationError::http(404, "missing")),
            _ => {
                let mut body = body.and_then(|b| b.as_object().cloned()).unwrap_or_default();
                let stored_rev = db.checkpoints.get(id).and_then(|c| c.get("_rev")).cloned();
                if stored_rev.is_some() && body.get("_rev") != stored_rev.as_ref() {
                    return Err(ReplicationError::http(409, "document update conflict"));
                }
                let rev = format!("0-{}", self.checkpoint_revs.fetch_add(1, Ordering::SeqCst) + 1);
                body.insert("_rev".to_string(), json!(rev));
                db.checkpoints.insert(id.to_string(), body);
                Ok(json!({ "ok": true, "id": format!("_local/{id}"), "rev": rev }))
            }
        }
    }

    fn get_revision(&self, doc_id: &str, params: &HashMap<String, String>) -> Result<Value> {
        let db = lock(&self.db);
        let revs = db.docs.get(doc_id).ok_or_else(|| ReplicationError::http(404, "missing"))?;
        let rev = match params.get("rev") {
            Some(rev_id) => revs.iter().find(|r| &r.rev_id == rev_id),
            None => revs.last(),
        }
        .ok_or_else(|| ReplicationError::http(404, "missing"))?;

        let mut body = rev.body.clone();
        body.insert("_id".to_string(), json!(doc_id));
        body.insert("_rev".to_string(), json!(rev.rev_id));
        if params.get("revs").map(String::as_str) == Some("true") {
            body.insert("_revisions".to_string(), encode_revision_history(&rev.history, None));
        }
        Ok(Value::Object(body))
    }
}

fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (decode(k), decode(v)))
        .collect()
}

impl Transport for MockRemote {
    fn remote_url(&self) -> &str {
        &self.url
    }

    fn send_request(&self, method: Method, path: &str, body: Option<Value>) -> BoxFuture<'_, Value> {
        lock(&self.requests).push(RecordedRequest {
            method,
            path: path.to_string(),
            body: body.clone(),
        });
        let longpoll_idle = path.starts_with("_changes") && path.contains("feed=longpoll");
        let response = self.handle(method, path, body);
        Box::pin(async move {
            // Hold an empty long poll briefly instead of spinning.
            let empty = matches!(&response, Ok(v) if v["results"].as_array().map(Vec::is_empty).unwrap_or(false));
            if longpoll_idle && empty {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            response
        })
    }

    fn send_multipart_request(&self, method: Method, path: &str, body: MultipartBody) -> BoxFuture<'_, Value> {
        lock(&self.requests).push(RecordedRequest {
            method,
            path: path.to_string(),
            body: Some(Value::Object(body.json.clone())),
        });
        let path = path.to_string();
        Box::pin(async move {
            if self.reject_multipart.load(Ordering::SeqCst) {
                return Err(ReplicationError::http(415, "unsupported media type"));
            }
            let mut attachments = Vec::new();
            for mut part in body.attachments {
                let mut bytes = Vec::new();
                part.reader
                    .read_to_end(&mut bytes)
                    .await
                    .map_err(|e| ReplicationError::Network(e.to_string()))?;
                attachments.push((part.name, bytes));
            }
            let doc_id = body.json.get("_id").cloned();
            let rev_id = body.json.get("_rev").cloned();
            lock(&self.multipart).push(MultipartUpload {
                path,
                json: body.json.clone(),
                attachments,
            });
            lock(&self.db)
                .insert(body.json, None)
                .ok_or_else(|| ReplicationError::http(400, "bad document"))?;
            Ok(json!({ "ok": true, "id": doc_id, "rev": rev_id }))
        })
    }
}
