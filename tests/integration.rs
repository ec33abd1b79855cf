// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Document Replicator
//!
//! Replicators run end to end against `MockRemote`, an in-process fake of the
//! remote database, with `MemoryStore` as the local side.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `pull_*` - change feed, fetch, insert, checkpoint
//! - `push_*` - revs_diff, bulk and multipart uploads
//! - `session_*` - cookie login and auth failures
//! - `checkpoint_*` - resume, mismatch, idempotent saves

mod common;

use common::{config, eventually, run_to_completion, Local, MockRemote, REMOTE_URL};
use doc_replicator::checkpoint::checkpoint_id;
use doc_replicator::error::ReplicationError;
use doc_replicator::memory_store::MemoryStore;
use doc_replicator::transport::{Method, SessionAuthorizer};
use doc_replicator::{CheckpointStore, MemoryBlobStore, Puller, Replicator, ReplicatorState, Revision, Storage};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn body(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn serial_config() -> doc_replicator::ReplicatorConfig {
    let mut config = config();
    config.puller.max_open_http_connections = 1;
    config
}

// =============================================================================
// Pull
// =============================================================================

#[tokio::test]
async fn pull_inserts_missing_docs_in_feed_order() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({ "name": "a" }), &["1-x"]);
    remote.add_revision("B", "1-y", json!({ "name": "b" }), &["1-y"]);
    let local = Local::new().await;

    let status = run_to_completion(local.puller(&remote, serial_config())).await;

    let a = local.store.get_document("A").unwrap();
    let b = local.store.get_document("B").unwrap();
    assert_eq!(a.rev_id, "1-x");
    assert_eq!(b.rev_id, "1-y");
    assert!(a.sequence < b.sequence, "local sequences follow feed order");
    assert_eq!(a.properties.unwrap()["name"], "a");

    assert_eq!(status.state, ReplicatorState::Stopped);
    assert_eq!(status.last_sequence.as_deref(), Some("2"));
    assert_eq!((status.changes_processed, status.changes_total), (2, 2));
    assert!(status.last_error.is_none());

    let id = checkpoint_id("local-db", REMOTE_URL, false);
    assert_eq!(remote.checkpoint(&id).unwrap()["lastSequence"], "2");
    assert_eq!(local.checkpoints.get(&id).await.as_deref(), Some("2"));
}

#[tokio::test]
async fn pull_builds_full_history_and_conflicts() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-a", json!({ "v": 1 }), &["1-a"]);
    remote.add_revision("A", "2-b", json!({ "v": 2 }), &["2-b", "1-a"]);
    remote.add_revision("A", "2-c", json!({ "v": 3 }), &["2-c", "1-a"]);
    let local = Local::new().await;

    run_to_completion(local.puller(&remote, serial_config())).await;

    let tree = local.store.revision_tree("A").unwrap();
    let mut leaves = tree.current_revision_ids();
    leaves.sort();
    assert_eq!(leaves, vec!["2-b".to_string(), "2-c".to_string()]);
    assert_eq!(local.store.get_document("A").unwrap().rev_id, "2-c");
}

#[tokio::test]
async fn pull_skips_known_revisions_without_fetching() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({ "n": 1 }), &["1-x"]);
    let local = Local::new().await;
    let known = Revision::new("A", "1-x", false).with_properties(body(json!({ "n": 1 })));
    local.store.force_insert(&known, &["1-x".to_string()], None).unwrap();

    let status = run_to_completion(local.puller(&remote, config())).await;

    assert_eq!(remote.document_fetches(), 0);
    assert_eq!(status.last_sequence.as_deref(), Some("1"));
}

#[tokio::test]
async fn pull_skips_forbidden_revisions() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    remote.add_revision("secret", "1-y", json!({}), &["1-y"]);
    let blobs = Arc::new(MemoryBlobStore::new());
    let store = Arc::new(
        MemoryStore::with_uuid("local-db")
            .with_blob_store(blobs.clone())
            .with_validation(Arc::new(|rev: &Revision| rev.doc_id != "secret")),
    );
    let local = Local::with_store(store, blobs).await;

    let status = run_to_completion(local.puller(&remote, serial_config())).await;

    assert!(local.store.get_document("A").is_some());
    assert!(local.store.get_document("secret").is_none());
    assert_eq!(status.last_sequence.as_deref(), Some("2"), "forbidden revisions still complete");
    assert_eq!(status.changes_processed, 2);
}

#[tokio::test]
async fn pull_failed_insert_holds_checkpoint() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let local = Local::new().await;
    local.store.fail_next_commit();

    let status = run_to_completion(local.puller(&remote, config())).await;

    assert!(local.store.get_document("A").is_none());
    assert_eq!(status.last_sequence, None);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn pull_bad_revision_does_not_block_rest_of_batch() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({ "name": "a" }), &["1-x"]);
    remote.add_revision(
        "B",
        "1-y",
        json!({ "_attachments": { "b.txt": { "content_type": "text/plain", "data": "!!!not base64!!!" } } }),
        &["1-y"],
    );
    let local = Local::new().await;

    let status = run_to_completion(local.puller(&remote, serial_config())).await;

    assert_eq!(local.store.get_document("A").unwrap().rev_id, "1-x");
    assert!(local.store.get_document("B").is_none());
    assert_eq!(status.last_sequence.as_deref(), Some("1"), "the bad revision holds the checkpoint");
    assert!(matches!(status.last_error.as_deref(), Some(ReplicationError::InvalidRevision(_))));
    assert_eq!(status.changes_processed, 2);
}

#[tokio::test]
async fn pull_fetches_inline_attachments_into_blob_store() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision(
        "photo",
        "1-p",
        json!({ "_attachments": { "a.txt": { "content_type": "text/plain", "data": "aGVsbG8=" } } }),
        &["1-p"],
    );
    let local = Local::new().await;

    run_to_completion(local.puller(&remote, config())).await;

    let doc = local.store.get_document("photo").unwrap();
    let meta = &doc.attachments().unwrap()["a.txt"];
    assert_eq!(meta["stub"], true);
    let digest = meta["digest"].as_str().unwrap();
    assert_eq!(local.blobs.get(digest).unwrap(), b"hello");

    let fetch = remote
        .requests()
        .into_iter()
        .find(|r| r.path.starts_with("photo?"))
        .unwrap();
    assert!(fetch.path.contains("revs=true"));
    assert!(fetch.path.contains("attachments=true"));
}

#[tokio::test]
async fn pull_sends_atts_since_for_known_leaves() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "2-b", json!({}), &["2-b", "1-a"]);
    let local = Local::new().await;
    let known = Revision::new("A", "1-a", false).with_properties(Map::new());
    local.store.force_insert(&known, &["1-a".to_string()], None).unwrap();

    run_to_completion(local.puller(&remote, config())).await;

    let fetch = remote.requests().into_iter().find(|r| r.path.starts_with("A?")).unwrap();
    assert!(fetch.path.contains("atts_since=%5B%221-a%22%5D"), "{}", fetch.path);
    assert_eq!(local.store.get_document("A").unwrap().rev_id, "2-b");
}

#[tokio::test]
async fn pull_continuous_picks_up_new_changes() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let local = Local::new().await;
    let mut config = config();
    config.continuous = true;

    let puller = local.puller(&remote, config);
    puller.clone().start().await.unwrap();
    assert!(eventually(|| local.store.get_document("A").is_some()).await);

    remote.add_revision("B", "1-y", json!({}), &["1-y"]);
    assert!(eventually(|| local.store.get_document("B").is_some()).await);
    assert_eq!(puller.status().state, ReplicatorState::Replicating);

    puller.clone().stop().await;
    let status = puller.status();
    assert_eq!(status.state, ReplicatorState::Stopped);
    assert_eq!(status.last_sequence.as_deref(), Some("2"));
    let requests = remote.requests_to("_changes");
    assert!(requests.iter().all(|r| r.path.contains("feed=longpoll")));
}

#[tokio::test]
async fn pull_continuous_survives_change_feed_outage() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let local = Local::new().await;
    let mut config = config();
    config.continuous = true;
    let max_attempts = config.change_tracker.retry_max_attempts;

    remote.fail_path("_changes", 503);
    let puller = local.puller(&remote, config);
    puller.clone().start().await.unwrap();

    assert!(eventually(|| remote.requests_to("_changes").len() > max_attempts + 1).await);
    let status = puller.status();
    assert_eq!(status.state, ReplicatorState::Replicating);
    assert!(matches!(status.last_error.as_deref(), Some(ReplicationError::Http { status: 503, .. })));

    remote.clear_failures();
    assert!(eventually(|| local.store.get_document("A").is_some()).await);
    remote.add_revision("B", "1-y", json!({}), &["1-y"]);
    assert!(eventually(|| local.store.get_document("B").is_some()).await);
    assert_eq!(puller.status().state, ReplicatorState::Replicating);

    puller.clone().stop().await;
    assert_eq!(puller.status().state, ReplicatorState::Stopped);
}

// =============================================================================
// Push
// =============================================================================

#[tokio::test]
async fn push_uploads_plain_docs_with_bulk_docs() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    let local = Local::new().await;
    let a = local.store.put("A", body(json!({ "n": 1 })), None).unwrap().revision.unwrap();
    let a2 = local
        .store
        .put("A", body(json!({ "n": 2 })), Some(&a.rev_id))
        .unwrap()
        .revision
        .unwrap();

    let status = run_to_completion(local.pusher(&remote, config())).await;

    assert!(remote.has_revision("A", &a2.rev_id));
    let bulk = remote.requests_to("_bulk_docs");
    assert_eq!(bulk.len(), 1);
    let request = bulk[0].body.as_ref().unwrap();
    assert_eq!(request["new_edits"], false);
    assert_eq!(request["docs"][0]["_revisions"]["start"], 2);
    assert_eq!(status.last_sequence.as_deref(), Some("2"));

    let id = checkpoint_id("local-db", REMOTE_URL, true);
    assert_eq!(remote.checkpoint(&id).unwrap()["lastSequence"], "2");
}

#[tokio::test]
async fn push_uploads_attachment_as_multipart() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    let local = Local::new().await;
    let c = local
        .store
        .put(
            "C",
            body(json!({ "_attachments": { "note.txt": { "content_type": "text/plain", "data": "aGVsbG8=" } } })),
            None,
        )
        .unwrap()
        .revision
        .unwrap();

    run_to_completion(local.pusher(&remote, config())).await;

    assert!(remote.requests_to("_bulk_docs").is_empty(), "C must not go through _bulk_docs");
    let uploads = remote.multipart_uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, "C?new_edits=false");
    assert_eq!(uploads[0].json["_attachments"]["note.txt"]["follows"], true);
    assert_eq!(uploads[0].attachments, vec![("note.txt".to_string(), b"hello".to_vec())]);
    assert!(remote.has_revision("C", &c.rev_id));
}

#[tokio::test]
async fn push_falls_back_to_inline_json_on_415() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.reject_multipart();
    let local = Local::new().await;
    let c = local
        .store
        .put("C", body(json!({ "_attachments": { "a.bin": { "data": "AAEC" } } })), None)
        .unwrap()
        .revision
        .unwrap();

    let pusher = local.pusher(&remote, config());
    let status = run_to_completion(pusher.clone()).await;

    assert!(!pusher.sends_multipart());
    let stored = remote.revision_body("C", &c.rev_id).unwrap();
    assert_eq!(stored["_attachments"]["a.bin"]["data"], "AAEC");
    assert_eq!(status.last_sequence.as_deref(), Some("1"));
}

#[tokio::test]
async fn push_skips_revisions_remote_has() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    let local = Local::new().await;
    let a = local.store.put("A", body(json!({})), None).unwrap().revision.unwrap();
    remote.add_revision("A", &a.rev_id, json!({}), &[a.rev_id.as_str()]);

    let status = run_to_completion(local.pusher(&remote, config())).await;

    assert!(remote.requests_to("_bulk_docs").is_empty());
    assert_eq!(status.changes_processed, 1);
    assert_eq!(status.last_sequence.as_deref(), Some("1"));
}

#[tokio::test]
async fn push_remote_forbidden_counts_as_done() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.forbid_doc("A");
    let local = Local::new().await;
    local.store.put("A", body(json!({})), None).unwrap();
    local.store.put("B", body(json!({})), None).unwrap();

    let status = run_to_completion(local.pusher(&remote, config())).await;

    assert_eq!(status.last_sequence.as_deref(), Some("2"));
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn push_creates_target_when_asked() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.without_database();
    let local = Local::new().await;
    local.store.put("A", body(json!({})), None).unwrap();
    let mut config = config();
    config.create_target = true;

    let status = run_to_completion(local.pusher(&remote, config.clone())).await;
    assert!(remote.database_exists());
    assert!(status.last_error.is_none());

    // Second run: the 412 "already exists" is not an error.
    let again = Local::new().await;
    let status = run_to_completion(again.pusher(&remote, config)).await;
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn push_continuous_skips_changes_pulled_from_same_remote() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    let local = Local::new().await;
    let mut config = config();
    config.continuous = true;

    let pusher = local.pusher(&remote, config);
    pusher.clone().start().await.unwrap();

    let edit = local.store.put("local", body(json!({})), None).unwrap().revision.unwrap();
    let echo = Revision::new("pulled", "1-r", false).with_properties(Map::new());
    local
        .store
        .force_insert(&echo, &["1-r".to_string()], Some(REMOTE_URL))
        .unwrap();

    assert!(eventually(|| remote.has_revision("local", &edit.rev_id)).await);
    pusher.clone().stop().await;

    assert!(!remote.has_revision("pulled", "1-r"));
    let diffs = remote.requests_to("_revs_diff");
    assert!(diffs
        .iter()
        .all(|r| r.body.as_ref().unwrap().get("pulled").is_none()));
}

#[tokio::test]
async fn push_then_pull_transfers_nothing_back() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    let local = Local::new().await;
    local.store.put("A", body(json!({ "n": 1 })), None).unwrap();
    local.store.put("B", body(json!({ "n": 2 })), None).unwrap();

    run_to_completion(local.pusher(&remote, config())).await;
    let status = run_to_completion(local.puller(&remote, config())).await;

    assert_eq!(remote.document_fetches(), 0);
    assert_eq!(status.changes_total, 2);
    assert_eq!(local.store.last_sequence(), 2);
}

// =============================================================================
// Session
// =============================================================================

#[tokio::test]
async fn session_logs_in_before_replicating() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.require_login("alice", "secret");
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let local = Local::new().await;
    let context = local.context(&remote).with_authorizer(Arc::new(SessionAuthorizer {
        username: "alice".to_string(),
        password: "secret".to_string(),
    }));

    let status = run_to_completion(Puller::new(config(), &context, &local.sessions)).await;

    assert!(status.last_error.is_none());
    assert!(local.store.get_document("A").is_some());
    let logins: Vec<_> = remote
        .requests_to("_session")
        .into_iter()
        .filter(|r| r.method == Method::Post)
        .collect();
    assert_eq!(logins.len(), 1);
}

#[tokio::test]
async fn session_bad_credentials_stop_replication() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.require_login("alice", "secret");
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let local = Local::new().await;
    let context = local.context(&remote).with_authorizer(Arc::new(SessionAuthorizer {
        username: "alice".to_string(),
        password: "wrong".to_string(),
    }));

    let status = run_to_completion(Puller::new(config(), &context, &local.sessions)).await;

    assert_eq!(status.state, ReplicatorState::Stopped);
    assert!(status.last_error.unwrap().is_auth_failure());
    assert!(remote.requests_to("_changes").is_empty());
    assert!(local.store.get_document("A").is_none());
}

#[tokio::test]
async fn session_legacy_path_after_404() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.fail_path("/_session", 404);
    let local = Local::new().await;
    let context = local.context(&remote).with_authorizer(Arc::new(SessionAuthorizer {
        username: "alice".to_string(),
        password: "secret".to_string(),
    }));

    let status = run_to_completion(Puller::new(config(), &context, &local.sessions)).await;

    assert!(status.last_error.is_none());
    let probes: Vec<String> = remote
        .requests()
        .into_iter()
        .filter(|r| r.method == Method::Get && r.path.ends_with("_session"))
        .map(|r| r.path)
        .collect();
    assert_eq!(probes, vec!["/_session".to_string(), "_session".to_string()]);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    let local = Local::new().await;
    let puller = local.puller(&remote, config());

    run_to_completion(puller.clone()).await;
    assert!(puller.clone().start().await.is_err());
}

// =============================================================================
// Checkpoints
// =============================================================================

#[tokio::test]
async fn checkpoint_resume_pulls_only_new_changes() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    remote.add_revision("B", "1-y", json!({}), &["1-y"]);
    let local = Local::new().await;

    run_to_completion(local.puller(&remote, config())).await;
    remote.add_revision("C", "1-z", json!({}), &["1-z"]);
    let fetches_before = remote.document_fetches();

    let status = run_to_completion(local.puller(&remote, config())).await;

    let last_feed = remote.requests_to("_changes").pop().unwrap();
    assert!(last_feed.path.contains("since=2"), "{}", last_feed.path);
    assert_eq!(remote.document_fetches() - fetches_before, 1);
    assert_eq!(status.changes_total, 1);
    assert_eq!(status.last_sequence.as_deref(), Some("3"));
}

#[tokio::test]
async fn checkpoint_mismatch_restarts_from_zero() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let local = Local::new().await;
    let id = checkpoint_id("local-db", REMOTE_URL, false);
    local.checkpoints.set(&id, "17").await.unwrap();

    let status = run_to_completion(local.puller(&remote, config())).await;

    let feed = remote.requests_to("_changes");
    assert!(!feed[0].path.contains("since="), "{}", feed[0].path);
    assert_eq!(status.last_sequence.as_deref(), Some("1"));
    assert_eq!(local.checkpoints.get(&id).await.as_deref(), Some("1"));
}

#[tokio::test]
async fn checkpoint_save_is_idempotent() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let local = Local::new().await;
    let puller = local.puller(&remote, config());
    run_to_completion(puller.clone()).await;

    let saves = || {
        remote
            .requests_to("_local/")
            .into_iter()
            .filter(|r| r.method == Method::Put)
            .count()
    };
    let before = saves();
    puller.core().save_last_sequence().await.unwrap();
    puller.core().save_last_sequence().await.unwrap();
    assert_eq!(saves(), before);
    assert_eq!(before, 1);
}

#[tokio::test]
async fn checkpoint_second_run_carries_remote_rev() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let local = Local::new().await;
    run_to_completion(local.puller(&remote, config())).await;

    // The mock answers 409 unless the PUT carries the stored _rev.
    remote.add_revision("B", "1-y", json!({}), &["1-y"]);
    let status = run_to_completion(local.puller(&remote, config())).await;

    let id = checkpoint_id("local-db", REMOTE_URL, false);
    assert!(status.last_error.is_none());
    assert_eq!(remote.checkpoint(&id).unwrap()["lastSequence"], "2");
    assert_eq!(local.checkpoints.get(&id).await.as_deref(), Some("2"));
}

#[tokio::test]
async fn checkpoint_remote_conflict_is_reread() {
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    let local = Local::new().await;
    let id = checkpoint_id("local-db", REMOTE_URL, false);
    let puller = local.puller(&remote, config());
    let core = puller.core();

    core.start_session().await.unwrap();
    core.set_last_sequence("4".to_string());
    core.save_last_sequence().await.unwrap();

    // Another writer updates the checkpoint behind our back.
    remote.bump_checkpoint(&id);
    core.set_last_sequence("9".to_string());
    core.save_last_sequence().await.unwrap();

    assert_eq!(remote.checkpoint(&id).unwrap()["lastSequence"], "9");
    let conflicts_reread = remote
        .requests_to("_local/")
        .into_iter()
        .filter(|r| r.method == Method::Get)
        .count();
    assert_eq!(conflicts_reread, 2, "initial read plus one re-read after 409");
    assert_eq!(local.checkpoints.get(&id).await.as_deref(), Some("9"));
}

#[tokio::test]
async fn checkpoint_resume_survives_reopening_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let remote = Arc::new(MockRemote::new(REMOTE_URL));
    remote.add_revision("A", "1-x", json!({}), &["1-x"]);
    let blobs = Arc::new(MemoryBlobStore::new());
    let store = Arc::new(MemoryStore::with_uuid("local-db").with_blob_store(blobs.clone()));

    let mut first = Local::with_store(store.clone(), blobs.clone()).await;
    first.checkpoints = Arc::new(CheckpointStore::open(&path).await.unwrap());
    run_to_completion(first.puller(&remote, config())).await;
    first.checkpoints.close().await;

    remote.add_revision("B", "1-y", json!({}), &["1-y"]);
    let mut second = Local::with_store(store, blobs).await;
    second.checkpoints = Arc::new(CheckpointStore::open(&path).await.unwrap());
    let status = run_to_completion(second.puller(&remote, config())).await;

    assert_eq!(remote.document_fetches(), 2);
    assert_eq!(status.changes_total, 1);
    assert_eq!(status.last_sequence.as_deref(), Some("2"));
}
