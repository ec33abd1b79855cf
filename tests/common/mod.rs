//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - A mock remote database implementing `Transport`
//! - Replicator construction helpers over `MemoryStore`

#![allow(dead_code)]

pub mod mock_remote;

pub use mock_remote::*;

use doc_replicator::{
    CheckpointStore, MemoryBlobStore, MemoryStore, Puller, Pusher, Replicator, ReplicatorConfig, ReplicatorContext,
    ReplicatorStatus, SessionIdGenerator,
};
use std::sync::Arc;
use std::time::Duration;

pub const REMOTE_URL: &str = "http://remote.test/db";

/// One local database plus the collaborators replicators need.
pub struct Local {
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub sessions: SessionIdGenerator,
}

impl Local {
    pub async fn new() -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(MemoryStore::with_uuid("local-db").with_blob_store(blobs.clone()));
        Self::with_store(store, blobs).await
    }

    pub async fn with_store(store: Arc<MemoryStore>, blobs: Arc<MemoryBlobStore>) -> Self {
        init_tracing();
        let checkpoints = Arc::new(CheckpointStore::in_memory().await.unwrap());
        Self {
            store,
            blobs,
            checkpoints,
            sessions: SessionIdGenerator::new(),
        }
    }

    pub fn context(&self, remote: &Arc<MockRemote>) -> ReplicatorContext {
        ReplicatorContext::new(remote.clone(), self.store.clone(), self.checkpoints.clone())
            .with_blob_store(self.blobs.clone())
    }

    pub fn puller(&self, remote: &Arc<MockRemote>, config: ReplicatorConfig) -> Arc<Puller> {
        Puller::new(config, &self.context(remote), &self.sessions)
    }

    pub fn pusher(&self, remote: &Arc<MockRemote>, config: ReplicatorConfig) -> Arc<Pusher> {
        Pusher::new(config, &self.context(remote), &self.sessions).unwrap()
    }
}

/// Send `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> ReplicatorConfig {
    ReplicatorConfig::for_testing(REMOTE_URL)
}

/// Start a one-shot replicator and wait for it to finish.
pub async fn run_to_completion<R: Replicator>(replicator: Arc<R>) -> ReplicatorStatus {
    replicator.clone().start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), replicator.core().wait_until_stopped())
        .await
        .expect("replication did not finish")
}

/// Poll `condition` until it holds or a few seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
