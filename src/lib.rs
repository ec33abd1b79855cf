//! # Document Replicator
//!
//! Client-driven replication of a local document store with a remote
//! document database speaking the `_changes` / `_revs_diff` / `_bulk_docs`
//! protocol.
//!
//! ## Architecture
//!
//! Each direction is its own replicator. Both share [`ReplicatorCore`]: the
//! state machine, session check and checkpoint bookkeeping.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              doc-replicator                               │
//! │                                                                           │
//! │  Puller                                                                   │
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────┐   ┌─────────┐  │
//! │  │ ChangeTracker │──►│ inbox Batcher │──►│ bounded fetch │──►│ insert  │  │
//! │  │ (_changes)    │   │ (revs missing)│   │ (GET ?revs=)  │   │ Batcher │  │
//! │  └───────────────┘   └───────────────┘   └───────────────┘   └────┬────┘  │
//! │                              SequenceMap ◄────────────────────────┤       │
//! │                                                                   ▼       │
//! │                                                         ┌──────────────┐  │
//! │  Pusher                                                 │   Storage    │  │
//! │  ┌───────────────┐   ┌───────────────┐   ┌──────────┐   │ (RevisionTree│  │
//! │  │ changes_since │──►│ inbox Batcher │──►│_revs_diff│   │  per doc)    │  │
//! │  │ + subscribe() │   └───────────────┘   └────┬─────┘   └──────────────┘  │
//! │  └───────────────┘                            ▼                           │
//! │                              _bulk_docs  /  multipart PUT                 │
//! │                                                                           │
//! │  Checkpoints: _local/<sha256 id> on the remote + CheckpointStore (SQLite) │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replicator::{
//!     CheckpointStore, MemoryStore, Puller, Replicator, ReplicatorConfig, ReplicatorContext,
//!     SessionIdGenerator, Transport,
//! };
//! use std::sync::Arc;
//!
//! async fn pull(transport: Arc<dyn Transport>) -> doc_replicator::Result<()> {
//!     let checkpoints = Arc::new(CheckpointStore::open("checkpoints.db").await?);
//!     let context = ReplicatorContext::new(transport, Arc::new(MemoryStore::new()), checkpoints);
//!     let sessions = SessionIdGenerator::new();
//!
//!     let puller = Puller::new(ReplicatorConfig::default(), &context, &sessions);
//!     Arc::clone(&puller).start().await?;
//!     let status = puller.core().wait_until_stopped().await;
//!     println!("pulled {} changes", status.changes_processed);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod change_tracker;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memory_store;
pub mod metrics;
pub mod replicator;
pub mod resilience;
pub mod rev_tree;
pub mod revision;
pub mod sequence_map;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use batch::{BatchConfig, Batcher};
pub use change_tracker::{ChangeTracker, ChangeTrackerMode, RemoteChange, TrackerEvent};
pub use checkpoint::CheckpointStore;
pub use config::{
    ChangeTrackerConfig, CheckpointConfig, PullerConfig, PusherConfig, ReplicatorConfig, RevisionTreeConfig,
};
pub use error::{ReplicationError, Result, Status};
pub use memory_store::{MemoryBlobStore, MemoryStore};
pub use replicator::{
    Direction, Puller, Pusher, Replicator, ReplicatorContext, ReplicatorCore, ReplicatorState, ReplicatorStatus,
    SessionIdGenerator,
};
pub use rev_tree::RevisionTree;
pub use revision::{compare_rev_ids, Revision, RevisionList};
pub use sequence_map::SequenceMap;
pub use storage::{BlobStore, DocumentChange, RevisionFilter, Storage};
pub use transport::{Authorizer, Method, MultipartBody, SessionAuthorizer, Transport};
