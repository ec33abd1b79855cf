//! Configuration for the replicator.
//!
//! All types are plain serde structs with defaults, so a config can be built
//! programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use doc_replicator::config::ReplicatorConfig;
//!
//! let config = ReplicatorConfig {
//!     remote_url: "http://sync.example.com/db".into(),
//!     continuous: true,
//!     ..Default::default()
//! };
//! assert_eq!(config.puller.max_open_http_connections, 16);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── remote_url: String
//! ├── continuous / create_target
//! ├── filter / filter_params / doc_ids
//! ├── puller: PullerConfig              # fetch concurrency, insert batching
//! ├── pusher: PusherConfig              # inbox batching
//! ├── change_tracker: ChangeTrackerConfig
//! ├── checkpoint: CheckpointConfig      # debounce + SQLite path
//! └── revision_tree: RevisionTreeConfig # history depth
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! remote_url: "https://sync.example.com/db"
//! continuous: true
//! puller:
//!   max_open_http_connections: 8
//! checkpoint:
//!   save_delay_ms: 5000
//!   sqlite_path: "/var/lib/app/checkpoints.db"
//! ```

use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for one replication (pull or push) against one remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Base URL of the remote database. Also the `source` tag used to
    /// recognise revisions that arrived from it.
    pub remote_url: String,

    /// Keep running after catching up (long-poll / local observer).
    #[serde(default)]
    pub continuous: bool,

    /// Push only: create the remote database before pushing.
    #[serde(default)]
    pub create_target: bool,

    /// Named filter. For pulls it is passed to the remote change feed; for
    /// pushes it selects a locally registered filter function.
    #[serde(default)]
    pub filter: Option<String>,

    #[serde(default)]
    pub filter_params: Map<String, Value>,

    /// Restrict replication to these document IDs.
    #[serde(default)]
    pub doc_ids: Vec<String>,

    #[serde(default)]
    pub puller: PullerConfig,

    #[serde(default)]
    pub pusher: PusherConfig,

    #[serde(default)]
    pub change_tracker: ChangeTrackerConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub revision_tree: RevisionTreeConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            remote_url: "http://localhost:4984/db".to_string(),
            continuous: false,
            create_target: false,
            filter: None,
            filter_params: Map::new(),
            doc_ids: Vec::new(),
            puller: PullerConfig::default(),
            pusher: PusherConfig::default(),
            change_tracker: ChangeTrackerConfig::default(),
            checkpoint: CheckpointConfig::default(),
            revision_tree: RevisionTreeConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Fast timers and an in-memory checkpoint store.
    pub fn for_testing(remote_url: &str) -> Self {
        Self {
            remote_url: remote_url.to_string(),
            puller: PullerConfig::for_testing(),
            pusher: PusherConfig::for_testing(),
            change_tracker: ChangeTrackerConfig::for_testing(),
            checkpoint: CheckpointConfig::in_memory(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PullerConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullerConfig {
    /// Hard cap on simultaneous revision fetches.
    #[serde(default = "default_max_open_http_connections")]
    pub max_open_http_connections: usize,

    /// Fetched revisions buffered before one insert transaction.
    #[serde(default = "default_insert_batch_capacity")]
    pub insert_batch_capacity: usize,

    #[serde(default = "default_insert_batch_delay_ms")]
    pub insert_batch_delay_ms: u64,

    /// Change-feed entries buffered before one `find_missing_revisions`.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    #[serde(default = "default_inbox_delay_ms")]
    pub inbox_delay_ms: u64,

    /// Stop reading the change feed while more than this many revisions
    /// wait to be fetched.
    #[serde(default = "default_max_pending_revisions")]
    pub max_pending_revisions: usize,
}

fn default_max_open_http_connections() -> usize {
    16
}

fn default_insert_batch_capacity() -> usize {
    200
}

fn default_insert_batch_delay_ms() -> u64 {
    1000
}

fn default_inbox_capacity() -> usize {
    100
}

fn default_inbox_delay_ms() -> u64 {
    500
}

fn default_max_pending_revisions() -> usize {
    1000
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            max_open_http_connections: 16,
            insert_batch_capacity: 200,
            insert_batch_delay_ms: 1000,
            inbox_capacity: 100,
            inbox_delay_ms: 500,
            max_pending_revisions: 1000,
        }
    }
}

impl PullerConfig {
    pub fn for_testing() -> Self {
        Self {
            insert_batch_delay_ms: 20,
            inbox_delay_ms: 10,
            ..Default::default()
        }
    }

    pub fn insert_batch_delay(&self) -> Duration {
        Duration::from_millis(self.insert_batch_delay_ms)
    }

    pub fn inbox_delay(&self) -> Duration {
        Duration::from_millis(self.inbox_delay_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PusherConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PusherConfig {
    /// Local changes buffered before one `_revs_diff` round-trip.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    #[serde(default = "default_inbox_delay_ms")]
    pub inbox_delay_ms: u64,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 100,
            inbox_delay_ms: 500,
        }
    }
}

impl PusherConfig {
    pub fn for_testing() -> Self {
        Self {
            inbox_capacity: 100,
            inbox_delay_ms: 10,
        }
    }

    pub fn inbox_delay(&self) -> Duration {
        Duration::from_millis(self.inbox_delay_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeTrackerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote change feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeTrackerConfig {
    /// `limit` for long-poll requests.
    #[serde(default = "default_longpoll_limit")]
    pub longpoll_limit: usize,

    /// `heartbeat` asked of the server (ms).
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Consecutive transient failures before a one-shot feed gives up. A
    /// long-poll feed reports the outage at this point and keeps retrying.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_longpoll_limit() -> usize {
    50
}

fn default_heartbeat_ms() -> u64 {
    300_000
}

fn default_retry_max_attempts() -> usize {
    10
}

fn default_retry_initial_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for ChangeTrackerConfig {
    fn default() -> Self {
        Self {
            longpoll_limit: 50,
            heartbeat_ms: 300_000,
            retry_max_attempts: 10,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl ChangeTrackerConfig {
    pub fn for_testing() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_initial_delay_ms: 5,
            retry_max_delay_ms: 20,
            ..Default::default()
        }
    }

    /// Backoff policy for transient feed failures.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Debounce between a `last_sequence` change and the remote write.
    #[serde(default = "default_save_delay_ms")]
    pub save_delay_ms: u64,

    /// SQLite file for local checkpoints.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_save_delay_ms() -> u64 {
    2000
}

fn default_sqlite_path() -> String {
    "replicator_checkpoints.db".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_delay_ms: 2000,
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl CheckpointConfig {
    /// In-memory SQLite and a short debounce (tests).
    pub fn in_memory() -> Self {
        Self {
            save_delay_ms: 20,
            sqlite_path: ":memory:".to_string(),
        }
    }

    pub fn save_delay(&self) -> Duration {
        Duration::from_millis(self.save_delay_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RevisionTreeConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionTreeConfig {
    /// Revisions retained per branch; older ancestors are pruned.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_depth() -> usize {
    20
}

impl Default for RevisionTreeConfig {
    fn default() -> Self {
        Self { max_depth: 20 }
    }
}
