//! Replicator state types.
//!
//! Defines the lifecycle shared by the puller and the pusher.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Idle ──────────────────▶ Started(CheckingSession)
//!   │                              │
//!   │ stop()                       ▼
//!   │                      Started(FetchingCheckpoint)
//!   │                              │
//!   │                              ▼
//!   │                         Replicating
//!   │                              │ stop() / feed exhausted / terminal error
//!   │                              ▼
//!   └──────────────────────▶  Stopping ──(async tasks drained)──▶ Stopped
//! ```

use crate::error::ReplicationError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sub-phase of `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPhase {
    CheckingSession,
    FetchingCheckpoint,
}

/// State of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Created, `start()` not yet called.
    Idle,

    /// Negotiating the session and reading the checkpoint.
    Started(StartPhase),

    /// Moving revisions.
    Replicating,

    /// `stop()` called; waiting for in-flight work to drain.
    Stopping,

    /// Done. Check `last_error` for why.
    Stopped,
}

impl ReplicatorState {
    /// No further transitions.
    pub fn is_terminal(self) -> bool {
        self == ReplicatorState::Stopped
    }

    /// Between `start()` and the end of `Stopping`.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ReplicatorState::Started(_) | ReplicatorState::Replicating | ReplicatorState::Stopping
        )
    }
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicatorState::Idle => write!(f, "Idle"),
            ReplicatorState::Started(_) => write!(f, "Started"),
            ReplicatorState::Replicating => write!(f, "Replicating"),
            ReplicatorState::Stopping => write!(f, "Stopping"),
            ReplicatorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Pull,
    Push,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }

    pub fn is_push(self) -> bool {
        self == Direction::Push
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a replicator's progress, published on a watch channel.
#[derive(Debug, Clone)]
pub struct ReplicatorStatus {
    pub state: ReplicatorState,
    pub changes_processed: u64,
    pub changes_total: u64,
    /// Checkpointable sequence: remote token for pulls, local sequence for pushes.
    pub last_sequence: Option<String>,
    /// Most recent error. Not cleared by later successes.
    pub last_error: Option<Arc<ReplicationError>>,
}

impl Default for ReplicatorStatus {
    fn default() -> Self {
        Self {
            state: ReplicatorState::Idle,
            changes_processed: 0,
            changes_total: 0,
            last_sequence: None,
            last_error: None,
        }
    }
}

/// Hands out replication session IDs (`repl001`, `repl002`, ...).
///
/// Owned by whoever creates replicators, so separate owners (and separate
/// tests) number their sessions independently.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    next: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("repl{:03}", n)
    }
}
