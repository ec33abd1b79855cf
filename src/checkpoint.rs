// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local checkpoint persistence.
//!
//! A replication checkpoint is the last remote (pull) or local (push)
//! sequence known to be fully replicated. It lives in two places: a
//! `_local/<checkpoint_id>` document on the remote, and a row in this SQLite
//! table. Replication resumes from the stored value only when both agree.
//!
//! ```text
//! private_uuid ─┐
//! remote_url   ─┼──▶ sha256 ──▶ checkpoint_id ──▶ checkpoints(checkpoint_id, last_sequence)
//! push | pull  ─┘
//! ```
//!
//! Reads are served from an in-memory cache loaded at open; writes go to the
//! cache first and then to disk, retried on SQLITE_BUSY/SQLITE_LOCKED.

use crate::error::{ReplicationError, Result};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Stable ID naming the checkpoint of one replication.
///
/// Derived from the local database's private UUID, the remote URL and the
/// direction, so the same pair of databases always maps to the same
/// `_local` document.
pub fn checkpoint_id(private_uuid: &str, remote_url: &str, push: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(private_uuid.as_bytes());
    hasher.update(b"\n");
    hasher.update(remote_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(if push { b"1" } else { b"0" });
    hex::encode(hasher.finalize())
}

/// SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persistent `checkpoint_id -> last_sequence` map backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, String>>,
    path: String,
}

impl CheckpointStore {
    /// Open (or create) the store at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening checkpoint store");

        let (options, max_connections) = if path_str == ":memory:" {
            // Every connection to :memory: is a separate database.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            (options, 1)
        } else {
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
            (options, 2)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                last_sequence TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT checkpoint_id, last_sequence FROM checkpoints")
            .fetch_all(&pool)
            .await?;

        let cache: HashMap<String, String> = rows.into_iter().collect();
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            path: path_str,
        })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    /// Last saved sequence for a checkpoint, `None` on first replication.
    pub async fn get(&self, checkpoint_id: &str) -> Option<String> {
        self.cache.read().await.get(checkpoint_id).cloned()
    }

    /// Persist a sequence. The cache is updated even if the disk write fails.
    pub async fn set(&self, checkpoint_id: &str, last_sequence: &str) -> Result<()> {
        self.cache
            .write()
            .await
            .insert(checkpoint_id.to_string(), last_sequence.to_string());

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        execute_with_retry("checkpoint_set", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (checkpoint_id, last_sequence, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(checkpoint_id) DO UPDATE SET
                    last_sequence = excluded.last_sequence,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(checkpoint_id)
            .bind(last_sequence)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(checkpoint_id, last_sequence, "Checkpoint persisted");
        Ok(())
    }

    pub async fn delete(&self, checkpoint_id: &str) -> Result<()> {
        self.cache.write().await.remove(checkpoint_id);

        let pool = &self.pool;
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE checkpoint_id = ?")
                .bind(checkpoint_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn close(&self) {
        if self.path != ":memory:" {
            let pool = &self.pool;
            let result = execute_with_retry("checkpoint_wal", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}
