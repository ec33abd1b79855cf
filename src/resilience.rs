//! Resilience utilities: retry backoff and bulkheads.
//!
//! - [`RetryConfig`]: Exponential backoff for transient change-feed failures
//! - [`Bulkhead`]: Semaphore capping simultaneous revision fetches
//!
//! # Example
//!
//! ```rust
//! use doc_replicator::resilience::Bulkhead;
//!
//! // At most 2 fetches in flight
//! let bulkhead = Bulkhead::new(2);
//! let permit = bulkhead.try_acquire().expect("slot free");
//! assert_eq!(bulkhead.in_flight(), 1);
//! drop(permit); // slot released
//! assert_eq!(bulkhead.in_flight(), 0);
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Backoff policy for retrying transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn should_retry(&self, failures: usize) -> bool {
        failures < self.max_attempts
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Limits concurrent operations with a semaphore.
///
/// The permit count is checked and updated atomically; the guarded operation
/// itself runs with no lock held. Dropping the permit releases the slot.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Try to acquire a permit without waiting.
    ///
    /// Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }
}
