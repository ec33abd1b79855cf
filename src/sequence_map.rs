// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Contiguous-prefix tracking for out-of-order completions.
//!
//! Remote sequence tokens are opaque strings, and fetches for them finish in
//! any order. Each token gets a local integer when it enters the pipeline; the
//! checkpoint only ever moves to the token of the highest integer below which
//! nothing is still pending.
//!
//! ```text
//! add(a)=1  add(b)=2  add(c)=3
//! remove(2)  → checkpoint: none   (1 still pending)
//! remove(1)  → checkpoint: b      (1..=2 done)
//! remove(3)  → checkpoint: c
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    last_sequence: u64,
    pending: BTreeSet<u64>,
    values: HashMap<u64, String>,
    first_value_sequence: u64,
    last_returned: Option<String>,
}

impl Inner {
    fn checkpointed_sequence(&self) -> u64 {
        match self.pending.first() {
            Some(&lowest) => lowest - 1,
            None => self.last_sequence,
        }
    }
}

/// Maps remote sequence tokens to local integers and computes the
/// checkpointable token. Internally serialized by one mutex.
#[derive(Debug)]
pub struct SequenceMap {
    inner: Mutex<Inner>,
}

impl Default for SequenceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                first_value_sequence: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new token; returns its local sequence.
    pub fn add_value(&self, value: impl Into<String>) -> u64 {
        let mut inner = self.lock();
        inner.last_sequence += 1;
        let seq = inner.last_sequence;
        inner.pending.insert(seq);
        inner.values.insert(seq, value.into());
        seq
    }

    /// Mark a local sequence as done. Unknown sequences are ignored.
    pub fn remove_sequence(&self, sequence: u64) {
        let mut inner = self.lock();
        inner.pending.remove(&sequence);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Highest local sequence with no pending sequence at or below it.
    pub fn checkpointed_sequence(&self) -> u64 {
        self.lock().checkpointed_sequence()
    }

    /// Token for [`checkpointed_sequence`](Self::checkpointed_sequence).
    ///
    /// When nothing new has become contiguous, returns the last value handed
    /// out, so the checkpoint never moves backwards. Values at or below the
    /// checkpoint are dropped as they are passed.
    pub fn checkpointed_value(&self) -> Option<String> {
        let mut inner = self.lock();
        let seq = inner.checkpointed_sequence();
        if seq > 0 {
            if let Some(value) = inner.values.get(&seq).cloned() {
                inner.last_returned = Some(value);
            }
            while inner.first_value_sequence <= seq {
                let first = inner.first_value_sequence;
                inner.values.remove(&first);
                inner.first_value_sequence += 1;
            }
        }
        inner.last_returned.clone()
    }
}
