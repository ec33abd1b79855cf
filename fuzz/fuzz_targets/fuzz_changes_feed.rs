//! Fuzz target for `_changes` response parsing.
//!
//! Arbitrary JSON from the remote must produce either a change list or an
//! error, never a panic.

#![no_main]

use doc_replicator::change_tracker::parse_changes;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    if let Ok((changes, last_seq)) = parse_changes(&body) {
        if !changes.is_empty() {
            assert!(last_seq.is_some());
        }
    }
});
