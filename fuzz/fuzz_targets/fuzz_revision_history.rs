//! Fuzz target for `_revisions` history decoding.
//!
//! Any history that decodes must re-encode to the same IDs, as long as
//! its generations are short enough to collate.

#![no_main]

use doc_replicator::revision::{encode_revision_history, parse_rev_id, parse_revision_history};
use libfuzzer_sys::fuzz_target;
use serde_json::{Map, Value};

fuzz_target!(|data: &[u8]| {
    let Ok(revisions) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    let mut body = Map::new();
    body.insert("_revisions".to_string(), revisions);

    if let Some(history) = parse_revision_history(&body) {
        assert!(!history.is_empty());
        if parse_rev_id(&history[0]).is_none() {
            return;
        }
        let mut reencoded = Map::new();
        reencoded.insert("_revisions".to_string(), encode_revision_history(&history, None));
        assert_eq!(parse_revision_history(&reencoded), Some(history));
    }
});
