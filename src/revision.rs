// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revisions and revision ID collation.
//!
//! A revision ID has the form `<generation>-<suffix>`, e.g. `3-a1b2c3`.
//! Generations grow by one along every parent→child edge of a document's
//! revision tree.
//!
//! # Ordering
//!
//! ```text
//! compare("2-abc", "10-xyz")  → Less      (generation 2 < 10, numeric)
//! compare("3-abc", "3-abd")   → Less      (same generation, suffix byte-wise)
//! compare("x-1",   "y-2")     → Less      (malformed: plain string order)
//! ```
//!
//! An ID is treated as malformed when it has no hyphen, the hyphen sits 9 or
//! more bytes in, or the prefix is not a plain decimal number.

use crate::error::{ReplicationError, Result};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Hyphen offsets at or past this position are not trusted as a generation.
const MAX_GENERATION_DIGITS: usize = 9;

/// Split a rev ID into `(generation, suffix)`.
///
/// Returns `None` for malformed IDs.
pub fn parse_rev_id(rev_id: &str) -> Option<(u64, &str)> {
    let dash = rev_id.find('-')?;
    if dash == 0 || dash >= MAX_GENERATION_DIGITS {
        return None;
    }
    let (gen, rest) = rev_id.split_at(dash);
    if !gen.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let gen = gen.parse::<u64>().ok()?;
    Some((gen, &rest[1..]))
}

/// Generation of a rev ID, or 0 if malformed.
pub fn generation(rev_id: &str) -> u64 {
    parse_rev_id(rev_id).map(|(gen, _)| gen).unwrap_or(0)
}

/// Suffix of a rev ID (the part after the first hyphen).
pub fn suffix(rev_id: &str) -> &str {
    match rev_id.find('-') {
        Some(dash) => &rev_id[dash + 1..],
        None => rev_id,
    }
}

/// Collate two revision IDs.
///
/// Numeric generation first, then suffix byte-wise. Falls back to plain
/// byte-wise comparison of the whole string when either side is malformed.
pub fn compare_rev_ids(a: &str, b: &str) -> Ordering {
    match (parse_rev_id(a), parse_rev_id(b)) {
        (Some((gen_a, suffix_a)), Some((gen_b, suffix_b))) => gen_a
            .cmp(&gen_b)
            .then_with(|| suffix_a.as_bytes().cmp(suffix_b.as_bytes())),
        _ => a.as_bytes().cmp(b.as_bytes()),
    }
}

/// One version of a document.
///
/// `properties` is the JSON body (may be absent for stubs); `sequence` is the
/// local ordering token, 0 until the local store assigns one.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    pub properties: Option<Map<String, Value>>,
    pub sequence: i64,
}

/// Ordered list of revisions, e.g. one inbox or a `changes_since` result.
pub type RevisionList = Vec<Revision>;

impl Revision {
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>, deleted: bool) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted,
            properties: None,
            sequence: 0,
        }
    }

    /// Build a revision from a full JSON body carrying `_id` and `_rev`.
    pub fn from_properties(properties: Map<String, Value>) -> Result<Self> {
        let doc_id = properties
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ReplicationError::InvalidRevision("missing _id".to_string()))?
            .to_string();
        let rev_id = properties
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| ReplicationError::InvalidRevision(format!("{doc_id}: missing _rev")))?
            .to_string();
        let deleted = properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            doc_id,
            rev_id,
            deleted,
            properties: Some(properties),
            sequence: 0,
        })
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn generation(&self) -> u64 {
        generation(&self.rev_id)
    }

    /// Body with `_id`, `_rev` and `_deleted` filled in.
    pub fn body(&self) -> Map<String, Value> {
        let mut body = self.properties.clone().unwrap_or_default();
        body.insert("_id".to_string(), Value::String(self.doc_id.clone()));
        body.insert("_rev".to_string(), Value::String(self.rev_id.clone()));
        if self.deleted {
            body.insert("_deleted".to_string(), Value::Bool(true));
        }
        body
    }

    /// The `_attachments` object, if present and non-empty.
    pub fn attachments(&self) -> Option<&Map<String, Value>> {
        self.properties
            .as_ref()?
            .get("_attachments")?
            .as_object()
            .filter(|atts| !atts.is_empty())
    }
}

/// Parse a `_revisions: {start, ids}` object into full rev IDs, newest first.
///
/// Returns `None` when the body has no usable history.
pub fn parse_revision_history(properties: &Map<String, Value>) -> Option<Vec<String>> {
    let revisions = properties.get("_revisions")?.as_object()?;
    let start = revisions.get("start")?.as_u64()?;
    let ids = revisions.get("ids")?.as_array()?;
    if ids.is_empty() || (ids.len() as u64) > start {
        return None;
    }
    ids.iter()
        .enumerate()
        .map(|(i, id)| id.as_str().map(|id| format!("{}-{}", start - i as u64, id)))
        .collect()
}

/// Encode a newest-first history as a `_revisions` object.
///
/// If `possible_ancestors` is given, the history is cut just after the first
/// entry the remote already knows, since nothing older needs to be sent.
pub fn encode_revision_history(history: &[String], possible_ancestors: Option<&[String]>) -> Value {
    let mut history = history;
    if let Some(ancestors) = possible_ancestors {
        if let Some(i) = history.iter().position(|rev| ancestors.contains(rev)) {
            history = &history[..=i];
        }
    }
    let start = history.first().map(|rev| generation(rev)).unwrap_or(0);
    let ids: Vec<Value> = history
        .iter()
        .map(|rev| Value::String(suffix(rev).to_string()))
        .collect();
    serde_json::json!({ "start": start, "ids": ids })
}

/// Validate that a newest-first history strictly decreases in generation.
pub fn validate_history(history: &[String]) -> Result<()> {
    if history.is_empty() {
        return Err(ReplicationError::InvalidRevision("empty history".to_string()));
    }
    let mut last: Option<u64> = None;
    for rev_id in history {
        let (gen, _) = parse_rev_id(rev_id)
            .ok_or_else(|| ReplicationError::InvalidRevision(format!("malformed rev ID {rev_id}")))?;
        if let Some(prev) = last {
            if gen >= prev {
                return Err(ReplicationError::InvalidRevision(format!(
                    "history out of order at {rev_id}"
                )));
            }
        }
        last = Some(gen);
    }
    Ok(())
}
