// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-document revision tree.
//!
//! Revisions live in an arena (`Vec<RevNode>`) indexed by rev ID, with parent
//! links pointing back into the arena. Leaves are nodes nobody points at;
//! more than one open leaf means the document is in conflict.
//!
//! ```text
//!   1-a ── 2-b ── 3-c            leaves: 3-c, 3-x
//!            └─── 3-x (deleted)  winner: 3-x (deletion wins)
//! ```
//!
//! # Winner Selection
//!
//! Among open leaves: a deleted leaf beats a live one; otherwise the higher
//! generation wins; otherwise the greater rev ID under [`compare_rev_ids`].
//!
//! # Conflict Resolution
//!
//! [`RevisionTree::resolve_conflict`] ends the losing branch with a deleted
//! child. That tombstone is a closed leaf: it carries a sequence so it is
//! replicated like any other change, but it never takes part in winner
//! selection. The optional merged body becomes a new child of the winning
//! leaf.
//!
//! The tree itself is not synchronized. Callers hold one lock per document
//! (see [`MemoryStore`](crate::memory_store::MemoryStore)).

use crate::error::Status;
use crate::revision::{compare_rev_ids, generation, validate_history, Revision};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct RevNode {
    rev_id: String,
    parent: Option<usize>,
    deleted: bool,
    properties: Option<Map<String, Value>>,
    sequence: i64,
    /// Tombstone ending a branch that lost an explicit conflict resolution.
    closed: bool,
}

/// Outcome of a local write: status plus the stored revision on success.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub status: Status,
    pub revision: Option<Revision>,
}

/// Outcome of [`RevisionTree::resolve_conflict`].
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub status: Status,
    /// Deleted child closing the losing branch.
    pub tombstone: Option<Revision>,
    /// Merged body written on top of the winning leaf.
    pub merged: Option<Revision>,
}

impl ResolveOutcome {
    fn rejected(status: Status) -> Self {
        Self {
            status,
            tombstone: None,
            merged: None,
        }
    }
}

impl PutOutcome {
    fn rejected(status: Status) -> Self {
        Self {
            status,
            revision: None,
        }
    }
}

/// All known revisions of one document.
#[derive(Debug, Clone)]
pub struct RevisionTree {
    doc_id: String,
    nodes: Vec<RevNode>,
    index: HashMap<String, usize>,
}

impl RevisionTree {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, rev_id: &str) -> bool {
        self.index.contains_key(rev_id)
    }

    /// Look up a revision by ID (body included if known).
    pub fn get(&self, rev_id: &str) -> Option<Revision> {
        self.index.get(rev_id).map(|&i| self.revision_at(i))
    }

    fn revision_at(&self, i: usize) -> Revision {
        let node = &self.nodes[i];
        Revision {
            doc_id: self.doc_id.clone(),
            rev_id: node.rev_id.clone(),
            deleted: node.deleted,
            properties: node.properties.clone(),
            sequence: node.sequence,
        }
    }

    fn leaf_flags(&self) -> Vec<bool> {
        let mut is_leaf = vec![true; self.nodes.len()];
        for node in &self.nodes {
            if let Some(parent) = node.parent {
                is_leaf[parent] = false;
            }
        }
        is_leaf
    }

    /// Indices of open leaves, best candidate first.
    fn open_leaves(&self) -> Vec<usize> {
        let mut leaves: Vec<usize> = self
            .leaf_flags()
            .into_iter()
            .enumerate()
            .filter(|&(i, leaf)| leaf && !self.nodes[i].closed)
            .map(|(i, _)| i)
            .collect();
        leaves.sort_by(|&a, &b| self.compare_for_winner(b, a));
        leaves
    }

    fn compare_for_winner(&self, a: usize, b: usize) -> Ordering {
        let (a, b) = (&self.nodes[a], &self.nodes[b]);
        a.deleted
            .cmp(&b.deleted)
            .then_with(|| generation(&a.rev_id).cmp(&generation(&b.rev_id)))
            .then_with(|| compare_rev_ids(&a.rev_id, &b.rev_id))
    }

    /// IDs of all open leaves, winner first.
    pub fn current_revision_ids(&self) -> Vec<String> {
        self.open_leaves()
            .into_iter()
            .map(|i| self.nodes[i].rev_id.clone())
            .collect()
    }

    /// All open leaf revisions, winner first.
    pub fn leaves(&self) -> Vec<Revision> {
        self.open_leaves()
            .into_iter()
            .map(|i| self.revision_at(i))
            .collect()
    }

    /// Every leaf including resolution tombstones, in insertion order.
    pub fn all_leaves(&self) -> Vec<Revision> {
        self.leaf_flags()
            .into_iter()
            .enumerate()
            .filter(|&(_, leaf)| leaf)
            .map(|(i, _)| self.revision_at(i))
            .collect()
    }

    /// Every known rev ID, in insertion order.
    pub fn all_revision_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.rev_id.clone()).collect()
    }

    pub fn winning_revision(&self) -> Option<Revision> {
        self.open_leaves().first().map(|&i| self.revision_at(i))
    }

    /// Open leaves other than the winner that are still live.
    pub fn conflicting_revision_ids(&self) -> Vec<String> {
        self.open_leaves()
            .into_iter()
            .skip(1)
            .filter(|&i| !self.nodes[i].deleted)
            .map(|i| self.nodes[i].rev_id.clone())
            .collect()
    }

    pub fn is_conflicted(&self) -> bool {
        !self.conflicting_revision_ids().is_empty()
    }

    /// Ancestry of `rev_id`, newest first, ending at the oldest retained node.
    pub fn history(&self, rev_id: &str) -> Vec<String> {
        let mut history = Vec::new();
        let mut cursor = self.index.get(rev_id).copied();
        while let Some(i) = cursor {
            history.push(self.nodes[i].rev_id.clone());
            cursor = self.nodes[i].parent;
        }
        history
    }

    fn push_node(&mut self, node: RevNode) -> usize {
        let i = self.nodes.len();
        self.index.insert(node.rev_id.clone(), i);
        self.nodes.push(node);
        i
    }

    /// Insert a revision received from a remote, together with its history
    /// (newest first, `history[0] == rev.rev_id`).
    ///
    /// Any ancestors not yet known are added as body-less stubs. The remote's
    /// history is always accepted; a resulting fork is a conflict, not an
    /// error. Returns `Ok` if the revision was already present.
    pub fn force_insert(&mut self, rev: &Revision, history: &[String], sequence: i64) -> Status {
        if history.first().map(String::as_str) != Some(rev.rev_id.as_str()) {
            return Status::BadRequest;
        }
        if validate_history(history).is_err() {
            return Status::BadRequest;
        }

        let known = history.iter().position(|id| self.contains(id));
        if known == Some(0) {
            return Status::Ok;
        }

        let (mut parent, new_count) = match known {
            Some(i) => (self.index.get(&history[i]).copied(), i),
            None => (None, history.len()),
        };

        // Oldest unknown ancestor first, down to the new leaf.
        for k in (1..new_count).rev() {
            let stub = RevNode {
                rev_id: history[k].clone(),
                parent,
                deleted: false,
                properties: None,
                sequence: 0,
                closed: false,
            };
            parent = Some(self.push_node(stub));
        }

        self.push_node(RevNode {
            rev_id: rev.rev_id.clone(),
            parent,
            deleted: rev.deleted,
            properties: rev.properties.clone(),
            sequence,
            closed: false,
        });
        Status::Created
    }

    /// Local edit on top of `prev_rev_id`.
    ///
    /// `prev_rev_id` must be an open leaf. `None` is accepted only for a new
    /// document or on top of a deleted winner (re-creation).
    pub fn put(
        &mut self,
        properties: Map<String, Value>,
        deleted: bool,
        prev_rev_id: Option<&str>,
        sequence: i64,
    ) -> PutOutcome {
        let parent = match prev_rev_id {
            Some(prev) => {
                let Some(&i) = self.index.get(prev) else {
                    return PutOutcome::rejected(Status::NotFound);
                };
                if !self.open_leaves().contains(&i) {
                    return PutOutcome::rejected(Status::Conflict);
                }
                Some(i)
            }
            None => match self.open_leaves().first() {
                None => None,
                Some(&winner) if self.nodes[winner].deleted => Some(winner),
                Some(_) => return PutOutcome::rejected(Status::Conflict),
            },
        };

        if deleted && parent.is_none() {
            return PutOutcome::rejected(Status::NotFound);
        }

        let rev_id = self.new_rev_id(parent, deleted, &properties);
        let i = self.push_node(RevNode {
            rev_id,
            parent,
            deleted,
            properties: Some(properties),
            sequence,
            closed: false,
        });
        PutOutcome {
            status: Status::Created,
            revision: Some(self.revision_at(i)),
        }
    }

    fn new_rev_id(&self, parent: Option<usize>, deleted: bool, properties: &Map<String, Value>) -> String {
        let (gen, prev) = match parent {
            Some(i) => (generation(&self.nodes[i].rev_id) + 1, self.nodes[i].rev_id.as_str()),
            None => (1, ""),
        };
        let mut hasher = Sha256::new();
        hasher.update(prev.as_bytes());
        hasher.update([deleted as u8]);
        hasher.update(Value::Object(properties.clone()).to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}", gen, &digest[..32])
    }

    /// Resolve a conflict between two open leaves.
    ///
    /// Writes a closed tombstone under the losing leaf and, if a merged body
    /// is given, writes it as a child of the winning leaf. Each new revision
    /// takes a sequence from `next_sequence`, tombstone first.
    pub fn resolve_conflict(
        &mut self,
        winning_rev_id: &str,
        losing_rev_id: &str,
        merged_body: Option<Map<String, Value>>,
        mut next_sequence: impl FnMut() -> i64,
    ) -> ResolveOutcome {
        if winning_rev_id == losing_rev_id {
            return ResolveOutcome::rejected(Status::BadRequest);
        }
        let open = self.open_leaves();
        let (Some(&winner), Some(&loser)) = (self.index.get(winning_rev_id), self.index.get(losing_rev_id)) else {
            return ResolveOutcome::rejected(Status::NotFound);
        };
        if !open.contains(&winner) || !open.contains(&loser) {
            return ResolveOutcome::rejected(Status::Conflict);
        }

        let empty = Map::new();
        let rev_id = self.new_rev_id(Some(loser), true, &empty);
        let tombstone = self.push_node(RevNode {
            rev_id,
            parent: Some(loser),
            deleted: true,
            properties: Some(empty),
            sequence: next_sequence(),
            closed: true,
        });

        let merged = merged_body.map(|body| {
            let deleted = self.nodes[winner].deleted;
            let rev_id = self.new_rev_id(Some(winner), deleted, &body);
            let i = self.push_node(RevNode {
                rev_id,
                parent: Some(winner),
                deleted,
                properties: Some(body),
                sequence: next_sequence(),
                closed: false,
            });
            self.revision_at(i)
        });

        ResolveOutcome {
            status: Status::Created,
            tombstone: Some(self.revision_at(tombstone)),
            merged,
        }
    }

    /// Drop nodes more than `max_depth` steps away from every leaf.
    ///
    /// Returns the number of nodes removed.
    pub fn prune(&mut self, max_depth: usize) -> usize {
        if max_depth == 0 || self.nodes.len() <= max_depth {
            return 0;
        }

        let mut keep = HashSet::new();
        for (leaf, is_leaf) in self.leaf_flags().into_iter().enumerate() {
            if !is_leaf {
                continue;
            }
            let mut cursor = Some(leaf);
            let mut depth = 0;
            while let Some(i) = cursor {
                if depth >= max_depth {
                    break;
                }
                keep.insert(i);
                cursor = self.nodes[i].parent;
                depth += 1;
            }
        }

        let removed = self.nodes.len() - keep.len();
        if removed == 0 {
            return 0;
        }

        let mut remap = HashMap::new();
        let mut nodes = Vec::with_capacity(keep.len());
        for (i, node) in self.nodes.drain(..).enumerate() {
            if keep.contains(&i) {
                remap.insert(i, nodes.len());
                nodes.push(node);
            }
        }
        for node in &mut nodes {
            node.parent = node.parent.and_then(|p| remap.get(&p).copied());
        }
        self.index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.rev_id.clone(), i))
            .collect();
        self.nodes = nodes;
        removed
    }
}
