//! Canonical content tree ($HEAD).
//!
//! Single writer. Every applied mutation bumps `sequence` and is journaled so
//! sessions lagging behind can be replayed without another request. The
//! journal only covers the current *generation*: clearing the tree or
//! replacing its root feature starts a new generation and drops the journal.
//!
//! Each generation also gets an `epoch`, a random id that stays unique across
//! processes, so a persisted session can tell whether it was built on this
//! very tree. The journal is trimmed once every session has moved past its
//! front; resolved pages are indexed separately and survive trimming.

use crate::error::{Result, SyncError};
use crate::model::ids::{ContinuationToken, StreamContentId};
use crate::model::mutation::{ContentNodeKind, JournalEntry, Mutation, MutationBatch, Scope};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// A node in the head tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentNode {
    pub id: StreamContentId,
    pub kind: ContentNodeKind,
    /// Only meaningful for Feature nodes
    pub children: Vec<StreamContentId>,
    pub parent: Option<StreamContentId>,
}

/// Result of applying a batch
#[derive(Debug, Clone, Default)]
pub struct AppliedBatch {
    /// Entries in application order, with their assigned sequence numbers
    pub entries: Vec<JournalEntry>,
    /// A ClearAll was applied
    pub cleared: bool,
    /// The root feature was replaced by a different id
    pub root_replaced: bool,
    /// Generation after the batch
    pub generation: u64,
}

impl AppliedBatch {
    /// Sessions built on an earlier generation can no longer follow the tree
    pub fn starts_generation(&self) -> bool {
        self.cleared || self.root_replaced
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence)
    }
}

fn new_epoch() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug)]
pub struct HeadTree {
    sequence: u64,
    generation: u64,
    epoch: String,
    nodes: HashMap<StreamContentId, ContentNode>,
    root_feature: Option<StreamContentId>,
    journal: VecDeque<JournalEntry>,
    /// Highest sequence no longer held by the journal
    trimmed_through: u64,
    /// Entries of each page resolved in this generation
    pages: HashMap<ContinuationToken, Vec<JournalEntry>>,
}

impl Default for HeadTree {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadTree {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            generation: 0,
            epoch: new_epoch(),
            nodes: HashMap::new(),
            root_feature: None,
            journal: VecDeque::new(),
            trimmed_through: 0,
            pages: HashMap::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Process-independent identity of the current generation
    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn root_feature(&self) -> Option<&StreamContentId> {
        self.root_feature.as_ref()
    }

    /// True until a root feature has been appended
    pub fn is_empty(&self) -> bool {
        self.root_feature.is_none()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: &StreamContentId) -> Option<&ContentNode> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: &StreamContentId) -> &[StreamContentId] {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Journal entries newer than `sequence`, oldest first
    pub fn entries_after(&self, sequence: u64) -> impl Iterator<Item = &JournalEntry> {
        self.journal.iter().skip_while(move |e| e.sequence <= sequence)
    }

    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Whether a session that applied up to `sequence` can catch up from the
    /// journal
    pub fn can_replay_from(&self, sequence: u64) -> bool {
        sequence >= self.trimmed_through && sequence <= self.sequence
    }

    /// Drop journal entries up to and including `sequence`
    pub fn trim_journal(&mut self, sequence: u64) -> usize {
        let sequence = sequence.min(self.sequence);
        let before = self.journal.len();
        while self
            .journal
            .front()
            .is_some_and(|entry| entry.sequence <= sequence)
        {
            self.journal.pop_front();
        }
        self.trimmed_through = self.trimmed_through.max(sequence);
        before - self.journal.len()
    }

    /// Whether a page for `token` has already been resolved
    pub fn has_page(&self, token: &ContinuationToken) -> bool {
        self.pages.contains_key(token)
    }

    /// Entries of the page resolved for `token`
    pub fn page_entries(&self, token: &ContinuationToken) -> Vec<JournalEntry> {
        self.pages.get(token).cloned().unwrap_or_default()
    }

    /// Apply a single shared mutation, returning its sequence number
    pub fn apply(&mut self, mutation: Mutation) -> Result<u64> {
        let applied = self.apply_batch(&MutationBatch::shared(vec![mutation]))?;
        Ok(applied.last_sequence().unwrap_or(self.sequence))
    }

    /// Validate then apply a whole batch. Nothing is applied if validation fails.
    pub fn apply_batch(&mut self, batch: &MutationBatch) -> Result<AppliedBatch> {
        self.validate(batch)?;

        let mut applied = AppliedBatch::default();
        for mutation in &batch.mutations {
            self.sequence += 1;
            match mutation {
                Mutation::ClearAll => {
                    self.clear();
                    applied.cleared = true;
                }
                Mutation::UpdateOrAppend { parent, children } if parent.is_root() => {
                    for child in children {
                        if self.set_root(&child.id) {
                            applied.root_replaced = true;
                        }
                    }
                }
                Mutation::UpdateOrAppend { parent, children } => {
                    for child in children {
                        if self.nodes.contains_key(&child.id) {
                            debug!(id = %child.id, "Appending an id already present in head");
                        }
                        self.nodes.insert(
                            child.id.clone(),
                            ContentNode {
                                id: child.id.clone(),
                                kind: child.kind.clone(),
                                children: Vec::new(),
                                parent: Some(parent.clone()),
                            },
                        );
                        if let Some(node) = self.nodes.get_mut(parent) {
                            node.children.push(child.id.clone());
                        }
                    }
                }
                Mutation::RemoveChildren { parent, children } => {
                    self.remove_children(parent, children);
                }
                Mutation::SetSemanticProperties { .. } | Mutation::UpdateContent { .. } => {}
            }

            let entry = JournalEntry {
                sequence: self.sequence,
                scope: batch.scope.clone(),
                mutation: mutation.clone(),
            };
            if !matches!(mutation, Mutation::ClearAll) {
                if let Scope::Page(token) = &batch.scope {
                    self.pages
                        .entry(token.clone())
                        .or_default()
                        .push(entry.clone());
                }
                self.journal.push_back(entry.clone());
            }
            applied.entries.push(entry);
        }

        applied.generation = self.generation;
        debug!(
            sequence = self.sequence,
            generation = self.generation,
            mutations = batch.mutations.len(),
            journal = self.journal.len(),
            "Applied batch to head"
        );
        Ok(applied)
    }

    /// Check that every append targets a Feature parent that exists at that
    /// point of the batch.
    fn validate(&self, batch: &MutationBatch) -> Result<()> {
        let mut cleared = false;
        // Appended by this batch: whether the child is a Feature, and its parent
        let mut added: HashMap<&StreamContentId, (bool, &StreamContentId)> = HashMap::new();
        // Removed by this batch, subtrees included
        let mut removed: HashSet<StreamContentId> = HashSet::new();

        for mutation in &batch.mutations {
            match mutation {
                Mutation::ClearAll => {
                    cleared = true;
                    added.clear();
                    removed.clear();
                }
                Mutation::UpdateOrAppend { parent, children } => {
                    if parent.is_root() {
                        if let Some(token) = children.iter().find(|c| !c.kind.is_feature()) {
                            return Err(SyncError::Structure(format!(
                                "token {} cannot be a root",
                                token.id
                            )));
                        }
                    } else {
                        let is_feature = match added.get(parent) {
                            Some(&(is_feature, _)) => Some(is_feature),
                            None if cleared || removed.contains(parent) => None,
                            None => self.nodes.get(parent).map(|n| n.kind.is_feature()),
                        };
                        match is_feature {
                            None => {
                                return Err(SyncError::Structure(format!(
                                    "append to unknown parent {}",
                                    parent
                                )))
                            }
                            Some(false) => {
                                return Err(SyncError::Structure(format!(
                                    "token {} cannot have children",
                                    parent
                                )))
                            }
                            Some(true) => {}
                        }
                    }
                    for child in children {
                        removed.remove(&child.id);
                        added.insert(&child.id, (child.kind.is_feature(), parent));
                    }
                }
                Mutation::RemoveChildren { parent, children } if !parent.is_root() => {
                    for child in children {
                        let under_parent = match added.get(child) {
                            Some(&(_, owner)) => owner == parent,
                            None if cleared || removed.contains(child) => false,
                            None => self
                                .nodes
                                .get(child)
                                .is_some_and(|n| n.parent.as_ref() == Some(parent)),
                        };
                        if under_parent {
                            self.mark_removed(child, cleared, &mut added, &mut removed);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Record `id` and everything below it as gone for the rest of validation
    fn mark_removed(
        &self,
        id: &StreamContentId,
        cleared: bool,
        added: &mut HashMap<&StreamContentId, (bool, &StreamContentId)>,
        removed: &mut HashSet<StreamContentId>,
    ) {
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            added.remove(&next);
            if !cleared {
                if let Some(node) = self.nodes.get(&next) {
                    stack.extend(node.children.iter().cloned());
                }
            }
            stack.extend(
                added
                    .iter()
                    .filter(|(_, (_, owner))| **owner == next)
                    .map(|(child, _)| (*child).clone()),
            );
            removed.insert(next);
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.root_feature = None;
        self.start_generation(self.sequence);
    }

    /// Drop the journal and page index; entries up to `through` are gone
    fn start_generation(&mut self, through: u64) {
        self.journal.clear();
        self.pages.clear();
        self.trimmed_through = through;
        self.generation += 1;
        self.epoch = new_epoch();
    }

    /// Returns true when an existing, different root was replaced.
    fn set_root(&mut self, id: &StreamContentId) -> bool {
        let sentinel = StreamContentId::root();
        let replaced = match &self.root_feature {
            Some(current) if current == id => {
                warn!(root = %id, "Multiple roots - duplicate root is ignored");
                return false;
            }
            Some(current) => {
                warn!(old = %current, new = %id, "Root feature replaced");
                let old = current.clone();
                self.drop_subtree(&old);
                // The replacing mutation itself is journaled
                self.start_generation(self.sequence.saturating_sub(1));
                true
            }
            None => false,
        };

        self.nodes.insert(
            id.clone(),
            ContentNode {
                id: id.clone(),
                kind: ContentNodeKind::Feature,
                children: Vec::new(),
                parent: Some(sentinel.clone()),
            },
        );
        self.nodes.insert(
            sentinel.clone(),
            ContentNode {
                id: sentinel,
                kind: ContentNodeKind::Feature,
                children: vec![id.clone()],
                parent: None,
            },
        );
        self.root_feature = Some(id.clone());
        replaced
    }

    fn remove_children(&mut self, parent: &StreamContentId, ids: &[StreamContentId]) {
        if parent.is_root() {
            warn!("Unable to remove the root feature, use ClearAll");
            return;
        }
        let Some(node) = self.nodes.get_mut(parent) else {
            debug!(parent = %parent, "Parent of removed children not found");
            return;
        };

        let targets: HashSet<&StreamContentId> = ids.iter().collect();
        let mut removed = Vec::new();
        node.children.retain(|child| {
            if targets.contains(child) {
                removed.push(child.clone());
                false
            } else {
                true
            }
        });

        for id in removed {
            self.drop_subtree(&id);
        }
    }

    fn drop_subtree(&mut self, id: &StreamContentId) {
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                stack.extend(node.children);
            }
        }
    }
}
