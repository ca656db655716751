//! Diff records delivered to feature observers.

use crate::model::ids::{ContinuationToken, StreamContentId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A child as seen through a cursor or a `FeatureChange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChild {
    pub content_id: StreamContentId,
    /// Set when the child is a Token node
    pub continuation_token: Option<ContinuationToken>,
}

impl ModelChild {
    pub fn feature(content_id: StreamContentId) -> Self {
        Self {
            content_id,
            continuation_token: None,
        }
    }

    pub fn token(content_id: StreamContentId, token: ContinuationToken) -> Self {
        Self {
            content_id,
            continuation_token: Some(token),
        }
    }

    pub fn is_token(&self) -> bool {
        self.continuation_token.is_some()
    }
}

/// How one node changed within a single mutation batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureChange {
    pub feature_id: StreamContentId,
    /// The node's own payload changed
    pub feature_changed: bool,
    pub appended_children: Vec<ModelChild>,
    pub removed_children: Vec<ModelChild>,
}

impl FeatureChange {
    pub fn new(feature_id: StreamContentId) -> Self {
        Self {
            feature_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.feature_changed
            && self.appended_children.is_empty()
            && self.removed_children.is_empty()
    }
}

/// Accumulates at most one `FeatureChange` per node for a batch.
#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    changes: Vec<FeatureChange>,
    index: HashMap<StreamContentId, usize>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, id: &StreamContentId) -> &mut FeatureChange {
        let idx = match self.index.get(id) {
            Some(&idx) => idx,
            None => {
                self.changes.push(FeatureChange::new(id.clone()));
                self.index.insert(id.clone(), self.changes.len() - 1);
                self.changes.len() - 1
            }
        };
        &mut self.changes[idx]
    }

    pub fn append(&mut self, parent: &StreamContentId, child: ModelChild) {
        self.entry(parent).appended_children.push(child);
    }

    pub fn remove(&mut self, parent: &StreamContentId, child: ModelChild) {
        let change = self.entry(parent);
        // A child appended and removed within one batch never existed for observers
        if let Some(pos) = change
            .appended_children
            .iter()
            .position(|c| c.content_id == child.content_id)
        {
            change.appended_children.remove(pos);
        } else if !change
            .removed_children
            .iter()
            .any(|c| c.content_id == child.content_id)
        {
            change.removed_children.push(child);
        }
    }

    pub fn mark_changed(&mut self, id: &StreamContentId) {
        self.entry(id).feature_changed = true;
    }

    pub fn finish(self) -> Vec<FeatureChange> {
        self.changes.into_iter().filter(|c| !c.is_empty()).collect()
    }
}
