//! Per-session view of the content tree.
//!
//! A view is built from a head snapshot and then advanced by replaying journal
//! entries. It never references head storage directly.

use crate::model::change::{ChangeTracker, FeatureChange, ModelChild};
use crate::model::head::HeadTree;
use crate::model::ids::{ContinuationToken, StreamContentId};
use crate::model::mutation::{ContentNodeKind, Mutation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// View shared between the session manager (writer) and cursors (readers)
pub type SharedView = Arc<RwLock<SessionView>>;

pub(crate) fn read_view(view: &SharedView) -> RwLockReadGuard<'_, SessionView> {
    view.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_view(view: &SharedView) -> RwLockWriteGuard<'_, SessionView> {
    view.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewNode {
    pub kind: ContentNodeKind,
    pub parent: Option<StreamContentId>,
    pub children: Vec<StreamContentId>,
}

/// Outcome of replaying mutations into a view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    Changes(Vec<FeatureChange>),
    /// The view can no longer follow head (cleared, or root replaced)
    Invalidated(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    root: Option<StreamContentId>,
    nodes: HashMap<StreamContentId, ViewNode>,
    tokens: HashMap<ContinuationToken, StreamContentId>,
}

impl SessionView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the subtree reachable from head's root feature
    pub fn from_head(head: &HeadTree) -> Self {
        let mut view = Self::new();
        let Some(root) = head.root_feature() else {
            return view;
        };

        view.root = Some(root.clone());
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            let Some(node) = head.node(&id) else {
                continue;
            };
            if let ContentNodeKind::Token(token) = &node.kind {
                view.tokens.insert(token.clone(), id.clone());
            }
            stack.extend(node.children.iter().cloned());
            view.nodes.insert(
                id,
                ViewNode {
                    kind: node.kind.clone(),
                    parent: node.parent.clone(),
                    children: node.children.clone(),
                },
            );
        }
        view
    }

    pub fn root(&self) -> Option<&StreamContentId> {
        self.root.as_ref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &StreamContentId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn children(&self, id: &StreamContentId) -> &[StreamContentId] {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn model_child(&self, id: &StreamContentId) -> Option<ModelChild> {
        self.nodes.get(id).map(|node| to_model_child(id, node))
    }

    pub fn child_at(&self, parent: &StreamContentId, index: usize) -> Option<ModelChild> {
        let id = self.children(parent).get(index)?;
        self.model_child(id)
    }

    pub fn parent_of(&self, id: &StreamContentId) -> Option<&StreamContentId> {
        self.nodes.get(id).and_then(|n| n.parent.as_ref())
    }

    pub fn has_token(&self, token: &ContinuationToken) -> bool {
        self.tokens.contains_key(token)
    }

    /// Token node id and its parent
    pub fn token_location(
        &self,
        token: &ContinuationToken,
    ) -> Option<(StreamContentId, StreamContentId)> {
        let node_id = self.tokens.get(token)?;
        let parent = self.parent_of(node_id)?;
        Some((node_id.clone(), parent.clone()))
    }

    /// Replay mutations as one batch, producing at most one change per node.
    pub fn apply<'a>(&mut self, mutations: impl IntoIterator<Item = &'a Mutation>) -> ViewUpdate {
        let mut tracker = ChangeTracker::new();
        // Nodes created by this batch; their own changes are not reported
        let mut fresh: HashSet<StreamContentId> = HashSet::new();

        for mutation in mutations {
            match mutation {
                Mutation::ClearAll => return ViewUpdate::Invalidated("head cleared"),
                Mutation::UpdateOrAppend { parent, children } if parent.is_root() => {
                    for child in children {
                        match &self.root {
                            Some(current) if *current == child.id => {}
                            Some(_) => return ViewUpdate::Invalidated("root replaced"),
                            None => {
                                self.root = Some(child.id.clone());
                                self.nodes.insert(
                                    child.id.clone(),
                                    ViewNode {
                                        kind: child.kind.clone(),
                                        parent: Some(parent.clone()),
                                        children: Vec::new(),
                                    },
                                );
                                fresh.insert(child.id.clone());
                            }
                        }
                    }
                }
                Mutation::UpdateOrAppend { parent, children } => {
                    if !self.nodes.contains_key(parent) {
                        debug!(parent = %parent, "Parent not in session view, skipping append");
                        continue;
                    }
                    for child in children {
                        if let ContentNodeKind::Token(token) = &child.kind {
                            self.tokens.insert(token.clone(), child.id.clone());
                        }
                        let node = ViewNode {
                            kind: child.kind.clone(),
                            parent: Some(parent.clone()),
                            children: Vec::new(),
                        };
                        if !fresh.contains(parent) {
                            tracker.append(parent, to_model_child(&child.id, &node));
                        }
                        self.nodes.insert(child.id.clone(), node);
                        if let Some(parent_node) = self.nodes.get_mut(parent) {
                            parent_node.children.push(child.id.clone());
                        }
                        fresh.insert(child.id.clone());
                    }
                }
                Mutation::RemoveChildren { parent, children } => {
                    if parent.is_root() {
                        continue;
                    }
                    let Some(parent_node) = self.nodes.get_mut(parent) else {
                        continue;
                    };
                    let targets: HashSet<&StreamContentId> = children.iter().collect();
                    let mut removed = Vec::new();
                    parent_node.children.retain(|child| {
                        if targets.contains(child) {
                            removed.push(child.clone());
                            false
                        } else {
                            true
                        }
                    });
                    for id in removed {
                        if let Some(node) = self.nodes.get(&id) {
                            if !fresh.contains(parent) {
                                tracker.remove(parent, to_model_child(&id, node));
                            }
                        }
                        self.drop_subtree(&id);
                    }
                }
                Mutation::UpdateContent { id, .. } => {
                    if self.nodes.contains_key(id) && !fresh.contains(id) {
                        tracker.mark_changed(id);
                    }
                }
                Mutation::SetSemanticProperties { .. } => {}
            }
        }

        ViewUpdate::Changes(tracker.finish())
    }

    fn drop_subtree(&mut self, id: &StreamContentId) {
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                if let ContentNodeKind::Token(token) = &node.kind {
                    self.tokens.remove(token);
                }
                stack.extend(node.children);
            }
        }
    }
}

fn to_model_child(id: &StreamContentId, node: &ViewNode) -> ModelChild {
    match &node.kind {
        ContentNodeKind::Feature => ModelChild::feature(id.clone()),
        ContentNodeKind::Token(token) => ModelChild::token(id.clone(), token.clone()),
    }
}
