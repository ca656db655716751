//! Mutations replayed into the head tree and session views.

use crate::model::ids::{ContinuationToken, StreamContentId};
use serde::{Deserialize, Serialize};

/// Tag of a content node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentNodeKind {
    /// A node that may own children
    Feature,
    /// A paging placeholder carrying the token for the next page
    Token(ContinuationToken),
}

impl ContentNodeKind {
    pub fn is_feature(&self) -> bool {
        matches!(self, Self::Feature)
    }

    pub fn token(&self) -> Option<&ContinuationToken> {
        match self {
            Self::Token(token) => Some(token),
            Self::Feature => None,
        }
    }
}

/// A child appended by `Mutation::UpdateOrAppend`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChild {
    pub id: StreamContentId,
    pub kind: ContentNodeKind,
}

impl NewChild {
    pub fn feature(id: impl Into<StreamContentId>) -> Self {
        Self {
            id: id.into(),
            kind: ContentNodeKind::Feature,
        }
    }

    pub fn token(id: impl Into<StreamContentId>, token: ContinuationToken) -> Self {
        Self {
            id: id.into(),
            kind: ContentNodeKind::Token(token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Discard every node
    ClearAll,

    /// Append children to `parent` in order. Duplicates are not checked.
    UpdateOrAppend {
        parent: StreamContentId,
        children: Vec<NewChild>,
    },

    /// Remove children from `parent`; ids that are not present are ignored
    RemoveChildren {
        parent: StreamContentId,
        children: Vec<StreamContentId>,
    },

    /// Opaque per-id payload, persisted outside the tree
    SetSemanticProperties { id: StreamContentId, bytes: Vec<u8> },

    /// New payload for a node; marks the node itself as changed
    UpdateContent { id: StreamContentId, payload: Vec<u8> },
}

/// Which sessions a batch is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Every attached session
    Shared,
    /// Only sessions that paged this token
    Page(ContinuationToken),
}

/// An ordered group of mutations produced from one Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatch {
    pub scope: Scope,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn shared(mutations: Vec<Mutation>) -> Self {
        Self {
            scope: Scope::Shared,
            mutations,
        }
    }

    pub fn page(token: ContinuationToken, mutations: Vec<Mutation>) -> Self {
        Self {
            scope: Scope::Page(token),
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn clears(&self) -> bool {
        self.mutations.iter().any(|m| matches!(m, Mutation::ClearAll))
    }
}

/// A mutation as recorded in the head tree journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub sequence: u64,
    pub scope: Scope,
    pub mutation: Mutation,
}
