//! Wire-level response shape and the adapter translating it into mutations.
//!
//! The engine does not prescribe an encoding; `Response` is the minimal
//! structure needed to drive it and derives serde so collaborators can carry
//! it in whatever format they use.
//!
//! Entries without an explicit parent attach to the response *anchor*: the
//! root sentinel for refreshes, the parent of the paged token for pages.

use crate::error::{Result, SyncError};
use crate::model::{ContinuationToken, Mutation, NewChild, StreamContentId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used by the default string form `domain::table::id`
pub const ID_SEPARATOR: &str = "::";

// =============================================================================
// Wire types
// =============================================================================

/// Server-side identifier of a piece of content.
///
/// `domain` must not contain `::`; its string form would not map back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentId {
    pub domain: String,
    pub id: i64,
    pub table: String,
}

impl ContentId {
    pub fn new(domain: impl Into<String>, table: impl Into<String>, id: i64) -> Self {
        Self {
            domain: domain.into(),
            id,
            table: table.into(),
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.domain,
            self.table,
            self.id,
            sep = ID_SEPARATOR
        )
    }
}

/// Append `children` (Features) to `parent`, or to the anchor when unset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAppend {
    #[serde(default)]
    pub parent: Option<ContentId>,
    pub children: Vec<ContentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRemove {
    pub parent: ContentId,
    pub children: Vec<ContentId>,
}

/// Token node appended after the response's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireToken {
    #[serde(default)]
    pub parent: Option<ContentId>,
    pub content_id: ContentId,
    pub next_page_token: Vec<u8>,
}

/// Content record for a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireContent {
    pub content_id: ContentId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSemanticProperties {
    pub content_id: ContentId,
    pub data: Vec<u8>,
}

/// A refresh or page response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Response {
    pub clear_all: bool,
    pub appends: Vec<WireAppend>,
    pub removes: Vec<WireRemove>,
    pub token: Option<WireToken>,
    pub content: Vec<WireContent>,
    pub semantic_properties: Vec<WireSemanticProperties>,
}

impl Response {
    pub fn is_empty(&self) -> bool {
        !self.clear_all
            && self.appends.is_empty()
            && self.removes.is_empty()
            && self.token.is_none()
            && self.content.is_empty()
            && self.semantic_properties.is_empty()
    }
}

/// Where parentless entries of a Response attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// Refresh: parentless entries are root features
    Root,
    /// Page: parentless entries go under the node that owned the token
    Node(StreamContentId),
}

impl Anchor {
    fn id(&self) -> StreamContentId {
        match self {
            Self::Root => StreamContentId::root(),
            Self::Node(id) => id.clone(),
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Translates wire identifiers and responses into internal values.
pub trait ProtocolAdapter: Send + Sync {
    fn to_stream_content_id(&self, wire: &ContentId) -> StreamContentId;

    fn to_wire_id(&self, id: &StreamContentId) -> Result<ContentId>;

    /// Convert a response into an ordered mutation list:
    /// clear, removes, appends, token, content, semantic properties.
    fn to_mutations(&self, response: &Response, anchor: &Anchor) -> Result<Vec<Mutation>> {
        let mut mutations = Vec::new();

        if response.clear_all {
            if *anchor != Anchor::Root {
                return Err(SyncError::MalformedResponse(
                    "a page response cannot clear the tree".to_string(),
                ));
            }
            mutations.push(Mutation::ClearAll);
        }

        for remove in &response.removes {
            mutations.push(Mutation::RemoveChildren {
                parent: self.to_stream_content_id(&remove.parent),
                children: remove
                    .children
                    .iter()
                    .map(|c| self.to_stream_content_id(c))
                    .collect(),
            });
        }

        for append in &response.appends {
            if append.children.is_empty() {
                continue;
            }
            let parent = match &append.parent {
                Some(parent) => self.to_stream_content_id(parent),
                None => anchor.id(),
            };
            mutations.push(Mutation::UpdateOrAppend {
                parent,
                children: append
                    .children
                    .iter()
                    .map(|c| NewChild::feature(self.to_stream_content_id(c)))
                    .collect(),
            });
        }

        if let Some(token) = &response.token {
            if token.next_page_token.is_empty() {
                return Err(SyncError::MalformedResponse(format!(
                    "token {} has an empty continuation token",
                    token.content_id
                )));
            }
            let parent = match &token.parent {
                Some(parent) => self.to_stream_content_id(parent),
                None => anchor.id(),
            };
            if parent.is_root() {
                return Err(SyncError::MalformedResponse(format!(
                    "token {} has no parent feature",
                    token.content_id
                )));
            }
            mutations.push(Mutation::UpdateOrAppend {
                parent,
                children: vec![NewChild::token(
                    self.to_stream_content_id(&token.content_id),
                    ContinuationToken::new(token.next_page_token.clone()),
                )],
            });
        }

        for content in &response.content {
            mutations.push(Mutation::UpdateContent {
                id: self.to_stream_content_id(&content.content_id),
                payload: content.payload.clone(),
            });
        }

        for props in &response.semantic_properties {
            mutations.push(Mutation::SetSemanticProperties {
                id: self.to_stream_content_id(&props.content_id),
                bytes: props.data.clone(),
            });
        }

        Ok(mutations)
    }
}

/// Adapter using the string form `domain::table::id`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProtocolAdapter;

impl ProtocolAdapter for DefaultProtocolAdapter {
    fn to_stream_content_id(&self, wire: &ContentId) -> StreamContentId {
        StreamContentId::new(wire.to_string())
    }

    /// The numeric id is split off the end and the domain off the front, so
    /// only the table may itself contain the separator.
    fn to_wire_id(&self, id: &StreamContentId) -> Result<ContentId> {
        let invalid = || SyncError::InvalidContentId(id.to_string());
        let (rest, numeric) = id.as_str().rsplit_once(ID_SEPARATOR).ok_or_else(invalid)?;
        let (domain, table) = rest.split_once(ID_SEPARATOR).ok_or_else(invalid)?;
        if domain.is_empty() || table.is_empty() {
            return Err(invalid());
        }
        let numeric: i64 = numeric.parse().map_err(|_| invalid())?;
        Ok(ContentId::new(domain, table, numeric))
    }
}
