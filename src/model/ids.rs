//! Internal content identifiers and continuation tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved id of the sentinel node that parents the root feature
pub const ROOT_ID: &str = "$root";

/// Stable identifier of a node in the content tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamContentId(String);

impl StreamContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The sentinel parent of root features
    pub fn root() -> Self {
        Self(ROOT_ID.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamContentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque server token needed to request the page following a Token node.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContinuationToken({})", self)
    }
}
