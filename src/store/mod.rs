//! Content store seam.
//!
//! Key-value persistence for content payloads, semantic properties and
//! detached session records. Store failures are best-effort from the
//! engine's point of view: they are logged and reported, never allowed to
//! interrupt mutation application.

pub mod file;
pub mod memory;

pub use file::FileContentStore;
pub use memory::InMemoryStore;

use crate::model::StreamContentId;
use std::collections::HashMap;
use thiserror::Error;

pub const SEMANTIC_PREFIX: &str = "semantic::";
pub const CONTENT_PREFIX: &str = "content::";
pub const SESSION_PREFIX: &str = "session::";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store file: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Some keys of a multi-key write could not be stored
    #[error("failed to write {} keys", failed.len())]
    PartialFailure { failed: Vec<String> },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of a multi-key lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreRead {
    pub found: HashMap<String, Vec<u8>>,
    pub missing: Vec<String>,
}

impl StoreRead {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

pub trait ContentStore: Send + Sync {
    fn get(&self, keys: &[String]) -> StoreResult<StoreRead>;

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Remove keys, returning how many were present
    fn remove(&self, keys: &[String]) -> StoreResult<usize>;

    /// Write several entries, reporting the keys that failed
    fn put_all(&self, entries: &[(String, Vec<u8>)]) -> StoreResult<()> {
        let mut failed = Vec::new();
        for (key, value) in entries {
            if let Err(e) = self.put(key, value) {
                tracing::warn!(key = %key, error = %e, "Store write failed");
                failed.push(key.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StoreError::PartialFailure { failed })
        }
    }
}

pub fn semantic_key(id: &StreamContentId) -> String {
    format!("{}{}", SEMANTIC_PREFIX, id)
}

pub fn content_key(id: &StreamContentId) -> String {
    format!("{}{}", CONTENT_PREFIX, id)
}

pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}
