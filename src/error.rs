//! Error types for the feed session engine.

use crate::request::RequestError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A refresh or paging request failed at the transport level
    #[error("request failed: {0}")]
    Request(#[from] RequestError),

    /// ContentStore read or write failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// `handle_token` was called with a token the session does not hold
    #[error("invalid continuation token: {0}")]
    InvalidToken(String),

    /// A Response could not be converted into mutations
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// An internal id has no wire form
    #[error("invalid content id: {0}")]
    InvalidContentId(String),

    /// A mutation could not be applied to the tree
    #[error("structural mutation failed: {0}")]
    Structure(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session is already attached: {0}")]
    SessionAttached(String),

    /// The session manager task has stopped
    #[error("session manager is no longer running")]
    ManagerClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
