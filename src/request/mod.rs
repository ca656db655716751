//! Request manager seam.
//!
//! The engine never talks to the network itself. A `RequestManager` performs
//! refreshes and page loads and hands back `Response` values; the session
//! manager spawns each call on its own task and folds the result back in.

pub mod scripted;

pub use scripted::ScriptedRequestManager;

use crate::model::ContinuationToken;
use crate::protocol::Response;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Why a refresh was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReason {
    /// First session created against an empty or stale head
    InitialLoad,
    /// Scheduler asked for fresh content for a new session
    SessionStart,
    /// Host called `trigger_refresh`
    HostRequested,
}

impl fmt::Display for RequestReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitialLoad => "initial_load",
            Self::SessionStart => "session_start",
            Self::HostRequested => "host_requested",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("request cancelled")]
    Cancelled,
}

/// Issues refresh and paging requests on behalf of the engine.
#[async_trait]
pub trait RequestManager: Send + Sync {
    async fn refresh(&self, reason: RequestReason) -> Result<Response, RequestError>;

    async fn load_more(&self, token: &ContinuationToken) -> Result<Response, RequestError>;
}
