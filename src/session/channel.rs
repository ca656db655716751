//! Commands sent to the session manager task.
//!
//! Hosts, providers and the request tasks spawned by the manager all talk to
//! it over one unbounded channel, so every HeadTree write and fan-out happens
//! on the manager task in arrival order.

use super::SessionShared;
use crate::error::Result;
use crate::model::ContinuationToken;
use crate::protocol::Response;
use crate::provider::UiContext;
use crate::request::{RequestError, RequestReason};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

/// Snapshot of manager state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub sequence: u64,
    pub generation: u64,
    pub nodes: usize,
    /// Entries still held for replay
    pub journal_entries: usize,
    pub live_sessions: usize,
    pub detached_sessions: usize,
    pub refresh_requests: u64,
    pub page_requests: u64,
    pub refresh_outstanding: bool,
    pub pages_outstanding: usize,
}

#[derive(Debug)]
pub(crate) enum Command {
    // =========================================================================
    // From the host
    // =========================================================================
    CreateSession {
        /// Session to replace; it is invalidated first
        existing: Option<String>,
        ui_context: UiContext,
        reply: oneshot::Sender<Result<Arc<SessionShared>>>,
    },
    Reattach {
        session_id: String,
        ui_context: UiContext,
        reply: oneshot::Sender<Result<Arc<SessionShared>>>,
    },
    HandleToken {
        session_id: String,
        token: ContinuationToken,
    },
    TriggerRefresh {
        reason: RequestReason,
    },
    Detach {
        session_id: String,
    },
    Invalidate {
        session_id: String,
    },
    Release {
        session_id: String,
        reply: oneshot::Sender<bool>,
    },
    PushResponse {
        response: Response,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<ManagerStats>,
    },
    Shutdown,

    // =========================================================================
    // From tasks spawned by the manager
    // =========================================================================
    RefreshCompleted {
        request_id: u64,
        result: std::result::Result<Response, RequestError>,
    },
    PageCompleted {
        token: ContinuationToken,
        result: std::result::Result<Response, RequestError>,
    },
    SessionTimeout {
        session_id: String,
    },
}
