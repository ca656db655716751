//! Observer interfaces and the dispatcher that delivers to them.

use crate::model::{ContinuationToken, FeatureChange};
use bytes::Bytes;
use std::fmt;

/// Opaque host context handed back with lifecycle callbacks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiContext(Bytes);

impl UiContext {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    /// The session became Ready with nothing to show after its request failed
    NoCards,
    /// A page request failed; the token is still in place for a retry
    Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub token: Option<ContinuationToken>,
}

impl ModelError {
    pub fn no_cards() -> Self {
        Self {
            kind: ModelErrorKind::NoCards,
            token: None,
        }
    }

    pub fn pagination(token: ContinuationToken) -> Self {
        Self {
            kind: ModelErrorKind::Pagination,
            token: Some(token),
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.token) {
            (ModelErrorKind::NoCards, _) => f.write_str("no cards available"),
            (ModelErrorKind::Pagination, Some(token)) => {
                write!(f, "pagination failed for token {}", token)
            }
            (ModelErrorKind::Pagination, None) => f.write_str("pagination failed"),
        }
    }
}

/// Session lifecycle callbacks
pub trait ModelProviderObserver: Send + Sync {
    fn on_session_start(&self, ui_context: &UiContext);

    fn on_session_finished(&self, ui_context: &UiContext);

    fn on_error(&self, error: &ModelError);
}

/// Receives the diff for one feature after each applied batch
pub trait FeatureChangeObserver: Send + Sync {
    fn on_change(&self, change: &FeatureChange);
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Decides where observer callbacks run.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Runs callbacks on the thread performing the fan-out
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Runs each callback as a task on a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
    handle: tokio::runtime::Handle,
}

impl TokioDispatcher {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Dispatcher bound to the runtime of the calling task
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Dispatcher for TokioDispatcher {
    fn dispatch(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}
