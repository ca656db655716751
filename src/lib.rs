//! feedsync: session and model synchronization for paginated content feeds.
//!
//! A single manager task owns the canonical content tree (`HeadTree`) and
//! fans every applied response out to per-session views. Hosts interact with
//! one session through a `ModelProvider` obtained from the
//! `ModelProviderFactory`.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod provider;
pub mod request;
pub mod session;
pub mod store;

pub use config::EngineConfig;
pub use error::{Result, SyncError};
pub use model::{
    ContinuationToken, FeatureChange, ModelChild, ModelCursor, Mutation, StreamContentId,
};
pub use protocol::{ContentId, DefaultProtocolAdapter, ProtocolAdapter, Response};
pub use provider::{
    FeatureChangeObserver, ModelError, ModelErrorKind, ModelFeature, ModelProvider,
    ModelProviderFactory, ModelProviderObserver, UiContext,
};
pub use request::{RequestError, RequestManager, RequestReason, ScriptedRequestManager};
pub use session::{RequestBehavior, SessionState};
