//! Host-facing handles.
//!
//! A `ModelProvider` wraps exactly one session. Reads (root feature, cursors,
//! children) go straight to the session's view; everything that changes state
//! is forwarded to the manager task, so calls return without waiting for
//! network work.

pub mod factory;
pub mod observer;

pub use factory::{ModelProviderFactory, ModelProviderFactoryBuilder};
pub use observer::{
    Dispatcher, FeatureChangeObserver, InlineDispatcher, ModelError, ModelErrorKind,
    ModelProviderObserver, Task, TokioDispatcher, UiContext,
};

use crate::error::{Result, SyncError};
use crate::model::view::read_view;
use crate::model::{ContinuationToken, ModelChild, ModelCursor, StreamContentId};
use crate::request::RequestReason;
use crate::session::channel::{Command, CommandSender};
use crate::session::{SessionShared, SessionState};
use crate::store::{content_key, semantic_key, ContentStore};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub struct ModelProvider {
    shared: Arc<SessionShared>,
    tx: CommandSender,
    store: Arc<dyn ContentStore>,
}

impl ModelProvider {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        tx: CommandSender,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        Self { shared, tx, store }
    }

    pub fn get_session_id(&self) -> String {
        self.shared.id().to_string()
    }

    pub fn current_state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.is_attached()
    }

    /// None until the session's view holds a root feature
    pub fn get_root_feature(&self) -> Option<ModelFeature> {
        let root = read_view(self.shared.view()).root().cloned()?;
        Some(ModelFeature {
            id: root,
            shared: self.shared.clone(),
        })
    }

    /// Snapshot of the root feature's children
    pub fn get_all_root_children(&self) -> Vec<ModelChild> {
        let view = read_view(self.shared.view());
        let Some(root) = view.root() else {
            return Vec::new();
        };
        view.children(root)
            .iter()
            .filter_map(|id| view.model_child(id))
            .collect()
    }

    pub fn get_model_child(&self, id: &StreamContentId) -> Option<ModelChild> {
        read_view(self.shared.view()).model_child(id)
    }

    /// Feature handle for any node in the view
    pub fn get_feature(&self, id: &StreamContentId) -> Option<ModelFeature> {
        if !read_view(self.shared.view()).contains(id) {
            return None;
        }
        Some(ModelFeature {
            id: id.clone(),
            shared: self.shared.clone(),
        })
    }

    pub fn register_observer(&self, observer: Arc<dyn ModelProviderObserver>) {
        self.shared.register_observer(observer);
    }

    /// Ask for the page after `token`.
    ///
    /// Returns once the request is queued; the page arrives as a
    /// `FeatureChange` on the token's parent. Unknown tokens fail here and
    /// leave the tree untouched.
    pub fn handle_token(&self, token: &ContinuationToken) -> Result<()> {
        if self.current_state() == SessionState::Invalidated
            || !read_view(self.shared.view()).has_token(token)
        {
            return Err(SyncError::InvalidToken(token.to_string()));
        }
        self.send(Command::HandleToken {
            session_id: self.get_session_id(),
            token: token.clone(),
        })
    }

    pub fn trigger_refresh(&self, reason: RequestReason) -> Result<()> {
        self.send(Command::TriggerRefresh { reason })
    }

    /// Stop driving this provider; the session survives for `create(session_id)`
    pub fn detach_model_provider(&self) -> String {
        self.shared.set_attached(false);
        self.shared.clear_observers();
        let session_id = self.get_session_id();
        // A stopped manager has nothing left to detach from
        let _ = self.send(Command::Detach {
            session_id: session_id.clone(),
        });
        session_id
    }

    /// Force the session to Invalidated
    pub fn invalidate(&self) {
        self.shared.invalidate("invalidated by host");
        let _ = self.send(Command::Invalidate {
            session_id: self.get_session_id(),
        });
    }

    /// Stored semantic properties for `ids`; ids without a record are absent
    pub fn semantic_properties(
        &self,
        ids: &[StreamContentId],
    ) -> Result<HashMap<StreamContentId, Vec<u8>>> {
        let keys: Vec<String> = ids.iter().map(semantic_key).collect();
        let mut read = self.store.get(&keys)?;
        Ok(ids
            .iter()
            .zip(keys.iter())
            .filter_map(|(id, key)| read.found.remove(key).map(|bytes| (id.clone(), bytes)))
            .collect())
    }

    /// Latest content payload for `id`
    pub fn content(&self, id: &StreamContentId) -> Result<Option<Vec<u8>>> {
        let key = content_key(id);
        let mut read = self.store.get(std::slice::from_ref(&key))?;
        Ok(read.found.remove(&key))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| SyncError::ManagerClosed)
    }
}

impl fmt::Debug for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelProvider")
            .field("session", &self.shared)
            .finish()
    }
}

/// A Feature node as seen by one session
#[derive(Clone)]
pub struct ModelFeature {
    id: StreamContentId,
    shared: Arc<SessionShared>,
}

impl ModelFeature {
    pub fn content_id(&self) -> &StreamContentId {
        &self.id
    }

    /// Cursor over this feature's children
    pub fn cursor(&self) -> ModelCursor {
        ModelCursor::new(self.shared.view().clone(), self.id.clone())
    }

    pub fn register_observer(&self, observer: Arc<dyn FeatureChangeObserver>) {
        self.shared
            .register_feature_observer(self.id.clone(), observer);
    }
}

impl fmt::Debug for ModelFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelFeature").field("id", &self.id).finish()
    }
}
