//! Sessions: independently versioned views over the head tree.
//!
//! A `Session` is owned by the manager task and advanced by replaying journal
//! entries past its `applied_sequence`. The parts read by the host (view,
//! state, observers) live in `SessionShared` behind an `Arc`, so providers
//! and cursors never touch manager-owned state.

pub(crate) mod channel;
pub(crate) mod manager;
pub mod policy;
pub mod registry;

pub use channel::ManagerStats;
pub use policy::{FixedScheduler, RequestBehavior, SchedulerApi};
pub use registry::SessionRegistry;

use crate::error::{Result, SyncError};
use crate::model::view::{write_view, SharedView};
use crate::model::{
    ContinuationToken, FeatureChange, JournalEntry, Mutation, Scope, SessionView,
    StreamContentId, ViewUpdate,
};
use crate::provider::{
    Dispatcher, FeatureChangeObserver, ModelError, ModelProviderObserver, UiContext,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Initializing,
    Ready,
    /// Terminal
    Invalidated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Initializing => write!(f, "initializing"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Invalidated => write!(f, "invalidated"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// SessionShared: state visible to the host
// =============================================================================

#[derive(Debug, Default)]
struct Lifecycle {
    started: bool,
    finished: bool,
    /// Errors raised before any observer was registered
    undelivered: Vec<ModelError>,
}

pub(crate) struct SessionShared {
    id: String,
    view: SharedView,
    state: watch::Sender<SessionState>,
    ui_context: UiContext,
    lifecycle: Mutex<Lifecycle>,
    observers: Mutex<Vec<Arc<dyn ModelProviderObserver>>>,
    feature_observers: Mutex<HashMap<StreamContentId, Vec<Arc<dyn FeatureChangeObserver>>>>,
    dispatcher: Arc<dyn Dispatcher>,
    attached: AtomicBool,
}

impl SessionShared {
    pub fn new(
        id: String,
        view: SessionView,
        ui_context: UiContext,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        Self {
            id,
            view: Arc::new(RwLock::new(view)),
            state,
            ui_context,
            lifecycle: Mutex::new(Lifecycle::default()),
            observers: Mutex::new(Vec::new()),
            feature_observers: Mutex::new(HashMap::new()),
            dispatcher,
            attached: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn view(&self) -> &SharedView {
        &self.view
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }

    /// Initializing -> Ready; fires `on_session_start` once
    pub fn mark_ready(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Initializing {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        info!(session_id = %self.id, "Session ready");

        let observers = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.started {
                return;
            }
            lifecycle.started = true;
            self.observers_to_notify()
        };
        for observer in observers {
            let ui = self.ui_context.clone();
            self.dispatcher
                .dispatch(Box::new(move || observer.on_session_start(&ui)));
        }
    }

    /// Any state -> Invalidated; fires `on_session_finished` once
    pub fn invalidate(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Invalidated {
                false
            } else {
                *state = SessionState::Invalidated;
                true
            }
        });
        if !changed {
            return;
        }
        info!(session_id = %self.id, reason, "Session invalidated");

        let observers = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.finished {
                return;
            }
            lifecycle.finished = true;
            self.observers_to_notify()
        };
        for observer in observers {
            let ui = self.ui_context.clone();
            self.dispatcher
                .dispatch(Box::new(move || observer.on_session_finished(&ui)));
        }
    }

    pub fn report_error(&self, error: ModelError) {
        debug!(session_id = %self.id, error = %error, "Reporting model error");
        let observers = {
            let mut lifecycle = lock(&self.lifecycle);
            let observers = self.observers_to_notify();
            if observers.is_empty() && self.is_attached() {
                lifecycle.undelivered.push(error);
                return;
            }
            observers
        };
        for observer in observers {
            let error = error.clone();
            self.dispatcher
                .dispatch(Box::new(move || observer.on_error(&error)));
        }
    }

    pub fn notify_changes(&self, changes: Vec<FeatureChange>) {
        if changes.is_empty() || !self.is_attached() {
            return;
        }
        for change in changes {
            let observers: Vec<Arc<dyn FeatureChangeObserver>> = lock(&self.feature_observers)
                .get(&change.feature_id)
                .cloned()
                .unwrap_or_default();
            if observers.is_empty() {
                continue;
            }
            let change = Arc::new(change);
            for observer in observers {
                let change = change.clone();
                self.dispatcher
                    .dispatch(Box::new(move || observer.on_change(&change)));
            }
        }
    }

    /// Register a lifecycle observer, replaying the transitions already made
    pub fn register_observer(&self, observer: Arc<dyn ModelProviderObserver>) {
        let (started, finished, undelivered) = {
            let mut lifecycle = lock(&self.lifecycle);
            lock(&self.observers).push(observer.clone());
            (
                lifecycle.started,
                lifecycle.finished,
                std::mem::take(&mut lifecycle.undelivered),
            )
        };
        if finished {
            let ui = self.ui_context.clone();
            let observer = observer.clone();
            self.dispatcher
                .dispatch(Box::new(move || observer.on_session_finished(&ui)));
        } else if started {
            let ui = self.ui_context.clone();
            let observer = observer.clone();
            self.dispatcher
                .dispatch(Box::new(move || observer.on_session_start(&ui)));
        }
        for error in undelivered {
            let observer = observer.clone();
            self.dispatcher
                .dispatch(Box::new(move || observer.on_error(&error)));
        }
    }

    pub fn register_feature_observer(
        &self,
        feature_id: StreamContentId,
        observer: Arc<dyn FeatureChangeObserver>,
    ) {
        lock(&self.feature_observers)
            .entry(feature_id)
            .or_default()
            .push(observer);
    }

    /// Drop every observer; the session stops driving this host
    pub fn clear_observers(&self) {
        lock(&self.observers).clear();
        lock(&self.feature_observers).clear();
    }

    // Snapshot so callbacks may register observers without deadlocking
    fn observers_to_notify(&self) -> Vec<Arc<dyn ModelProviderObserver>> {
        if !self.is_attached() {
            return Vec::new();
        }
        lock(&self.observers).clone()
    }
}

impl fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionShared")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("attached", &self.is_attached())
            .finish()
    }
}

// =============================================================================
// Session: manager-owned replay position
// =============================================================================

/// Persisted form of a detached session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub applied_sequence: u64,
    /// Head epoch the view was built on
    pub epoch: String,
    pub view: SessionView,
}

impl SessionRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| {
            SyncError::Store(crate::store::StoreError::Serialization(e.to_string()))
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| {
            SyncError::Store(crate::store::StoreError::Serialization(e.to_string()))
        })
    }
}

#[derive(Debug)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
    applied_sequence: u64,
    epoch: String,
    /// Tokens this session asked to resolve and whose page is not yet applied
    pending_pages: HashSet<ContinuationToken>,
}

impl Session {
    pub(crate) fn new(shared: Arc<SessionShared>, applied_sequence: u64, epoch: &str) -> Self {
        Self {
            shared,
            applied_sequence,
            epoch: epoch.to_string(),
            pending_pages: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.shared.id()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn applied_sequence(&self) -> u64 {
        self.applied_sequence
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn is_attached(&self) -> bool {
        self.shared.is_attached()
    }

    /// Rebind to a freshly copied head view
    pub(crate) fn rebind(&mut self, view: SessionView, sequence: u64, epoch: &str) {
        *write_view(self.shared.view()) = view;
        self.applied_sequence = sequence;
        self.epoch = epoch.to_string();
    }

    pub(crate) fn add_pending_page(&mut self, token: ContinuationToken) -> bool {
        self.pending_pages.insert(token)
    }

    pub(crate) fn take_pending_page(&mut self, token: &ContinuationToken) -> bool {
        self.pending_pages.remove(token)
    }

    pub(crate) fn has_pending_page(&self, token: &ContinuationToken) -> bool {
        self.pending_pages.contains(token)
    }

    /// Replay one mutation. Returns None if the sequence was already applied
    /// or the session is no longer live.
    pub fn consume(&mut self, mutation: &Mutation, sequence: u64) -> Option<Vec<FeatureChange>> {
        if sequence <= self.applied_sequence || self.state() == SessionState::Invalidated {
            return None;
        }
        self.applied_sequence = sequence;
        let update = write_view(self.shared.view()).apply(std::iter::once(mutation));
        self.settle(update)
    }

    /// Replay the entries newer than `applied_sequence` as a single batch.
    ///
    /// Page-scoped entries are only applied when this session asked for the
    /// page; skipped entries still advance the sequence.
    pub fn consume_batch(&mut self, entries: &[JournalEntry]) -> Option<Vec<FeatureChange>> {
        if self.state() == SessionState::Invalidated {
            return None;
        }
        let fresh: Vec<&JournalEntry> = entries
            .iter()
            .filter(|e| e.sequence > self.applied_sequence)
            .collect();
        let Some(last) = fresh.last().map(|e| e.sequence) else {
            return None;
        };

        let relevant: Vec<&Mutation> = fresh
            .iter()
            .copied()
            .filter(|e| match &e.scope {
                Scope::Shared => true,
                Scope::Page(token) => self.pending_pages.contains(token),
            })
            .map(|e| &e.mutation)
            .collect();
        self.applied_sequence = last;
        if relevant.is_empty() {
            return Some(Vec::new());
        }

        let update = write_view(self.shared.view()).apply(relevant);
        self.settle(update)
    }

    /// Apply a cached page regardless of sequence
    pub(crate) fn replay_page(&mut self, entries: &[JournalEntry]) -> Option<Vec<FeatureChange>> {
        if self.state() == SessionState::Invalidated {
            return None;
        }
        let update = write_view(self.shared.view()).apply(entries.iter().map(|e| &e.mutation));
        self.settle(update)
    }

    pub(crate) fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.id().to_string(),
            applied_sequence: self.applied_sequence,
            epoch: self.epoch.clone(),
            view: crate::model::view::read_view(self.shared.view()).clone(),
        }
    }

    fn settle(&mut self, update: ViewUpdate) -> Option<Vec<FeatureChange>> {
        match update {
            ViewUpdate::Changes(changes) => Some(changes),
            ViewUpdate::Invalidated(reason) => {
                self.shared.invalidate(reason);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HeadTree, MutationBatch, NewChild};
    use crate::provider::InlineDispatcher;
    use std::sync::atomic::AtomicUsize;

    fn id(s: &str) -> StreamContentId {
        StreamContentId::from(s)
    }

    fn append(parent: &str, ids: &[&str]) -> Mutation {
        Mutation::UpdateOrAppend {
            parent: if parent == "$root" {
                StreamContentId::root()
            } else {
                id(parent)
            },
            children: ids.iter().map(|s| NewChild::feature(*s)).collect(),
        }
    }

    fn head_with(children: &[&str]) -> HeadTree {
        let mut head = HeadTree::new();
        head.apply_batch(&MutationBatch::shared(vec![
            append("$root", &["root"]),
            append("root", children),
        ]))
        .unwrap();
        head
    }

    fn session_on(head: &HeadTree) -> Session {
        let shared = Arc::new(SessionShared::new(
            "s1".to_string(),
            SessionView::from_head(head),
            UiContext::default(),
            Arc::new(InlineDispatcher),
        ));
        shared.mark_ready();
        Session::new(shared, head.sequence(), head.epoch())
    }

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ModelProviderObserver for Counting {
        fn on_session_start(&self, _ui: &UiContext) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_session_finished(&self, _ui: &UiContext) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _error: &ModelError) {}
    }

    #[test]
    fn test_consume_skips_applied_sequences() {
        let head = head_with(&["a", "b"]);
        let mut session = session_on(&head);

        assert!(session.consume(&append("root", &["c"]), 2).is_none());
        let changes = session.consume(&append("root", &["c"]), 3).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(session.applied_sequence(), 3);
    }

    #[test]
    fn test_page_entries_need_pending_token() {
        let mut head = head_with(&["a"]);
        let mut session = session_on(&head);
        let token = ContinuationToken::new(b"p".to_vec());
        let applied = head
            .apply_batch(&MutationBatch::page(token.clone(), vec![append("root", &["x"])]))
            .unwrap();

        let changes = session.consume_batch(&applied.entries).unwrap();
        assert!(changes.is_empty());
        assert_eq!(session.applied_sequence(), head.sequence());

        session.add_pending_page(token.clone());
        let replayed = session.replay_page(&head.page_entries(&token)).unwrap();
        assert_eq!(replayed[0].appended_children.len(), 1);
    }

    #[test]
    fn test_lifecycle_callbacks_fire_once() {
        let head = head_with(&["a"]);
        let mut session = session_on(&head);
        let observer = Arc::new(Counting::default());
        session.shared.register_observer(observer.clone());
        assert_eq!(observer.started.load(Ordering::SeqCst), 1);

        session.shared.mark_ready();
        assert!(session.consume(&Mutation::ClearAll, 10).is_none());
        session.shared.invalidate("again");

        assert_eq!(observer.started.load(Ordering::SeqCst), 1);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Invalidated);
        assert!(session.consume(&append("root", &["z"]), 11).is_none());
    }

    #[test]
    fn test_record_roundtrip() {
        let head = head_with(&["a", "b"]);
        let session = session_on(&head);
        let record = session.to_record();

        let decoded = SessionRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.epoch, head.epoch());
        assert_eq!(decoded.view.children(&id("root")).len(), 2);
    }
}
