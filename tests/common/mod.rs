#![allow(dead_code)]

use feedsync::model::ModelChild;
use feedsync::protocol::{WireAppend, WireContent, WireRemove, WireSemanticProperties, WireToken};
use feedsync::provider::ModelFeature;
use feedsync::session::FixedScheduler;
use feedsync::{
    ContentId, ContinuationToken, EngineConfig, FeatureChange, FeatureChangeObserver,
    ModelError, ModelProvider, ModelProviderFactory, ModelProviderObserver, RequestBehavior,
    Response, ScriptedRequestManager, StreamContentId, UiContext,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ROOT: i64 = 0;

// =============================================================================
// Wire helpers
// =============================================================================

pub fn root_wire() -> ContentId {
    ContentId::new("stream", "feature", ROOT)
}

pub fn card_wire(n: i64) -> ContentId {
    ContentId::new("stream", "card", n)
}

pub fn token_wire(n: i64) -> ContentId {
    ContentId::new("stream", "token", n)
}

pub fn root_id() -> StreamContentId {
    StreamContentId::new(root_wire().to_string())
}

pub fn card_id(n: i64) -> StreamContentId {
    StreamContentId::new(card_wire(n).to_string())
}

pub fn token(name: &str) -> ContinuationToken {
    ContinuationToken::new(name.as_bytes().to_vec())
}

fn wire_token(n: i64, name: &str) -> WireToken {
    WireToken {
        parent: Some(root_wire()),
        content_id: token_wire(n),
        next_page_token: name.as_bytes().to_vec(),
    }
}

/// Clearing refresh: root feature with `cards`, optionally followed by a token
pub fn initial_response(cards: &[i64], next: Option<(i64, &str)>) -> Response {
    Response {
        clear_all: true,
        appends: vec![
            WireAppend {
                parent: None,
                children: vec![root_wire()],
            },
            WireAppend {
                parent: Some(root_wire()),
                children: cards.iter().map(|n| card_wire(*n)).collect(),
            },
        ],
        token: next.map(|(n, name)| wire_token(n, name)),
        ..Default::default()
    }
}

/// Non-clearing response appending `cards` under the root feature
pub fn append_response(cards: &[i64], next: Option<(i64, &str)>) -> Response {
    Response {
        appends: vec![WireAppend {
            parent: Some(root_wire()),
            children: cards.iter().map(|n| card_wire(*n)).collect(),
        }],
        token: next.map(|(n, name)| wire_token(n, name)),
        ..Default::default()
    }
}

pub fn remove_response(cards: &[i64]) -> Response {
    Response {
        removes: vec![WireRemove {
            parent: root_wire(),
            children: cards.iter().map(|n| card_wire(*n)).collect(),
        }],
        ..Default::default()
    }
}

/// Page body: parentless cards attach where the token was
pub fn page_response(cards: &[i64]) -> Response {
    Response {
        appends: vec![WireAppend {
            parent: None,
            children: cards.iter().map(|n| card_wire(*n)).collect(),
        }],
        ..Default::default()
    }
}

pub fn content_response(card: i64, payload: &[u8], semantic: &[u8]) -> Response {
    Response {
        content: vec![WireContent {
            content_id: card_wire(card),
            payload: payload.to_vec(),
        }],
        semantic_properties: vec![WireSemanticProperties {
            content_id: card_wire(card),
            data: semantic.to_vec(),
        }],
        ..Default::default()
    }
}

// =============================================================================
// Engine setup
// =============================================================================

pub struct Harness {
    pub requests: Arc<ScriptedRequestManager>,
    pub scheduler: Arc<FixedScheduler>,
    pub factory: ModelProviderFactory,
}

pub fn harness(behavior: RequestBehavior, timeout: Duration) -> Harness {
    harness_with_config(
        behavior,
        EngineConfig {
            session_timeout_ms: timeout.as_millis() as u64,
            ..Default::default()
        },
    )
}

pub fn harness_with_config(behavior: RequestBehavior, config: EngineConfig) -> Harness {
    let requests = Arc::new(ScriptedRequestManager::new());
    let scheduler = Arc::new(FixedScheduler::new(behavior));
    let factory = ModelProviderFactory::builder(requests.clone())
        .scheduler(scheduler.clone())
        .config(config)
        .spawn()
        .expect("factory should start");
    Harness {
        requests,
        scheduler,
        factory,
    }
}

pub fn ui() -> UiContext {
    UiContext::new(&b"host"[..])
}

// =============================================================================
// Reading sessions
// =============================================================================

pub fn root(provider: &ModelProvider) -> ModelFeature {
    provider.get_root_feature().expect("session has a root feature")
}

/// Feature children of the root, in cursor order
pub fn cards(provider: &ModelProvider) -> Vec<StreamContentId> {
    match provider.get_root_feature() {
        Some(root) => root
            .cursor()
            .filter(|c| !c.is_token())
            .map(|c| c.content_id)
            .collect(),
        None => Vec::new(),
    }
}

pub fn tokens(provider: &ModelProvider) -> Vec<ContinuationToken> {
    provider
        .get_all_root_children()
        .into_iter()
        .filter_map(|c: ModelChild| c.continuation_token)
        .collect()
}

pub fn card_ids(ns: &[i64]) -> Vec<StreamContentId> {
    ns.iter().map(|n| card_id(*n)).collect()
}

/// Poll `cond` until it holds or two seconds pass
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

// =============================================================================
// Observers
// =============================================================================

#[derive(Default)]
pub struct LifecycleRecorder {
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    pub errors: Mutex<Vec<ModelError>>,
}

impl LifecycleRecorder {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<ModelError> {
        self.errors.lock().unwrap().clone()
    }
}

impl ModelProviderObserver for LifecycleRecorder {
    fn on_session_start(&self, _ui_context: &UiContext) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_session_finished(&self, _ui_context: &UiContext) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &ModelError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

#[derive(Default)]
pub struct ChangeRecorder {
    changes: Mutex<Vec<FeatureChange>>,
}

impl ChangeRecorder {
    pub fn changes(&self) -> Vec<FeatureChange> {
        self.changes.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.changes.lock().unwrap().len()
    }
}

impl FeatureChangeObserver for ChangeRecorder {
    fn on_change(&self, change: &FeatureChange) {
        self.changes.lock().unwrap().push(change.clone());
    }
}

pub fn watch_root(provider: &ModelProvider) -> Arc<ChangeRecorder> {
    let recorder = Arc::new(ChangeRecorder::default());
    root(provider).register_observer(recorder.clone());
    recorder
}

pub fn watch_lifecycle(provider: &ModelProvider) -> Arc<LifecycleRecorder> {
    let recorder = Arc::new(LifecycleRecorder::default());
    provider.register_observer(recorder.clone());
    recorder
}
