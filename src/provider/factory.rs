//! Factory creating model providers and owning the manager task.

use super::{Dispatcher, InlineDispatcher, ModelProvider, UiContext};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::protocol::{DefaultProtocolAdapter, ProtocolAdapter, Response};
use crate::request::{RequestManager, RequestReason};
use crate::session::channel::{command_channel, Command, CommandSender, ManagerStats};
use crate::session::manager::{Collaborators, SessionManager};
use crate::session::{FixedScheduler, SchedulerApi, SessionShared, SessionState};
use crate::store::{ContentStore, FileContentStore, InMemoryStore};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

pub struct ModelProviderFactoryBuilder {
    requests: Arc<dyn RequestManager>,
    adapter: Option<Arc<dyn ProtocolAdapter>>,
    scheduler: Option<Arc<dyn SchedulerApi>>,
    store: Option<Arc<dyn ContentStore>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    config: EngineConfig,
}

impl ModelProviderFactoryBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn SchedulerApi>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Where observer callbacks run (inline on the manager task by default)
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Start the manager task on the current tokio runtime
    pub fn spawn(self) -> Result<ModelProviderFactory> {
        self.config.validate()?;

        let store: Arc<dyn ContentStore> = match (self.store, &self.config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileContentStore::open(path.clone())?),
            (None, None) => Arc::new(InMemoryStore::new()),
        };
        let scheduler: Arc<dyn SchedulerApi> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(FixedScheduler::new(self.config.default_request_behavior)),
        };
        let adapter: Arc<dyn ProtocolAdapter> = match self.adapter {
            Some(adapter) => adapter,
            None => Arc::new(DefaultProtocolAdapter),
        };
        let dispatcher: Arc<dyn Dispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(InlineDispatcher),
        };

        let deps = Collaborators {
            requests: self.requests,
            adapter,
            scheduler,
            store: store.clone(),
            dispatcher,
        };

        let (tx, rx) = command_channel();
        let manager = SessionManager::new(deps, &self.config, tx.downgrade());
        let handle = tokio::spawn(manager.run(rx));
        info!(
            timeout_ms = self.config.session_timeout_ms,
            max_detached = self.config.max_detached_sessions,
            "Model provider factory started"
        );

        Ok(ModelProviderFactory {
            tx,
            store,
            handle: Mutex::new(Some(handle)),
        })
    }
}

pub struct ModelProviderFactory {
    tx: CommandSender,
    store: Arc<dyn ContentStore>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ModelProviderFactory {
    pub fn builder(requests: Arc<dyn RequestManager>) -> ModelProviderFactoryBuilder {
        ModelProviderFactoryBuilder {
            requests,
            adapter: None,
            scheduler: None,
            store: None,
            dispatcher: None,
            config: EngineConfig::default(),
        }
    }

    /// Factory with default collaborators for `config`
    pub fn spawn(requests: Arc<dyn RequestManager>, config: EngineConfig) -> Result<Self> {
        Self::builder(requests).config(config).spawn()
    }

    /// Create a fresh session, invalidating `existing` if given.
    ///
    /// Resolves once the session has left Initializing, which may include
    /// waiting for a refresh depending on the scheduler's behaviour.
    pub async fn create_new(
        &self,
        existing: Option<&str>,
        ui_context: UiContext,
    ) -> Result<ModelProvider> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateSession {
            existing: existing.map(str::to_string),
            ui_context,
            reply,
        })?;
        let shared = rx.await.map_err(|_| SyncError::ManagerClosed)??;
        wait_until_started(&shared).await?;
        Ok(self.provider(shared))
    }

    /// Reattach to a detached (or persisted) session
    pub async fn create(&self, session_id: &str, ui_context: UiContext) -> Result<ModelProvider> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reattach {
            session_id: session_id.to_string(),
            ui_context,
            reply,
        })?;
        let shared = rx.await.map_err(|_| SyncError::ManagerClosed)??;
        Ok(self.provider(shared))
    }

    /// Apply a response that did not come from the request manager
    pub async fn push_response(&self, response: Response) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PushResponse { response, reply })?;
        rx.await.map_err(|_| SyncError::ManagerClosed)?
    }

    /// Start a refresh unless one is already outstanding
    pub fn trigger_refresh(&self, reason: RequestReason) -> Result<()> {
        self.send(Command::TriggerRefresh { reason })
    }

    /// Dispose a session for good. Returns false if nothing was known about it.
    pub async fn release(&self, session_id: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Release {
            session_id: session_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| SyncError::ManagerClosed)
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| SyncError::ManagerClosed)
    }

    /// Stop the manager task, surfacing the error that stopped it if any
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.tx.send(Command::Shutdown);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle.await.map_err(|_| SyncError::ManagerClosed)?,
            None => Ok(()),
        }
    }

    fn provider(&self, shared: Arc<SessionShared>) -> ModelProvider {
        ModelProvider::new(shared, self.tx.clone(), self.store.clone())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| SyncError::ManagerClosed)
    }
}

async fn wait_until_started(shared: &SessionShared) -> Result<()> {
    let mut state = shared.subscribe();
    state
        .wait_for(|s| *s != SessionState::Initializing)
        .await
        .map_err(|_| SyncError::ManagerClosed)?;
    Ok(())
}
