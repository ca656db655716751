//! Session manager task.
//!
//! Owns the head tree, the session registry and the bookkeeping for in-flight
//! requests. Runs as a single tokio task consuming `Command`s; request calls
//! and session timers run as separate tasks that report back over the same
//! channel, so mutation application and fan-out are strictly serialized.

use super::channel::{Command, CommandReceiver, ManagerStats};
use super::policy::{admit, SchedulerApi, Wait};
use super::registry::{new_session_id, SessionRegistry};
use super::{Session, SessionRecord, SessionShared, SessionState};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::model::view::read_view;
use crate::model::{
    AppliedBatch, ContinuationToken, HeadTree, JournalEntry, Mutation, MutationBatch,
    SessionView, StreamContentId,
};
use crate::protocol::{Anchor, ProtocolAdapter, Response};
use crate::provider::{Dispatcher, ModelError, UiContext};
use crate::request::{RequestError, RequestManager, RequestReason};
use crate::store::{content_key, semantic_key, session_key, ContentStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Collaborators the manager drives
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub requests: Arc<dyn RequestManager>,
    pub adapter: Arc<dyn ProtocolAdapter>,
    pub scheduler: Arc<dyn SchedulerApi>,
    pub store: Arc<dyn ContentStore>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

struct OutstandingRefresh {
    id: u64,
    reason: RequestReason,
}

/// An in-flight `load_more`
struct PageRequest {
    generation: u64,
    /// Feature that owned the token node
    parent: StreamContentId,
    token_node: StreamContentId,
    /// Sessions that asked for this page
    waiters: HashSet<String>,
}

pub(crate) struct SessionManager {
    head: HeadTree,
    registry: SessionRegistry,
    deps: Collaborators,
    session_timeout: Duration,
    max_detached_sessions: usize,
    tx: mpsc::WeakUnboundedSender<Command>,

    refresh: Option<OutstandingRefresh>,
    /// Initializing sessions and what they wait for
    waiting: HashMap<String, Wait>,
    pages: HashMap<ContinuationToken, PageRequest>,

    next_request_id: u64,
    refresh_requests: u64,
    page_requests: u64,
}

impl SessionManager {
    pub fn new(
        deps: Collaborators,
        config: &EngineConfig,
        tx: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            head: HeadTree::new(),
            registry: SessionRegistry::new(),
            deps,
            session_timeout: config.session_timeout(),
            max_detached_sessions: config.max_detached_sessions,
            tx,
            refresh: None,
            waiting: HashMap::new(),
            pages: HashMap::new(),
            next_request_id: 0,
            refresh_requests: 0,
            page_requests: 0,
        }
    }

    /// Consume commands until shutdown, every sender is gone, or a
    /// structural failure.
    pub async fn run(mut self, mut rx: CommandReceiver) -> Result<()> {
        info!("Session manager started");

        while let Some(command) = rx.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            if let Err(e) = self.handle(command) {
                error!(error = %e, sequence = self.head.sequence(), "Session manager failed");
                self.invalidate_all("session manager failed");
                return Err(e);
            }
        }

        info!(
            sequence = self.head.sequence(),
            sessions = self.registry.live_count(),
            "Session manager stopped"
        );
        Ok(())
    }

    fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::CreateSession {
                existing,
                ui_context,
                reply,
            } => {
                let _ = reply.send(Ok(self.create_session(existing, ui_context)));
            }
            Command::Reattach {
                session_id,
                ui_context,
                reply,
            } => {
                let _ = reply.send(self.reattach(&session_id, ui_context));
            }
            Command::HandleToken { session_id, token } => self.handle_token(&session_id, token),
            Command::TriggerRefresh { reason } => {
                if self.refresh.is_none() {
                    self.start_refresh(reason);
                }
            }
            Command::Detach { session_id } => self.detach(&session_id),
            Command::Invalidate { session_id } => self.invalidate(&session_id),
            Command::Release { session_id, reply } => {
                let _ = reply.send(self.release(&session_id));
            }
            Command::PushResponse { response, reply } => {
                // Validation runs before anything is applied; a rejected
                // push leaves head untouched and goes back to the caller.
                let result = self.apply_shared(&response);
                if let Err(e) = &result {
                    warn!(error = %e, "Rejected pushed response");
                }
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => {}
            Command::RefreshCompleted { request_id, result } => {
                self.on_refresh_completed(request_id, result)?
            }
            Command::PageCompleted { token, result } => self.on_page_completed(token, result)?,
            Command::SessionTimeout { session_id } => {
                if self.waiting.get(&session_id) == Some(&Wait::RequestOrTimeout) {
                    debug!(session_id = %session_id, "Session timeout fired");
                    self.resolve(&session_id, false);
                }
            }
        }
        self.compact();
        Ok(())
    }

    // =========================================================================
    // Session creation
    // =========================================================================

    fn create_session(
        &mut self,
        existing: Option<String>,
        ui_context: UiContext,
    ) -> Arc<SessionShared> {
        if let Some(existing) = existing {
            self.invalidate(&existing);
        }

        let has_content = !self.head.is_empty();
        let behavior = self.deps.scheduler.should_make_request(has_content);
        let admission = admit(behavior, has_content, self.refresh.is_some());

        let session_id = new_session_id();
        let shared = Arc::new(SessionShared::new(
            session_id.clone(),
            SessionView::from_head(&self.head),
            ui_context,
            self.deps.dispatcher.clone(),
        ));
        self.registry.register(Session::new(
            shared.clone(),
            self.head.sequence(),
            self.head.epoch(),
        ));
        info!(
            session_id = %session_id,
            ?behavior,
            sequence = self.head.sequence(),
            "Session created"
        );

        if admission.issue_request {
            let reason = if has_content {
                RequestReason::SessionStart
            } else {
                RequestReason::InitialLoad
            };
            self.start_refresh(reason);
        }

        match admission.wait {
            Wait::Nothing => shared.mark_ready(),
            Wait::Request => {
                self.waiting.insert(session_id, Wait::Request);
            }
            Wait::RequestOrTimeout => {
                self.waiting.insert(session_id.clone(), Wait::RequestOrTimeout);
                self.start_timer(session_id);
            }
        }
        shared
    }

    fn reattach(&mut self, session_id: &str, ui_context: UiContext) -> Result<Arc<SessionShared>> {
        if self.registry.is_live(session_id) {
            return Err(SyncError::SessionAttached(session_id.to_string()));
        }

        let record = match self.registry.take_detached(session_id) {
            Some(session) => session.to_record(),
            None => self.load_record(session_id)?,
        };

        let shared = Arc::new(SessionShared::new(
            record.session_id.clone(),
            record.view,
            ui_context,
            self.deps.dispatcher.clone(),
        ));
        let mut session = Session::new(shared.clone(), record.applied_sequence, &record.epoch);

        // A record from another head, or one the journal can no longer
        // bring up to date, cannot be reconciled
        if record.epoch != self.head.epoch()
            || !self.head.can_replay_from(record.applied_sequence)
        {
            info!(
                session_id,
                applied_sequence = record.applied_sequence,
                head_sequence = self.head.sequence(),
                same_epoch = record.epoch == self.head.epoch(),
                "Reattached session is stale"
            );
            shared.invalidate("stale session record");
        } else {
            shared.mark_ready();
            let entries: Vec<JournalEntry> = self
                .head
                .entries_after(record.applied_sequence)
                .cloned()
                .collect();
            session.consume_batch(&entries);
            info!(
                session_id,
                from = record.applied_sequence,
                to = session.applied_sequence(),
                "Session reattached"
            );
        }

        self.forget_record(session_id);
        self.registry.register(session);
        Ok(shared)
    }

    fn load_record(&self, session_id: &str) -> Result<SessionRecord> {
        let key = session_key(session_id);
        let read = self.deps.store.get(std::slice::from_ref(&key))?;
        match read.found.get(&key) {
            Some(bytes) => SessionRecord::decode(bytes),
            None => Err(SyncError::UnknownSession(session_id.to_string())),
        }
    }

    fn forget_record(&self, session_id: &str) {
        if let Err(e) = self.deps.store.remove(&[session_key(session_id)]) {
            warn!(session_id, error = %e, "Failed to remove session record");
        }
    }

    /// Bind a waiting session to the current head and make it Ready
    fn resolve(&mut self, session_id: &str, request_failed: bool) {
        self.waiting.remove(session_id);
        let Some(session) = self.registry.get_mut(session_id) else {
            return;
        };
        if session.state() != SessionState::Initializing {
            return;
        }

        session.rebind(
            SessionView::from_head(&self.head),
            self.head.sequence(),
            self.head.epoch(),
        );
        session.shared.mark_ready();
        if request_failed && self.head.is_empty() {
            session.shared.report_error(ModelError::no_cards());
        }
    }

    fn start_timer(&self, session_id: String) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let timeout = self.session_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Command::SessionTimeout { session_id });
        });
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    fn start_refresh(&mut self, reason: RequestReason) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.next_request_id += 1;
        self.refresh_requests += 1;
        let request_id = self.next_request_id;
        self.refresh = Some(OutstandingRefresh {
            id: request_id,
            reason,
        });
        debug!(request_id, %reason, "Starting refresh");

        let requests = self.deps.requests.clone();
        tokio::spawn(async move {
            let result = requests.refresh(reason).await;
            let _ = tx.send(Command::RefreshCompleted { request_id, result });
        });
    }

    fn on_refresh_completed(
        &mut self,
        request_id: u64,
        result: std::result::Result<Response, RequestError>,
    ) -> Result<()> {
        match &self.refresh {
            Some(outstanding) if outstanding.id == request_id => {
                debug!(request_id, reason = %outstanding.reason, "Refresh completed");
                self.refresh = None;
            }
            _ => debug!(request_id, "Completion for a superseded refresh"),
        }

        let failed = match result {
            Ok(response) => {
                self.apply_shared(&response)?;
                false
            }
            Err(e) => {
                warn!(request_id, error = %e, "Refresh failed, using existing content");
                true
            }
        };

        let waiting: Vec<String> = self.waiting.keys().cloned().collect();
        for session_id in waiting {
            self.resolve(&session_id, failed);
        }
        Ok(())
    }

    /// Convert and apply a refresh or pushed response for every session
    fn apply_shared(&mut self, response: &Response) -> Result<()> {
        let mutations = self.deps.adapter.to_mutations(response, &Anchor::Root)?;
        if mutations.is_empty() {
            return Ok(());
        }
        let applied = self.head.apply_batch(&MutationBatch::shared(mutations))?;
        self.persist(&applied.entries);
        self.fan_out(&applied);
        Ok(())
    }

    // =========================================================================
    // Paging
    // =========================================================================

    fn handle_token(&mut self, session_id: &str, token: ContinuationToken) {
        let Some(session) = self.registry.get_mut(session_id) else {
            debug!(session_id, %token, "Token for a session that is not live");
            return;
        };
        if session.state() == SessionState::Invalidated {
            return;
        }
        let location = read_view(session.shared.view()).token_location(&token);
        let Some((token_node, parent)) = location else {
            session.shared.report_error(ModelError::pagination(token));
            return;
        };
        if session.has_pending_page(&token) {
            debug!(session_id, %token, "Page already pending");
            return;
        }

        if self.head.has_page(&token) {
            debug!(session_id, %token, "Replaying cached page");
            let entries = self.head.page_entries(&token);
            if let Some(changes) = session.replay_page(&entries) {
                session.shared.notify_changes(changes);
            }
            return;
        }

        session.add_pending_page(token.clone());
        if let Some(page) = self.pages.get_mut(&token) {
            page.waiters.insert(session_id.to_string());
            return;
        }

        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.page_requests += 1;
        self.pages.insert(
            token.clone(),
            PageRequest {
                generation: self.head.generation(),
                parent,
                token_node,
                waiters: HashSet::from([session_id.to_string()]),
            },
        );
        debug!(session_id, %token, "Starting page request");

        let requests = self.deps.requests.clone();
        tokio::spawn(async move {
            let result = requests.load_more(&token).await;
            let _ = tx.send(Command::PageCompleted { token, result });
        });
    }

    fn on_page_completed(
        &mut self,
        token: ContinuationToken,
        result: std::result::Result<Response, RequestError>,
    ) -> Result<()> {
        let Some(page) = self.pages.remove(&token) else {
            return Ok(());
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(%token, error = %e, "Page request failed");
                for session_id in &page.waiters {
                    if let Some(session) = self.registry.get_mut(session_id) {
                        session.take_pending_page(&token);
                        session.shared.report_error(ModelError::pagination(token.clone()));
                    }
                }
                return Ok(());
            }
        };

        if page.generation != self.head.generation() || self.head.node(&page.parent).is_none() {
            warn!(
                %token,
                generation = page.generation,
                head_generation = self.head.generation(),
                "Discarding page for content no longer in head"
            );
            self.release_page_waiters(&token, &page.waiters);
            return Ok(());
        }

        let mut mutations = vec![Mutation::RemoveChildren {
            parent: page.parent.clone(),
            children: vec![page.token_node.clone()],
        }];
        mutations.extend(
            self.deps
                .adapter
                .to_mutations(&response, &Anchor::Node(page.parent.clone()))?,
        );

        let applied = self
            .head
            .apply_batch(&MutationBatch::page(token.clone(), mutations))?;
        self.persist(&applied.entries);
        self.fan_out(&applied);
        self.release_page_waiters(&token, &page.waiters);
        Ok(())
    }

    fn release_page_waiters(&mut self, token: &ContinuationToken, waiters: &HashSet<String>) {
        for session_id in waiters {
            if let Some(session) = self.registry.get_mut(session_id) {
                session.take_pending_page(token);
            }
        }
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    fn fan_out(&mut self, applied: &AppliedBatch) {
        if applied.starts_generation() {
            let reason = if applied.cleared {
                "head cleared"
            } else {
                "root replaced"
            };
            info!(generation = applied.generation, reason, "Head started a new generation");
            for session in self.registry.live_mut() {
                if session.state() == SessionState::Ready {
                    session.shared.invalidate(reason);
                }
            }
            return;
        }

        for session in self.registry.live_mut() {
            if session.state() != SessionState::Ready {
                continue;
            }
            if let Some(changes) = session.consume_batch(&applied.entries) {
                debug!(
                    session_id = %session.id(),
                    sequence = session.applied_sequence(),
                    changes = changes.len(),
                    "Delivering changes"
                );
                session.shared.notify_changes(changes);
            }
        }
    }

    /// Best-effort write of content and semantic properties
    fn persist(&self, entries: &[JournalEntry]) {
        let records: Vec<(String, Vec<u8>)> = entries
            .iter()
            .filter_map(|entry| match &entry.mutation {
                Mutation::UpdateContent { id, payload } => {
                    Some((content_key(id), payload.clone()))
                }
                Mutation::SetSemanticProperties { id, bytes } => {
                    Some((semantic_key(id), bytes.clone()))
                }
                _ => None,
            })
            .collect();
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.deps.store.put_all(&records) {
            warn!(error = %e, records = records.len(), "Failed to persist content records");
        }
    }

    // =========================================================================
    // Session teardown
    // =========================================================================

    fn detach(&mut self, session_id: &str) {
        let Some(session) = self.registry.detach(session_id) else {
            debug!(session_id, "Detach for a session that is not live");
            return;
        };
        let record = session.to_record();
        self.waiting.remove(session_id);

        match record.encode() {
            Ok(bytes) => {
                if let Err(e) = self.deps.store.put(&session_key(session_id), &bytes) {
                    warn!(session_id, error = %e, "Failed to store session record");
                }
            }
            Err(e) => warn!(session_id, error = %e, "Failed to encode session record"),
        }

        for evicted in self.registry.evict_detached(self.max_detached_sessions) {
            let evicted_id = evicted.id().to_string();
            info!(session_id = %evicted_id, "Detached session limit reached, evicting");
            evicted.shared.invalidate("evicted while detached");
            self.forget_record(&evicted_id);
        }
    }

    fn invalidate(&mut self, session_id: &str) {
        self.waiting.remove(session_id);
        if let Some(session) = self.registry.dispose(session_id) {
            session.shared.invalidate("invalidated by host");
        }
        self.forget_record(session_id);
    }

    fn release(&mut self, session_id: &str) -> bool {
        self.waiting.remove(session_id);
        let disposed = match self.registry.dispose(session_id) {
            Some(session) => {
                session.shared.invalidate("released");
                true
            }
            None => false,
        };
        let stored = match self.deps.store.remove(&[session_key(session_id)]) {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to remove session record");
                false
            }
        };
        disposed || stored
    }

    /// Drop journal entries that every session has already applied
    fn compact(&mut self) {
        let through = self
            .registry
            .min_applied_sequence()
            .unwrap_or(self.head.sequence());
        let trimmed = self.head.trim_journal(through);
        if trimmed > 0 {
            debug!(
                through,
                trimmed,
                remaining = self.head.journal_len(),
                "Trimmed journal"
            );
        }
    }

    fn invalidate_all(&mut self, reason: &str) {
        for session in self.registry.live_mut() {
            session.shared.invalidate(reason);
        }
    }

    fn stats(&self) -> ManagerStats {
        ManagerStats {
            sequence: self.head.sequence(),
            generation: self.head.generation(),
            nodes: self.head.len(),
            journal_entries: self.head.journal_len(),
            live_sessions: self.registry.live_count(),
            detached_sessions: self.registry.detached_count(),
            refresh_requests: self.refresh_requests,
            page_requests: self.page_requests,
            refresh_outstanding: self.refresh.is_some(),
            pages_outstanding: self.pages.len(),
        }
    }
}
