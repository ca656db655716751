//! Registry of live and detached sessions, owned by the manager task.

use super::{Session, SessionState};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// Generate a globally unique session id
pub fn new_session_id() -> String {
    format!("session_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    live: HashMap<String, Session>,
    detached: HashMap<String, Session>,
    /// Detached ids, longest detached first
    detach_order: VecDeque<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: Session) {
        debug!(session_id = %session.id(), "Registering session");
        self.take_detached(session.id());
        self.live.insert(session.id().to_string(), session);
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.live.get_mut(session_id)
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.live.contains_key(session_id)
    }

    /// Move a live session to the detached set
    pub fn detach(&mut self, session_id: &str) -> Option<&Session> {
        let session = self.live.remove(session_id)?;
        session.shared.set_attached(false);
        debug!(session_id, "Session detached");
        let id = session_id.to_string();
        self.detach_order.push_back(id.clone());
        self.detached.insert(id.clone(), session);
        self.detached.get(&id)
    }

    /// Take a detached session out for reattachment
    pub fn take_detached(&mut self, session_id: &str) -> Option<Session> {
        let session = self.detached.remove(session_id)?;
        self.detach_order.retain(|id| id != session_id);
        Some(session)
    }

    /// Drop a session from either set
    pub fn dispose(&mut self, session_id: &str) -> Option<Session> {
        let session = match self.live.remove(session_id) {
            Some(session) => session,
            None => self.take_detached(session_id)?,
        };
        debug!(session_id, "Session disposed");
        Some(session)
    }

    /// Remove the longest detached sessions until at most `limit` remain
    pub fn evict_detached(&mut self, limit: usize) -> Vec<Session> {
        let mut evicted = Vec::new();
        while self.detached.len() > limit {
            let Some(id) = self.detach_order.pop_front() else {
                break;
            };
            if let Some(session) = self.detached.remove(&id) {
                debug!(session_id = %id, "Evicting detached session");
                evicted.push(session);
            }
        }
        evicted
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.live.values_mut()
    }

    /// Lowest applied sequence of any session, live or detached, that may
    /// still replay the journal
    pub fn min_applied_sequence(&self) -> Option<u64> {
        self.live
            .values()
            .chain(self.detached.values())
            .filter(|s| s.state() != SessionState::Invalidated)
            .map(|s| s.applied_sequence())
            .min()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn detached_count(&self) -> usize {
        self.detached.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionView;
    use crate::provider::{InlineDispatcher, UiContext};
    use crate::session::SessionShared;
    use std::sync::Arc;

    fn session(id: &str) -> Session {
        let shared = Arc::new(SessionShared::new(
            id.to_string(),
            SessionView::new(),
            UiContext::default(),
            Arc::new(InlineDispatcher),
        ));
        Session::new(shared, 0, "epoch")
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
        assert!(new_session_id().starts_with("session_"));
    }

    #[test]
    fn test_detach_and_take() {
        let mut registry = SessionRegistry::new();
        registry.register(session("a"));
        registry.register(session("b"));

        let detached = registry.detach("a").unwrap();
        assert!(!detached.is_attached());
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.detached_count(), 1);
        assert!(registry.detach("missing").is_none());

        let taken = registry.take_detached("a").unwrap();
        assert_eq!(taken.id(), "a");
        assert!(registry.take_detached("a").is_none());
        assert_eq!(registry.detached_count(), 0);
    }

    #[test]
    fn test_dispose_either_set() {
        let mut registry = SessionRegistry::new();
        registry.register(session("a"));
        registry.register(session("b"));
        registry.detach("b");

        assert!(registry.dispose("a").is_some());
        assert!(registry.dispose("b").is_some());
        assert!(registry.dispose("b").is_none());
        assert_eq!(registry.live_count() + registry.detached_count(), 0);
    }

    #[test]
    fn test_evict_oldest_detached() {
        let mut registry = SessionRegistry::new();
        for id in ["a", "b", "c"] {
            registry.register(session(id));
            registry.detach(id);
        }
        // Reattaching and detaching again makes "a" the newest
        let a = registry.take_detached("a").unwrap();
        registry.register(a);
        registry.detach("a");

        let evicted = registry.evict_detached(1);
        let ids: Vec<&str> = evicted.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(registry.detached_count(), 1);
        assert!(registry.take_detached("a").is_some());
        assert!(registry.evict_detached(0).is_empty());
    }

    #[test]
    fn test_min_applied_sequence_spans_both_sets() {
        let mut registry = SessionRegistry::new();
        assert_eq!(registry.min_applied_sequence(), None);

        let gone = session("gone");
        gone.shared.invalidate("host");
        registry.register(gone);

        registry.register(Session::new(session("low").shared, 3, "epoch"));
        registry.detach("low");
        registry.register(Session::new(session("high").shared, 9, "epoch"));

        assert_eq!(registry.min_applied_sequence(), Some(3));
        registry.dispose("low");
        assert_eq!(registry.min_applied_sequence(), Some(9));
    }
}
