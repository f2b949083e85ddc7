use std::collections::HashMap;
use std::time::Duration;

use whiteboard_protocol::SessionId;

use crate::session::Session;

/// The authoritative session table. Owned exclusively by the relay
/// loop; every mutation and every fan-out iteration happens on that
/// single task, which is what serializes connect/disconnect against
/// broadcast.
pub struct ServerState {
    session_id_source: SessionId,
    pub sessions: HashMap<SessionId, Session>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            session_id_source: 0,
            sessions: HashMap::new(),
        }
    }

    pub fn create_session(&mut self) -> SessionId {
        let session_id = self.new_session_id();
        self.sessions.insert(session_id, Session::new(session_id));
        session_id
    }

    pub fn remove_session(&mut self, session_id: &SessionId) -> Option<Session> {
        self.sessions.remove(session_id)
    }

    /// Ids of sessions with no traffic for at least `timeout`.
    pub fn idle_session_ids(&self, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.idle_for() >= timeout)
            .map(|s| s.id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    fn new_session_id(&mut self) -> SessionId {
        self.session_id_source += 1;
        self.session_id_source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn it_never_reuses_session_ids() {
        let mut state = ServerState::new();
        let a = state.create_session();
        state.remove_session(&a);
        let b = state.create_session();
        assert_ne!(a, b);
    }

    #[test]
    fn it_removes_sessions() {
        let mut state = ServerState::new();
        let id = state.create_session();
        assert!(state.remove_session(&id).is_some());
        assert!(state.sessions.is_empty());
        assert!(state.remove_session(&id).is_none());
    }

    #[test]
    fn it_finds_idle_sessions() {
        let mut state = ServerState::new();
        let stale = state.create_session();
        let fresh = state.create_session();
        state.sessions.get_mut(&stale).unwrap().last_activity =
            Instant::now() - Duration::from_secs(600);

        let idle = state.idle_session_ids(Duration::from_secs(300));
        assert_eq!(idle, vec![stale]);
        assert!(!idle.contains(&fresh));
    }
}
