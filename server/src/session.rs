use std::time::{Duration, Instant};

use whiteboard_protocol::SessionId;

/// Lifecycle of one connected client. There is no way back: a session
/// that leaves `Active` is removed from the table entirely.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    AwaitingJoin,
    Active { name: String },
}

pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub last_cursor: Option<(f64, f64)>,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::AwaitingJoin,
            last_cursor: None,
            last_activity: Instant::now(),
        }
    }

    /// The display name recorded at join. Immutable once set.
    pub fn name(&self) -> Option<&str> {
        match &self.state {
            SessionState::Active { name } => Some(name),
            SessionState::AwaitingJoin => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}
