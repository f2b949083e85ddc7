use std::collections::HashMap;

use tokio::sync::mpsc::error::TrySendError;

use whiteboard_protocol::SessionId;

use crate::connection::ConnectionEvent;

pub type ConnectionTx = tokio::sync::mpsc::Sender<ConnectionEvent>;

/// Outcome of a non-blocking delivery attempt into one session's
/// bounded outbound queue. The relay loop decides policy per outcome;
/// this type only reports what happened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SendOutcome {
    Sent,
    /// The queue is full; the peer is not keeping up.
    Full,
    /// The receiving side is gone.
    Closed,
}

pub struct ConnectionTxStorage {
    connection_txs: HashMap<SessionId, ConnectionTx>,
}

impl ConnectionTxStorage {
    pub fn new() -> Self {
        Self {
            connection_txs: HashMap::new(),
        }
    }

    pub fn insert(&mut self, session_id: SessionId, tx: ConnectionTx) {
        self.connection_txs.insert(session_id, tx);
    }

    pub fn try_send(&mut self, to: &SessionId, event: ConnectionEvent) -> SendOutcome {
        match self.connection_txs.get_mut(to) {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => SendOutcome::Sent,
                Err(TrySendError::Full(_)) => SendOutcome::Full,
                Err(TrySendError::Closed(_)) => SendOutcome::Closed,
            },
            None => SendOutcome::Closed,
        }
    }

    pub fn remove(&mut self, session_id: &SessionId) -> Option<ConnectionTx> {
        self.connection_txs.remove(session_id)
    }
}
