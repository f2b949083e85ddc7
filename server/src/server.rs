use actix_web_actors::ws::CloseCode;
use serde::Serialize;
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;

use whiteboard_protocol::{ClientMessage, ServerMessage, SessionId};

use crate::config::Config;
use crate::connection::{ConnectionCommand, ConnectionEvent};
use crate::connection_tx_storage::{ConnectionTxStorage, SendOutcome};
use crate::error::RelayError;
use crate::server_state::ServerState;
use crate::session::SessionState;

pub type ServerTx = Sender<ServerCommand>;

#[derive(Debug)]
pub enum ServerCommand {
    Connection(ConnectionCommand),
    Status { tx: oneshot::Sender<RelayStatus> },
}

impl From<ConnectionCommand> for ServerCommand {
    fn from(command: ConnectionCommand) -> Self {
        ServerCommand::Connection(command)
    }
}

/// Read-only snapshot of the relay for the status endpoint.
#[derive(Debug, Serialize)]
pub struct RelayStatus {
    pub active_sessions: usize,
    pub sessions: Vec<SessionStatus>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub name: Option<String>,
    pub idle_secs: u64,
}

/// The broadcast relay. One task owns it; everything it does is a plain
/// synchronous step over the session table and the outbound senders, so
/// a broadcast can never observe a session mid-construction and a slow
/// peer can never block the loop (all sends are `try_send`).
struct Server {
    state: ServerState,
    connections: ConnectionTxStorage,
    config: Config,
}

impl Server {
    fn new(config: Config) -> Self {
        Self {
            state: ServerState::new(),
            connections: ConnectionTxStorage::new(),
            config,
        }
    }

    fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Connection(command) => self.handle_connection_command(command),
            ServerCommand::Status { tx } => {
                let _ = tx.send(self.status());
            }
        }
    }

    fn handle_connection_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect { tx, res_tx } => {
                let session_id = self.state.create_session();
                self.connections.insert(session_id, tx);
                if res_tx.send(session_id).is_err() {
                    // The handshake was abandoned before we answered.
                    log::info!("{}", RelayError::Transport(session_id));
                    self.drop_session(&session_id);
                } else {
                    log::info!("session {} connected, awaiting join", session_id);
                }
            }
            ConnectionCommand::Disconnect { from } => {
                self.drop_session(&from);
            }
            ConnectionCommand::Incoming { from, message } => match message {
                ClientMessage::Join { name } => self.handle_join(&from, &name),
                ClientMessage::Unknown => {
                    log::debug!("session {}: unknown message type dropped", from)
                }
                other => self.relay_from(&from, other),
            },
        }
    }

    fn handle_join(&mut self, from: &SessionId, name: &str) {
        let name = name.trim().to_owned();
        let accepted = match self.state.sessions.get_mut(from) {
            None => return,
            Some(session) => match &session.state {
                SessionState::Active { .. } => {
                    // A second join is a benign race, not a violation.
                    log::debug!("session {}: duplicate join ignored", from);
                    return;
                }
                SessionState::AwaitingJoin => {
                    if name.is_empty() {
                        false
                    } else {
                        session.state = SessionState::Active { name: name.clone() };
                        session.touch();
                        true
                    }
                }
            },
        };

        if accepted {
            log::info!("session {} joined as {:?}", from, name);
        } else {
            log::warn!(
                "session {}: {}; closing connection",
                from,
                RelayError::Protocol("join name is empty".into())
            );
            self.close_session(from, CloseCode::Invalid);
        }
    }

    /// Validates and fans out a draw/cursor/clear message from an
    /// active session. Anything wrong with the message itself is
    /// fail-soft: drop, log, and the sender stays connected.
    fn relay_from(&mut self, from: &SessionId, message: ClientMessage) {
        let sender_name = match self.state.sessions.get(from) {
            None => return,
            Some(session) => match session.name() {
                Some(name) => name.to_owned(),
                None => {
                    log::debug!(
                        "session {}: {} before join dropped",
                        from,
                        message.kind()
                    );
                    return;
                }
            },
        };

        if let Err(err) = message.validate() {
            log::warn!(
                "session {}: {} dropped ({})",
                from,
                message.kind(),
                RelayError::from(err)
            );
            return;
        }

        if let Some(session) = self.state.sessions.get_mut(from) {
            session.touch();
            if let ClientMessage::Cursor { x, y } = &message {
                session.last_cursor = Some((*x, *y));
            }
        }

        let outbound = match message {
            ClientMessage::Draw {
                from_x,
                from_y,
                to_x,
                to_y,
                color,
                size,
            } => ServerMessage::Draw {
                from_x,
                from_y,
                to_x,
                to_y,
                color,
                size,
            },
            ClientMessage::Cursor { x, y } => ServerMessage::Cursor {
                user_id: *from,
                name: sender_name,
                x,
                y,
            },
            ClientMessage::Clear => ServerMessage::Clear,
            ClientMessage::Join { .. } | ClientMessage::Unknown => return,
        };

        self.broadcast(outbound, Some(from));
    }

    /// Fan-out to every active session except `without` (the sender,
    /// which has already rendered locally). Non-blocking throughout.
    fn broadcast(&mut self, message: ServerMessage, without: Option<&SessionId>) {
        let targets: Vec<SessionId> = self
            .state
            .sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.id)
            .filter(|id| without.map_or(true, |w| w != id))
            .collect();

        let mut overflowed = Vec::new();
        let mut unreachable = Vec::new();
        for id in targets {
            let event = ConnectionEvent::Relay(message.clone());
            match self.connections.try_send(&id, event) {
                SendOutcome::Sent => {}
                SendOutcome::Full => {
                    if message.is_supersedable() {
                        // The next cursor update supersedes this one.
                        log::debug!("session {}: queue full, cursor update dropped", id);
                    } else {
                        log::warn!("{}; disconnecting", RelayError::Capacity(id));
                        overflowed.push(id);
                    }
                }
                SendOutcome::Closed => {
                    log::info!("{}", RelayError::Transport(id));
                    unreachable.push(id);
                }
            }
        }

        for id in overflowed {
            self.close_session(&id, CloseCode::Policy);
        }
        for id in unreachable {
            self.drop_session(&id);
        }
    }

    /// Server-initiated termination: tell the peer (best effort), then
    /// forget it.
    fn close_session(&mut self, session_id: &SessionId, code: CloseCode) {
        let _ = self
            .connections
            .try_send(session_id, ConnectionEvent::Closed { code });
        self.connections.remove(session_id);
        if let Some(session) = self.state.remove_session(session_id) {
            log::info!("session {} closed ({:?})", session_id, session.name());
        }
    }

    /// Peer-initiated termination: the socket is already gone.
    fn drop_session(&mut self, session_id: &SessionId) {
        self.connections.remove(session_id);
        if let Some(session) = self.state.remove_session(session_id) {
            log::info!("session {} disconnected ({:?})", session_id, session.name());
        }
    }

    fn evict_idle(&mut self) {
        for id in self.state.idle_session_ids(self.config.idle_timeout) {
            log::info!(
                "session {}: silent for over {:?}, evicting",
                id,
                self.config.idle_timeout
            );
            self.close_session(&id, CloseCode::Away);
        }
    }

    fn status(&self) -> RelayStatus {
        let mut sessions: Vec<SessionStatus> = self
            .state
            .sessions
            .values()
            .map(|s| SessionStatus {
                id: s.id,
                name: s.name().map(str::to_owned),
                idle_secs: s.idle_for().as_secs(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        RelayStatus {
            active_sessions: self.state.active_count(),
            sessions,
        }
    }
}

pub fn spawn_server(config: Config) -> ServerTx {
    let (srv_tx, mut srv_rx) = channel::<ServerCommand>(16);

    tokio::spawn(async move {
        let mut server = Server::new(config);
        let mut sweep = tokio::time::interval(server.config.sweep_interval);

        loop {
            tokio::select! {
                command = srv_rx.recv() => match command {
                    Some(command) => server.handle_command(command),
                    None => break,
                },
                _ = sweep.tick() => server.evict_idle(),
            }
        }
    });

    srv_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc::Receiver;

    fn server() -> Server {
        Server::new(Config::default())
    }

    fn connect(server: &mut Server, queue: usize) -> (SessionId, Receiver<ConnectionEvent>) {
        let (tx, rx) = channel(queue);
        let (res_tx, mut res_rx) = oneshot::channel();
        server.handle_connection_command(ConnectionCommand::Connect { tx, res_tx });
        let session_id = res_rx
            .try_recv()
            .expect("session id must resolve before the socket starts");
        (session_id, rx)
    }

    fn join(server: &mut Server, from: SessionId, name: &str) {
        server.handle_connection_command(ConnectionCommand::Incoming {
            from,
            message: ClientMessage::Join { name: name.into() },
        });
    }

    fn send(server: &mut Server, from: SessionId, message: ClientMessage) {
        server.handle_connection_command(ConnectionCommand::Incoming { from, message });
    }

    fn draw(color: &str, size: f64) -> ClientMessage {
        ClientMessage::Draw {
            from_x: 0.0,
            from_y: 0.0,
            to_x: 10.0,
            to_y: 10.0,
            color: color.into(),
            size,
        }
    }

    fn recv_relayed(rx: &mut Receiver<ConnectionEvent>) -> Option<ServerMessage> {
        match rx.try_recv() {
            Ok(ConnectionEvent::Relay(message)) => Some(message),
            _ => None,
        }
    }

    #[test]
    fn draw_reaches_the_peer_with_fields_unchanged() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, mut bob_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        send(&mut server, alice, draw("#ff0000", 4.0));

        assert_eq!(
            recv_relayed(&mut bob_rx),
            Some(ServerMessage::Draw {
                from_x: 0.0,
                from_y: 0.0,
                to_x: 10.0,
                to_y: 10.0,
                color: "#ff0000".into(),
                size: 4.0,
            })
        );
        assert!(bob_rx.try_recv().is_err(), "exactly one message expected");
    }

    #[test]
    fn draw_is_not_echoed_to_its_sender() {
        let mut server = server();
        let (alice, mut alice_rx) = connect(&mut server, 8);
        let (bob, mut bob_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        send(&mut server, alice, draw("#00ff00", 2.0));

        assert!(alice_rx.try_recv().is_err());
        assert!(recv_relayed(&mut bob_rx).is_some());
    }

    #[test]
    fn per_sender_order_is_preserved() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 16);
        let (bob, mut bob_rx) = connect(&mut server, 16);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        for i in 1..=5 {
            send(&mut server, alice, draw("#ff0000", i as f64));
        }

        for i in 1..=5 {
            match recv_relayed(&mut bob_rx) {
                Some(ServerMessage::Draw { size, .. }) => assert_eq!(size, i as f64),
                other => panic!("expected draw #{}, got {:?}", i, other),
            }
        }
    }

    #[test]
    fn empty_name_join_is_rejected_and_connection_closed() {
        let mut server = server();
        let (alice, mut alice_rx) = connect(&mut server, 8);

        join(&mut server, alice, "   ");

        assert!(server.state.sessions.is_empty());
        assert!(matches!(
            alice_rx.try_recv(),
            Ok(ConnectionEvent::Closed {
                code: CloseCode::Invalid
            })
        ));
    }

    #[test]
    fn messages_before_join_are_not_relayed() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, mut bob_rx) = connect(&mut server, 8);
        join(&mut server, bob, "Bob");

        send(&mut server, alice, draw("#ff0000", 4.0));
        send(&mut server, alice, ClientMessage::Cursor { x: 1.0, y: 2.0 });
        send(&mut server, alice, ClientMessage::Clear);

        assert!(bob_rx.try_recv().is_err());
        // The silent sender is still connected.
        assert!(server.state.sessions.contains_key(&alice));
    }

    #[test]
    fn join_is_accepted_immediately_after_connect() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);

        // The session id is resolved before the socket starts streaming,
        // so the very first frame a client sends on open may be its join.
        join(&mut server, alice, "Alice");

        assert!(server.state.sessions.get(&alice).unwrap().is_active());
    }

    #[test]
    fn duplicate_join_is_a_noop() {
        let mut server = server();
        let (alice, mut alice_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, alice, "Mallory");

        let session = server.state.sessions.get(&alice).unwrap();
        assert_eq!(session.name(), Some("Alice"));
        assert!(alice_rx.try_recv().is_err(), "no close, no reply");
    }

    #[test]
    fn cursor_fanout_carries_identity_and_updates_presence() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, mut bob_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        send(&mut server, alice, ClientMessage::Cursor { x: 12.0, y: 34.0 });

        assert_eq!(
            recv_relayed(&mut bob_rx),
            Some(ServerMessage::Cursor {
                user_id: alice,
                name: "Alice".into(),
                x: 12.0,
                y: 34.0,
            })
        );
        let session = server.state.sessions.get(&alice).unwrap();
        assert_eq!(session.last_cursor, Some((12.0, 34.0)));
    }

    #[test]
    fn clear_reaches_every_other_session_exactly_once() {
        let mut server = server();
        let (alice, mut alice_rx) = connect(&mut server, 8);
        let (bob, mut bob_rx) = connect(&mut server, 8);
        let (carol, mut carol_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");
        join(&mut server, carol, "Carol");

        send(&mut server, alice, ClientMessage::Clear);

        for rx in [&mut bob_rx, &mut carol_rx].iter_mut() {
            assert_eq!(recv_relayed(rx), Some(ServerMessage::Clear));
            assert!(rx.try_recv().is_err());
        }
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn disconnect_removes_session_from_fanout_immediately() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, mut bob_rx) = connect(&mut server, 8);
        let (carol, mut carol_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");
        join(&mut server, carol, "Carol");

        server.handle_connection_command(ConnectionCommand::Disconnect { from: bob });
        send(&mut server, alice, draw("#ff0000", 4.0));

        assert!(recv_relayed(&mut bob_rx).is_none());
        assert!(recv_relayed(&mut carol_rx).is_some(), "others unaffected");
    }

    #[test]
    fn malformed_draw_is_dropped_and_sender_survives() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, mut bob_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        send(&mut server, alice, draw("not a color!", 4.0));
        assert!(bob_rx.try_recv().is_err());

        // A subsequent valid draw from the same session goes through.
        send(&mut server, alice, draw("#ff0000", 4.0));
        assert!(recv_relayed(&mut bob_rx).is_some());
    }

    #[test]
    fn cursor_update_is_dropped_when_peer_queue_is_full() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, _bob_rx) = connect(&mut server, 1);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        // Fill Bob's queue, then push a cursor update into it.
        send(&mut server, alice, draw("#ff0000", 4.0));
        send(&mut server, alice, ClientMessage::Cursor { x: 1.0, y: 1.0 });

        assert!(
            server.state.sessions.contains_key(&bob),
            "a dropped cursor update must not cost the peer its session"
        );
    }

    #[test]
    fn draw_overflow_disconnects_only_the_slow_peer() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, _bob_rx) = connect(&mut server, 1);
        let (carol, mut carol_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");
        join(&mut server, carol, "Carol");

        send(&mut server, alice, draw("#ff0000", 1.0));
        send(&mut server, alice, draw("#ff0000", 2.0));

        assert!(!server.state.sessions.contains_key(&bob));
        assert!(server.state.sessions.contains_key(&alice));
        assert!(server.state.sessions.contains_key(&carol));
        assert_eq!(
            [recv_relayed(&mut carol_rx), recv_relayed(&mut carol_rx)]
                .iter()
                .filter(|m| m.is_some())
                .count(),
            2
        );
    }

    #[test]
    fn long_draw_burst_is_bounded_by_the_configured_queue_only() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, mut bob_rx) = connect(&mut server, Config::default().outbound_queue);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        // Well past any intermediate buffer a connection uses, but
        // within the configured outbound queue.
        for i in 1..=32 {
            send(&mut server, alice, draw("#ff0000", i as f64));
        }

        assert!(server.state.sessions.contains_key(&bob));
        for i in 1..=32 {
            match recv_relayed(&mut bob_rx) {
                Some(ServerMessage::Draw { size, .. }) => assert_eq!(size, i as f64),
                other => panic!("expected draw #{}, got {:?}", i, other),
            }
        }
    }

    #[test]
    fn gone_receiver_is_treated_as_transport_loss() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (bob, bob_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        drop(bob_rx);
        send(&mut server, alice, draw("#ff0000", 4.0));

        assert!(!server.state.sessions.contains_key(&bob));
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let mut server = server();
        let (alice, mut alice_rx) = connect(&mut server, 8);
        let (bob, _bob_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");
        join(&mut server, bob, "Bob");

        server.state.sessions.get_mut(&alice).unwrap().last_activity =
            Instant::now() - Duration::from_secs(3600);
        server.evict_idle();

        assert!(!server.state.sessions.contains_key(&alice));
        assert!(server.state.sessions.contains_key(&bob));
        assert!(matches!(
            alice_rx.try_recv(),
            Ok(ConnectionEvent::Closed {
                code: CloseCode::Away
            })
        ));
    }

    #[test]
    fn status_reports_joined_and_pending_sessions() {
        let mut server = server();
        let (alice, _alice_rx) = connect(&mut server, 8);
        let (_pending, _pending_rx) = connect(&mut server, 8);
        join(&mut server, alice, "Alice");

        let status = server.status();
        assert_eq!(status.active_sessions, 1);
        assert_eq!(status.sessions.len(), 2);
        assert_eq!(status.sessions[0].name.as_deref(), Some("Alice"));
        assert_eq!(status.sessions[1].name, None);
    }
}
