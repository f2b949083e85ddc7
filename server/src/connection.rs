use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use actix_web_actors::ws::{CloseCode, CloseReason};
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;

use whiteboard_protocol::{ClientMessage, ServerMessage, SessionId};

use crate::config::Config;
use crate::connection_tx_storage::ConnectionTx;
use crate::server::ServerTx;

/// What a connection asks of the relay loop.
#[derive(Debug)]
pub enum ConnectionCommand {
    Connect {
        tx: ConnectionTx,
        res_tx: oneshot::Sender<SessionId>,
    },
    Incoming {
        from: SessionId,
        message: ClientMessage,
    },
    Disconnect {
        from: SessionId,
    },
}

/// What the relay loop pushes back to a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Relay(ServerMessage),
    Closed { code: CloseCode },
}

#[derive(Message)]
#[rtype(result = "()")]
struct ConnectionActorMessage(ConnectionEvent);

/// One WebSocket connection. Its session id is resolved in `ws_index`
/// before the actor starts, so the first frame off the socket — the
/// client sends `join` immediately on open — can never race an
/// identity handshake.
struct ConnectionActor {
    session_id: SessionId,
    srv_tx: ServerTx,
    rx: Option<Receiver<ConnectionEvent>>,
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => {
                ctx.stop();
                return;
            }
        };
        let addr = ctx.address().recipient();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Await mailbox room rather than bailing on a full
                // mailbox: the actor's pace then shows up as a full
                // `rx` queue, which is where the relay applies its
                // per-kind overflow policy.
                if addr.send(ConnectionActorMessage(event)).await.is_err() {
                    return;
                }
            }
            // The relay dropped our sender: it has already forgotten this
            // session, so close the socket from this side too.
            let _ = addr
                .send(ConnectionActorMessage(ConnectionEvent::Closed {
                    code: CloseCode::Normal,
                }))
                .await;
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        let _ = self.srv_tx.try_send(
            ConnectionCommand::Disconnect {
                from: self.session_id,
            }
            .into(),
        );

        Running::Stop
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Text(text)) => {
                let from = self.session_id;
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Unknown) => {
                        // Tolerated for protocol evolution; deliberately silent.
                        log::debug!("session {}: unknown message type dropped", from);
                    }
                    Ok(message) => {
                        log::debug!("session {}: ingress {}", from, message.kind());
                        if self
                            .srv_tx
                            .try_send(ConnectionCommand::Incoming { from, message }.into())
                            .is_err()
                        {
                            log::warn!("session {}: relay loop unavailable; closing", from);
                            ctx.stop();
                        }
                    }
                    Err(err) => {
                        // A malformed frame must not end the session.
                        log::warn!("session {}: unparseable frame dropped: {}", from, err);
                    }
                }
            }
            Ok(ws::Message::Close(_)) => {
                ctx.stop();
            }
            Ok(_) => (),
            Err(err) => {
                log::warn!("websocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Egress
impl Handler<ConnectionActorMessage> for ConnectionActor {
    type Result = ();

    fn handle(
        &mut self,
        msg: ConnectionActorMessage,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Self::Result {
        match msg.0 {
            ConnectionEvent::Relay(message) => match serde_json::to_string(&message) {
                Ok(text) => ctx.text(text),
                Err(err) => log::error!("failed to serialize {}: {}", message.kind(), err),
            },
            ConnectionEvent::Closed { code } => {
                ctx.close(Some(CloseReason {
                    code,
                    description: None,
                }));
                ctx.stop();
            }
        }
    }
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    srv_tx: web::Data<ServerTx>,
    config: web::Data<Config>,
) -> Result<HttpResponse, Error> {
    let (tx, rx) = tokio::sync::mpsc::channel(config.outbound_queue);
    let (res_tx, res_rx) = oneshot::channel();

    let mut srv_tx = srv_tx.get_ref().clone();
    if srv_tx
        .send(ConnectionCommand::Connect { tx, res_tx }.into())
        .await
        .is_err()
    {
        return Ok(HttpResponse::ServiceUnavailable().finish());
    }
    let session_id = match res_rx.await {
        Ok(session_id) => session_id,
        Err(_) => return Ok(HttpResponse::ServiceUnavailable().finish()),
    };

    ws::start(
        ConnectionActor {
            session_id,
            srv_tx,
            rx: Some(rx),
        },
        &req,
        stream,
    )
}
