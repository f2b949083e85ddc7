use actix_web::{web, HttpResponse, Responder};
use tokio::sync::oneshot;

use crate::server::{ServerCommand, ServerTx};

/// Read-only snapshot of the relay: active session count plus a line
/// per session. Queried over a oneshot channel so the relay loop stays
/// the only task that ever touches the session table.
pub async fn status_handler(srv_tx: web::Data<ServerTx>) -> impl Responder {
    let (tx, rx) = oneshot::channel();
    let mut srv_tx = srv_tx.get_ref().clone();

    if srv_tx.send(ServerCommand::Status { tx }).await.is_err() {
        return HttpResponse::ServiceUnavailable().finish();
    }
    match rx.await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(_) => HttpResponse::ServiceUnavailable().finish(),
    }
}
