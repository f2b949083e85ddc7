use actix_web::{web, App, HttpServer};

use whiteboard_server::config::Config;
use whiteboard_server::connection::ws_index;
use whiteboard_server::handlers::status_handler;
use whiteboard_server::server::spawn_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr();
    let srv_tx = spawn_server(config.clone());

    log::info!("whiteboard relay listening on {}", bind_addr);
    HttpServer::new(move || {
        App::new()
            .data(srv_tx.clone())
            .data(config.clone())
            .route("/ws/", web::get().to(ws_index))
            .route("/status/", web::get().to(status_handler))
    })
    .bind(&bind_addr)?
    .run()
    .await
}
