use actix_web::{web, App, HttpServer};
use ledger_core::config::Settings;
use ledger_http::app_state::AppState;
use ledger_http::realtime::route::ws_client;
use ledger_http::webhook_routes::{broker_cancel, broker_fill};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env();
    let bind_addr = settings.bind_addr.clone();
    let app_state = web::Data::new(AppState::new(settings));

    tracing::info!(%bind_addr, "starting ledger server");

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .service(broker_fill)
            .service(broker_cancel)
            .service(ws_client)
    })
    .bind(&bind_addr)?
    .run()
    .await
}
