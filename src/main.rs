mod agent_types;
mod config;
mod coordinator;
mod error;
mod handlers;
mod store;
mod tasks;
mod timer;
mod twilio;
mod twilio_types;
mod types;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::store::{PgStore, QueueStore};
use crate::twilio::TwilioClient;
use crate::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("dialer_rs", tracing_subscriber::filter::LevelFilter::DEBUG),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let config = Config::from_env().expect("incomplete configuration");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url())
        .await
        .expect("failed to connect to database");
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let store: Arc<dyn QueueStore> = Arc::new(PgStore::new(pool));
    let http_client = reqwest::Client::new();
    let telephony = Arc::new(TwilioClient::new(&config, http_client.clone()));

    let (coordinator_tx, coordinator_rx) = mpsc::channel(32);
    let coordinator = Coordinator::new(
        telephony,
        store.clone(),
        config.policy.clone(),
        coordinator_tx.clone(),
    );
    tokio::spawn(coordinator.run(coordinator_rx));

    let bind_addr = config.bind_addr;
    let app_state = Arc::new(AppState {
        config,
        coordinator: coordinator_tx,
        store,
        http_client,
    });

    let app = Router::new()
        .route("/outbound-call", post(handlers::outbound_call))
        .route("/call-status", post(handlers::call_status))
        .route("/outbound-call-twiml", post(handlers::outbound_call_twiml))
        .route("/outbound-media-stream", get(handlers::ws_handler))
        .route("/register/call", post(handlers::register_call))
        .route("/endCall", post(handlers::end_call))
        .with_state(app_state);

    info!(%bind_addr, "starting server");
    axum::Server::bind(&bind_addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}
