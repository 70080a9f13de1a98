//! GridCode Arena: realtime code-judging server.

mod config;
mod error;
mod executor;
mod handlers;
mod protocol;
mod scorer;
mod session;
mod shape;
mod state;
mod store;

use axum::{
    response::{Html, Json},
    routing::get,
    Router,
};
use config::Config;
use session::room::{Room, RoomSettings};
use state::AppState;
use std::sync::Arc;
use store::Store;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // Logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Store::new(config.data_dir.clone());
    let state = Arc::new(AppState::new(config, store));

    // Stored room settings win over environment defaults.
    let settings = match state.store.load_settings().await {
        Ok(Some(settings)) => {
            tracing::info!(name = %settings.name, "using stored room settings");
            settings
        }
        Ok(None) => default_settings(&state.config),
        Err(e) => {
            tracing::warn!(error = %e, "could not read stored settings, using defaults");
            default_settings(&state.config)
        }
    };
    let room_id = state.config.room.id.clone();
    let handle = handlers::spawn_room(state.clone(), Room::new(room_id.clone(), settings));
    state.rooms.insert(room_id.clone(), handle);

    // CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Routes
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(handlers::ws_handler))
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

    tracing::info!("🚀 GridCode Arena server started");
    tracing::info!("Address: {}", addr);
    tracing::info!("WebSocket: ws://{}/ws", addr);
    tracing::info!(room_id = %room_id, "room ready");

    axum::serve(listener, app).await.unwrap();
}

fn default_settings(config: &Config) -> RoomSettings {
    RoomSettings {
        name: config.room.name.clone(),
        capacity: config.room.capacity,
        min_players_to_start: config.room.min_players_to_start,
        round_duration_ms: config.room.round_duration_ms,
        welcome_message: config.room.welcome_message.clone(),
    }
}

async fn index_handler() -> Html<&'static str> {
    Html("<h1>GridCode Arena</h1><p>WebSocket endpoint: /ws</p>")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "server": "gridcode-arena-rs",
        "timestamp": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }))
}
