//! HTTP and WebSocket front end for the workflow engine.
//!
//! ```text
//! ┌──────────┐  HTTP   ┌───────────────────────────────────────────────┐
//! │  Client  │ ──────> │ mod.rs   (build_router, start_server)         │
//! │          │ <────── │   ├─ api.rs      (REST handlers, AppState)    │
//! └──────────┘   WS    │   ├─ ws.rs       (per-thread event stream)    │
//!                      │   └─ sessions.rs (session rows from outcomes) │
//!                      │            │                                  │
//!                      │            v                                  │
//!                      │   workflow::Engine ──> SqliteCheckpointStore  │
//!                      └───────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod sessions;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::FoundryConfig;
use crate::db::{DbHandle, FoundryDb, SqliteCheckpointStore};
use crate::llm::TextGenerator;
use crate::stages::{Drafter, standard_stages};
use crate::workflow::Engine;

pub use api::{AppState, SharedState};

/// Bind address and CORS policy for `serve`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_config(config: &FoundryConfig) -> Self {
        let server = &config.toml.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            cors_origins: server.cors_origins.clone(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Open the database and wire an engine over it.
pub fn open_state(config: &FoundryConfig, generator: Arc<dyn TextGenerator>) -> Result<SharedState> {
    let path = config.database_path();
    let db = DbHandle::new(
        FoundryDb::new(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?,
    );
    let workflow = config.workflow();
    let drafter = Drafter::new(generator.clone(), workflow.generation_timeout())
        .with_temperature(config.toml.llm.temperature);
    let stages = standard_stages(generator, workflow).with(Arc::new(drafter));
    let engine = Engine::new(
        Arc::new(SqliteCheckpointStore::new(db.clone())),
        stages,
        workflow,
    )?;
    Ok(Arc::new(AppState { engine, db }))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the full application router: REST API plus the event stream.
pub fn build_router(state: SharedState, cors_origins: &[String]) -> Router {
    api::api_router()
        .route("/ws/stream/{thread_id}", get(ws::stream_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Serve until Ctrl+C.
pub async fn start_server(state: SharedState, config: ServerConfig) -> Result<()> {
    sessions::reconcile(&state.db, &state.engine)
        .await
        .context("Failed to reconcile sessions")?;

    let app = build_router(state, &config.cors_origins);
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "server listening");
    println!("Foundry running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
