#![doc = include_str!("../README.md")]

//! Scrivener Server
//!
//! One node of a collaborative editing cluster.
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 4040)
//! - `NODE_ID`: Cluster-unique node id (default: random UUID)
//! - `ADVERTISE_ADDR`: `host:port` other nodes redirect clients to
//! - `DATABASE_PATH`: Path to the shared SQLite database (default: ./scrivener.db)
//! - `VIRTUAL_NODES`: Hash ring tokens per node (default: 64)
//! - `WINDOW_SIZE`: Operations kept for transforming late edits (default: 256)
//! - `HEARTBEAT_INTERVAL_SECS`: Heartbeat period (default: 2)
//! - `HEARTBEAT_TIMEOUT_SECS`: Silence before a node is expired (default: 10)
//! - `RETIRED_GRACE_SECS`: Delay before retired versions are deleted (default: 300)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins

pub mod cluster;
pub mod config;
pub mod handlers;
pub mod sync;

pub use config::Config;

use axum::{Router, routing::get};
use handlers::{
    api::{ApiState, resolve_document},
    api_routes,
    ws::WsState,
    ws_handler,
};
use std::sync::Arc;
use sync::SessionManager;

/// Build the HTTP routes of a node
pub fn router(manager: Arc<SessionManager>) -> Router {
    let ws_state = WsState {
        manager: manager.clone(),
    };
    let api_state = ApiState { manager };

    Router::new()
        // Health check
        .route("/", get(|| async { "Scrivener Server" }))
        .route("/health", get(|| async { "OK" }))
        // Ownership lookup
        .route(
            "/resolve/{doc_id}",
            get(resolve_document).with_state(api_state.clone()),
        )
        // WebSocket sync endpoint
        .route("/sync", get(ws_handler).with_state(ws_state))
        // API routes
        .nest("/api", api_routes(api_state))
}
