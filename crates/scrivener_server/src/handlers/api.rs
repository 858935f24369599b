use super::error_response;
use crate::sync::SessionManager;
use axum::{
    Router,
    extract::{Path, State},
    response::{IntoResponse, Json},
    routing::get,
};
use scrivener_core::VersionId;
use scrivener_core::ownership::OwnershipRecord;
use serde::Serialize;
use std::sync::Arc;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SessionManager>,
}

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub membership_version: u64,
    pub members: Vec<String>,
    pub active_connections: usize,
    pub active_sessions: usize,
}

/// Where a document lives
#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    #[serde(flatten)]
    pub record: OwnershipRecord,
    pub addr: String,
}

/// Live session state, present when this node is serving the document
#[derive(Debug, Serialize)]
pub struct LiveSession {
    pub seq: u64,
    pub version: VersionId,
    pub clients: usize,
}

/// Document info response
#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub doc_id: String,
    pub current_version: VersionId,
    pub owner_hint: Option<String>,
    pub owner: ResolveResponse,
    pub live: Option<LiveSession>,
}

/// Create API routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/documents/{doc_id}", get(get_document))
        .with_state(state)
}

/// GET /api/status - Get node status
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.manager.stats().await;
    let snapshot = state.manager.directory().snapshot();

    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.manager.node_id().to_string(),
        membership_version: snapshot.version,
        members: snapshot.nodes.keys().cloned().collect(),
        active_connections: stats.active_connections,
        active_sessions: stats.active_sessions,
    })
}

/// GET /resolve/:doc_id - Owner of a document
pub async fn resolve_document(
    State(state): State<ApiState>,
    Path(doc_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.directory().resolve_with_addr(&doc_id) {
        Ok((record, node)) => Json(ResolveResponse {
            record,
            addr: node.addr,
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/documents/:doc_id - Version pointer, owner and live state
async fn get_document(
    State(state): State<ApiState>,
    Path(doc_id): Path<String>,
) -> impl IntoResponse {
    let (record, node) = match state.manager.directory().resolve_with_addr(&doc_id) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let meta = match state.manager.stores().metadata.document(&doc_id) {
        Ok(meta) => meta,
        Err(e) => return error_response(&e),
    };

    let live = match state.manager.get(&doc_id).await {
        Some(session) if !session.is_closed() => Some(LiveSession {
            seq: session.seq().await,
            version: session.version().await,
            clients: session.client_count(),
        }),
        _ => None,
    };

    Json(DocumentResponse {
        doc_id,
        current_version: meta
            .as_ref()
            .map(|m| m.current_version)
            .unwrap_or(VersionId::GENESIS),
        owner_hint: meta.and_then(|m| m.owner_hint),
        owner: ResolveResponse {
            record,
            addr: node.addr,
        },
        live,
    })
    .into_response()
}
