use super::{error_response, redirect_response};
use crate::sync::{ClientConnection, Connect, JoinedState, SessionManager};
use axum::{
    extract::{
        OriginalUri, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use scrivener_core::ScrivenerError;
use scrivener_core::protocol::{ClientMessage, ServerMessage};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Document id
    pub doc: String,
    /// Editing user; retries are deduplicated per user
    pub user: String,
}

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub manager: Arc<SessionManager>,
}

/// WebSocket upgrade handler
///
/// Clients of documents owned elsewhere get a `307` to the owner.
pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    OriginalUri(uri): OriginalUri,
    ws: WebSocketUpgrade,
) -> Response {
    if query.doc.trim().is_empty() || query.user.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "doc and user are required").into_response();
    }

    let client_id = uuid::Uuid::new_v4().to_string();
    let connect = state
        .manager
        .connect(&query.doc, &client_id, &query.user)
        .await;

    match connect {
        Ok(Connect::Local { connection, joined }) => {
            info!(
                "WebSocket upgrade: user={}, doc={}, client={}",
                query.user, query.doc, client_id
            );
            // A failed upgrade drops the connection, which leaves the session
            ws.on_upgrade(move |socket| handle_socket(socket, connection, joined))
        }
        Ok(Connect::Redirect { record, node }) => {
            debug!(
                "Redirecting {} to owner {} (epoch {})",
                query.doc, record.node_id, record.epoch
            );
            let path = uri
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/sync");
            redirect_response(&format!("http://{}{}", node.addr, path))
        }
        Err(e) => {
            warn!("WebSocket connection to {} refused: {}", query.doc, e);
            error_response(&e)
        }
    }
}

async fn send(
    ws_tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    let json = match msg.to_json() {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode message: {}", e);
            return false;
        }
    };
    if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
        debug!("Failed to send message: {}", e);
        return false;
    }
    true
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, mut connection: ClientConnection, joined: JoinedState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Send initial state
    if !send(&mut ws_tx, &joined.into()).await {
        connection.disconnect().await;
        return;
    }

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        let msg = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                let err = ScrivenerError::MalformedOp(e.to_string());
                                let reply = ServerMessage::Error {
                                    client_op_id: None,
                                    error: err.to_serializable(),
                                };
                                if !send(&mut ws_tx, &reply).await {
                                    break;
                                }
                                continue;
                            }
                        };
                        if matches!(msg, ClientMessage::Leave) {
                            debug!("Client {} left", connection.client_id);
                            break;
                        }
                        let mut ok = true;
                        for reply in connection.handle_message(msg).await {
                            if !send(&mut ws_tx, &reply).await {
                                ok = false;
                                break;
                            }
                        }
                        if !ok {
                            break;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client requested close");
                        break;
                    }
                    Err(e) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Handle session events
            event = connection.recv_event() => {
                let Some(msg) = event else { break };
                let redirect = matches!(msg, ServerMessage::Redirect { .. });
                if !send(&mut ws_tx, &msg).await || redirect {
                    break;
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    info!(
        "WebSocket disconnected: user={}, doc={}",
        connection.user_id,
        connection.doc_id()
    );
    connection.disconnect().await;
}
