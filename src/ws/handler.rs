use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::models::ErrorResponse;
use crate::services::auth_service::{resolve_socket_identity, AuthIdentity};
use crate::ws::connection::{ClientConnection, InboundEvent, Outbound, CLOSE_POLICY_VIOLATION};
use crate::ws::room::room_key;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CollabQuery {
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

/// WebSocket endpoint for one page version.
pub async fn collab_ws_handler(
    Path((page_id, version)): Path<(String, i32)>,
    Query(query): Query<CollabQuery>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match resolve_socket_identity(
        &state.auth,
        &headers,
        query.token.as_deref(),
        query.user_id.as_deref(),
        query.user_name.as_deref(),
    ) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejecting collaboration socket for {}:{}: {}", page_id, version, e);
            let status = StatusCode::UNAUTHORIZED;
            return (
                status,
                Json(ErrorResponse {
                    code: status.as_u16(),
                    status: status.to_string(),
                    error: e,
                }),
            )
                .into_response();
        }
    };

    info!("New collaboration socket from {} for {}:{}", addr, page_id, version);
    ws.on_upgrade(move |socket| handle_socket(socket, state, page_id, version, identity, addr))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    page_id: String,
    version: i32,
    identity: AuthIdentity,
    addr: SocketAddr,
) {
    let (mut sender, receiver) = socket.split();
    let (connection, mut outbound) = ClientConnection::new();
    let connection = Arc::new(connection);

    // Drains the connection queue into the socket. Ends once every sender is gone.
    let writer = {
        let connection = Arc::downgrade(&connection);
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let (message, last) = match frame {
                    Outbound::Binary(bytes) => (Message::Binary(bytes), false),
                    Outbound::Close { code, reason } => (
                        Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };
                if sender.send(message).await.is_err() || last {
                    break;
                }
            }
            if let Some(connection) = connection.upgrade() {
                connection.mark_closed();
            }
        })
    };

    let coordination = state.registry.context().coordination.clone();
    let max_connections = state.registry.context().settings.max_connections_per_source;
    let key = room_key(&page_id, version);
    let source = addr.ip().to_string();

    let counted = match coordination.increment_connection(&key, &source).await {
        Ok(count) if count > max_connections => {
            warn!("Too many connections from {} to {} ({})", source, key, count);
            if let Err(e) = coordination.decrement_connection(&key, &source).await {
                warn!("Failed to release connection slot for {}: {}", source, e);
            }
            connection.close(CLOSE_POLICY_VIOLATION, "too many connections");
            drop(connection);
            finish_writer(writer).await;
            return;
        }
        Ok(_) => true,
        Err(e) => {
            warn!("Connection limit unavailable for {}: {}", key, e);
            false
        }
    };

    let events = Box::pin(receiver.filter_map(|message| async move {
        match message {
            Ok(Message::Binary(bytes)) => Some(InboundEvent::Message(bytes)),
            Ok(Message::Close(_)) => Some(InboundEvent::Close),
            Ok(_) => None,
            Err(e) => Some(InboundEvent::Error(e.to_string())),
        }
    }));

    let mut user_info = Map::new();
    if let Some(name) = &identity.name {
        user_info.insert("name".to_string(), Value::String(name.clone()));
    }

    state
        .registry
        .handle_connection(connection.clone(), &page_id, version, &identity.subject, user_info, events)
        .await;

    if counted {
        if let Err(e) = coordination.decrement_connection(&key, &source).await {
            warn!("Failed to release connection slot for {}: {}", source, e);
        }
    }
    drop(connection);
    finish_writer(writer).await;
    debug!("Collaboration socket for {} from {} terminated", key, addr);
}

async fn finish_writer(writer: tokio::task::JoinHandle<()>) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        abort.abort();
    }
}
