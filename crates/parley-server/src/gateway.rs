//! WebSocket gateway: handshake, per-connection read loop and writer task.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_shared::constants::MAX_FRAME_SIZE;
use parley_shared::protocol::{ClientEvent, ErrorCode, ServerEvent};
use parley_shared::types::Identity;

use crate::api::AppState;
use crate::auth::AuthError;
use crate::error::ServerError;
use crate::relay::Connection;
use crate::sync::initial_payload;

#[derive(Debug, Deserialize)]
pub struct HandshakeParams {
    token: Option<String>,
}

/// `GET /socket?token=...`
///
/// The token is resolved before the upgrade; an unresolvable token answers
/// 401 and the socket is never opened.
pub async fn socket_handler(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    upgrade: Option<WebSocketUpgrade>,
) -> Result<Response, ServerError> {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;

    let authenticator = state.authenticator.clone();
    let identity = tokio::task::spawn_blocking(move || authenticator.resolve_identity(&token))
        .await?
        .map_err(|e| {
            warn!(error = %e, "Rejected socket handshake");
            e
        })?;

    let Some(upgrade) = upgrade else {
        return Err(ServerError::BadRequest("WebSocket upgrade required".into()));
    };

    info!(identity = %identity.id, "Socket handshake accepted");
    Ok(upgrade
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| run_connection(socket, state, identity)))
}

async fn run_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut queue) = mpsc::unbounded_channel::<ServerEvent>();

    let connection_id = state.registry.mark_online(&identity.id, outbox.clone()).await;

    // Sole writer for this socket; drains until every outbox handle is gone.
    let writer = tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            let frame = match event.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;
    });

    let conn = Connection::new(connection_id, Some(identity.clone()), outbox);

    match initial_payload(&state.store, &state.registry, &identity).await {
        Ok(data) => {
            conn.reply(data);
            read_loop(&state, &conn, &mut stream).await;
        }
        Err(e) => {
            error!(
                identity = %identity.id,
                connection = %connection_id,
                error = %e,
                "Initial sync failed, closing connection"
            );
            conn.reply(ServerEvent::Error(e.code()));
        }
    }

    state
        .registry
        .mark_offline_if_last_connection(&identity.id, connection_id)
        .await;
    drop(conn);
    let _ = writer.await;

    info!(identity = %identity.id, connection = %connection_id, "Connection closed");
}

async fn read_loop(state: &AppState, conn: &Connection, stream: &mut SplitStream<WebSocket>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match ClientEvent::from_frame(&text) {
                Ok(event) => state.relay.handle(conn, event).await,
                Err(e) => {
                    warn!(connection = %conn.id, error = %e, "Undecodable frame");
                    conn.reply(ServerEvent::Error(ErrorCode::BadRequest));
                }
            },
            Ok(WsMessage::Binary(_)) => {
                warn!(connection = %conn.id, "Binary frame rejected");
                conn.reply(ServerEvent::Error(ErrorCode::BadRequest));
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %conn.id, error = %e, "Socket read failed");
                break;
            }
        }
    }
}
