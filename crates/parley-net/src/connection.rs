//! Relay connection with tokio mpsc command/notification pattern.
//!
//! The socket runs in a dedicated tokio task. External code talks to it
//! through a typed event sender and a notification receiver, so the rest of
//! the client never touches frames.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use parley_shared::constants::{SOCKET_PATH, TOKEN_QUERY_PARAM};
use parley_shared::protocol::{ClientEvent, ServerEvent};

/// Capacity of both the command and the notification channel.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Credential token rejected")]
    Unauthorized,

    #[error("Handshake failed with HTTP {0}")]
    Rejected(u16),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    Socket(#[from] tungstenite::Error),
}

/// Notifications sent *from* the connection task to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionNotification {
    Connected,
    Event(ServerEvent),
    Disconnected { reason: String },
}

/// `ws://host:port` plus the handshake path and the form-encoded token.
pub fn socket_url(base: &str, token: &str) -> Result<String, ConnectError> {
    let mut url = Url::parse(base)?;
    let path = format!("{}{SOCKET_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair(TOKEN_QUERY_PARAM, token);
    Ok(url.into())
}

/// Open the socket and spawn its event loop.
///
/// Returns `(event_tx, notification_rx)`. Dropping `event_tx` closes the
/// socket; `Disconnected` is always the last notification.
pub async fn spawn_connection(
    base_url: &str,
    token: &str,
) -> Result<
    (
        mpsc::Sender<ClientEvent>,
        mpsc::Receiver<ConnectionNotification>,
    ),
    ConnectError,
> {
    let (socket, _) = connect_async(socket_url(base_url, token)?)
        .await
        .map_err(|e| match e {
            tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
                ConnectError::Unauthorized
            }
            tungstenite::Error::Http(response) => {
                ConnectError::Rejected(response.status().as_u16())
            }
            other => ConnectError::Socket(other),
        })?;

    info!(url = base_url, "Connected to relay");

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientEvent>(CHANNEL_CAPACITY);
    let (notif_tx, notif_rx) = mpsc::channel::<ConnectionNotification>(CHANNEL_CAPACITY);
    let _ = notif_tx.send(ConnectionNotification::Connected).await;

    tokio::spawn(async move {
        let (mut sink, mut stream) = socket.split();

        let reason = loop {
            tokio::select! {
                // --- Outgoing events ---
                cmd = cmd_rx.recv() => {
                    let Some(event) = cmd else {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break "closed locally".to_string();
                    };
                    let frame = match event.to_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(event = event.name(), error = %e, "Failed to encode event");
                            continue;
                        }
                    };
                    debug!(event = event.name(), "Sending event");
                    if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                        break e.to_string();
                    }
                }

                // --- Incoming frames ---
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_frame(&text) {
                            Ok(event) => {
                                if notif_tx.send(ConnectionNotification::Event(event)).await.is_err() {
                                    let _ = sink.send(WsMessage::Close(None)).await;
                                    break "notification receiver dropped".to_string();
                                }
                            }
                            Err(e) => warn!(error = %e, "Undecodable server frame"),
                        },
                        Some(Ok(WsMessage::Close(close))) => {
                            break close
                                .map(|c| c.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "connection reset".to_string(),
                    }
                }
            }
        };

        info!(reason = %reason, "Relay connection ended");
        let _ = notif_tx
            .send(ConnectionNotification::Disconnected { reason })
            .await;
    });

    Ok((cmd_tx, notif_rx))
}
