//! Client session: one relay connection feeding the chat state and the
//! call machine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_media::{CallAgent, CallError, CallHandle, CallNotice, MediaBackend};
use parley_net::{spawn_connection, ConnectError, ConnectionNotification};
use parley_shared::protocol::{ClientEvent, ErrorCode, InitialData, ServerEvent};
use parley_shared::types::{IdentityId, Message, PresenceSnapshot};
use parley_shared::ProtocolError;

use crate::chat::ChatState;

/// How long `connect` waits for the initial sync.
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Credential token rejected")]
    AuthRejected,

    #[error("Server could not load the initial state")]
    SyncFailed,

    #[error("Timed out waiting for the initial state")]
    SyncTimeout,

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Invalid request: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Connect(ConnectError),
}

impl From<ConnectError> for ClientError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Unauthorized => ClientError::AuthRejected,
            other => ClientError::Connect(other),
        }
    }
}

/// What the user interface hears from a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    Synced,
    MessageReceived(Message),
    PresenceChanged(PresenceSnapshot),
    Typing(IdentityId),
    Call(CallNotice),
    AuthRejected,
    RequestRejected(ErrorCode),
    Disconnected { reason: String },
}

pub struct Client<B: MediaBackend> {
    chat: Arc<Mutex<ChatState>>,
    events: mpsc::Sender<ClientEvent>,
    calls: CallHandle<B>,
}

impl<B: MediaBackend> Clone for Client<B> {
    fn clone(&self) -> Self {
        Self {
            chat: self.chat.clone(),
            events: self.events.clone(),
            calls: self.calls.clone(),
        }
    }
}

impl<B: MediaBackend> Client<B> {
    /// Connect to the relay at `base_url` and wait for the initial sync.
    pub async fn connect(
        base_url: &str,
        token: &str,
        backend: Arc<B>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientNotice>), ClientError> {
        let (events, mut transport) = spawn_connection(base_url, token).await?;

        let synced = tokio::time::timeout(SYNC_TIMEOUT, wait_for_sync(&mut transport))
            .await
            .map_err(|_| ClientError::SyncTimeout)??;

        Ok(Self::start(synced, events, transport, backend))
    }

    /// Build a session from an already synced transport and start
    /// dispatching, beginning with the events that preceded the sync.
    pub fn start(
        synced: Synced,
        events: mpsc::Sender<ClientEvent>,
        transport: mpsc::Receiver<ConnectionNotification>,
        backend: Arc<B>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientNotice>) {
        let Synced { data, backlog } = synced;
        let (calls, call_notices) =
            CallAgent::spawn(data.user.id.clone(), backend, events.clone());

        let mut chat = ChatState::new();
        chat.on_data(data);

        let client = Self {
            chat: Arc::new(Mutex::new(chat)),
            events,
            calls,
        };

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let _ = notices_tx.send(ClientNotice::Synced);
        tokio::spawn(
            client
                .clone()
                .run(backlog, transport, call_notices, notices_tx),
        );

        (client, notices_rx)
    }

    /// Dispatch transport notifications and call notices until the
    /// connection ends.
    async fn run(
        self,
        backlog: Vec<ServerEvent>,
        mut transport: mpsc::Receiver<ConnectionNotification>,
        mut call_notices: mpsc::UnboundedReceiver<CallNotice>,
        notices: mpsc::UnboundedSender<ClientNotice>,
    ) {
        for event in backlog {
            self.dispatch(event, &notices).await;
        }

        let reason = loop {
            tokio::select! {
                notification = transport.recv() => match notification {
                    Some(ConnectionNotification::Event(event)) => {
                        self.dispatch(event, &notices).await;
                    }
                    Some(ConnectionNotification::Connected) => {}
                    Some(ConnectionNotification::Disconnected { reason }) => break reason,
                    None => break "transport stopped".to_string(),
                },
                Some(notice) = call_notices.recv() => {
                    let _ = notices.send(ClientNotice::Call(notice));
                }
            }
        };

        info!(reason = %reason, "Client session ended");
        self.calls.end_call();
        let _ = notices.send(ClientNotice::Disconnected { reason });
    }

    async fn dispatch(&self, event: ServerEvent, notices: &mpsc::UnboundedSender<ClientNotice>) {
        let event = match event.into_call_signal() {
            Ok(signal) => {
                self.calls.handle_signal(signal);
                return;
            }
            Err(event) => event,
        };

        match event {
            ServerEvent::Data(data) => {
                self.chat().on_data(data);
                let _ = notices.send(ClientNotice::Synced);
            }
            ServerEvent::Message(message) => {
                let ack = self.chat().on_message(message.clone());
                if let Some(ack) = ack {
                    self.send(ack).await;
                }
                let _ = notices.send(ClientNotice::MessageReceived(message));
            }
            ServerEvent::Typing(sender) => {
                let shown = self.chat().on_typing(sender.clone(), Instant::now());
                if shown {
                    let _ = notices.send(ClientNotice::Typing(sender));
                }
            }
            ServerEvent::UserStatus(change) => {
                self.chat().on_user_status(&change);
                let _ = notices.send(ClientNotice::PresenceChanged(change));
            }
            ServerEvent::Error(ErrorCode::AuthError) => {
                warn!("Server rejected our credentials");
                let _ = notices.send(ClientNotice::AuthRejected);
            }
            ServerEvent::Error(code) => {
                warn!(?code, "Server rejected a request");
                let _ = notices.send(ClientNotice::RequestRejected(code));
            }
            other => debug!(event = other.name(), "Unhandled server event"),
        }
    }

    pub async fn send_message(&self, content: impl Into<String>) -> Result<(), ClientError> {
        let event = self.chat().send_message(content)?;
        match event {
            Some(event) => self.try_send(event).await,
            None => Ok(()),
        }
    }

    pub async fn send_typing(&self) -> Result<(), ClientError> {
        let event = self.chat().send_typing();
        match event {
            Some(event) => self.try_send(event).await,
            None => Ok(()),
        }
    }

    pub async fn select_contact(&self, contact: IdentityId) -> Result<(), ClientError> {
        let event = self.chat().select_contact(contact);
        self.try_send(event).await
    }

    /// Ring the open conversation's contact.
    pub async fn call_active_contact(&self) -> Result<(), ClientError> {
        let (peer, caller_name) = {
            let chat = self.chat();
            let Some(peer) = chat.active_contact().cloned() else {
                return Ok(());
            };
            let caller_name = chat
                .user()
                .map(|u| u.username.clone())
                .unwrap_or_else(|| "Unknown Caller".to_string());
            (peer, caller_name)
        };
        Ok(self.calls.initiate_call(peer, caller_name).await?)
    }

    pub fn calls(&self) -> &CallHandle<B> {
        &self.calls
    }

    /// Read the chat state.
    pub fn with_chat<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.chat())
    }

    fn chat(&self) -> MutexGuard<'_, ChatState> {
        self.chat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, event: ClientEvent) {
        if let Err(e) = self.try_send(event).await {
            warn!(error = %e, "Failed to send event");
        }
    }

    async fn try_send(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ClientError::Disconnected("transport stopped".to_string()))
    }
}

/// The initial sync plus every event the relay delivered ahead of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Synced {
    pub data: InitialData,
    pub backlog: Vec<ServerEvent>,
}

impl From<InitialData> for Synced {
    fn from(data: InitialData) -> Self {
        Self {
            data,
            backlog: Vec::new(),
        }
    }
}

/// Read frames until the initial sync arrives. The connection joins its
/// group before the sync is sent, so messages and call signals can come
/// first; they are held for replay.
pub async fn wait_for_sync(
    transport: &mut mpsc::Receiver<ConnectionNotification>,
) -> Result<Synced, ClientError> {
    let mut backlog = Vec::new();
    while let Some(notification) = transport.recv().await {
        match notification {
            ConnectionNotification::Event(ServerEvent::Data(data)) => {
                if !backlog.is_empty() {
                    debug!(held = backlog.len(), "Replaying events received before sync");
                }
                return Ok(Synced { data, backlog });
            }
            ConnectionNotification::Event(ServerEvent::Error(ErrorCode::AuthError)) => {
                return Err(ClientError::AuthRejected)
            }
            ConnectionNotification::Event(ServerEvent::Error(ErrorCode::SyncFailed)) => {
                return Err(ClientError::SyncFailed)
            }
            ConnectionNotification::Disconnected { reason } => {
                return Err(ClientError::Disconnected(reason))
            }
            ConnectionNotification::Event(event) => backlog.push(event),
            ConnectionNotification::Connected => {}
        }
    }
    Err(ClientError::Disconnected("transport stopped".to_string()))
}
