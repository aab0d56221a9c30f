//! End-to-end tests: a real server on an ephemeral port driven by
//! `tokio-tungstenite` clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use parley_server::{serve_on, AppState, ServerConfig, TokenAuthenticator};
use parley_shared::protocol::{
    AnswerReceived, CallInvite, ClientEvent, ErrorCode, IncomingCall, SdpSignal, SendMessage,
    ServerEvent, SessionDescription,
};
use parley_shared::types::{Identity, IdentityId, Message, Presence};
use parley_store::{Database, NewUser, Persistence, SharedDatabase, StoreError};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: [u8; 32] = [42u8; 32];
const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: std::net::SocketAddr,
    tokens: TokenAuthenticator,
    store: Arc<dyn Persistence>,
}

impl TestServer {
    async fn start(store: Arc<dyn Persistence>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let authenticator = Arc::new(TokenAuthenticator::new(SECRET, store.clone()));
        let state = AppState::new(ServerConfig::default(), store.clone(), authenticator);
        tokio::spawn(serve_on(state, listener));
        Self {
            addr,
            tokens: TokenAuthenticator::new(SECRET, store.clone()),
            store,
        }
    }

    fn url(&self, token: &str) -> String {
        format!("ws://{}/socket?token={token}", self.addr)
    }

    async fn connect(&self, name: &str) -> Ws {
        let token = self
            .tokens
            .issue(&IdentityId::from(name), Duration::from_secs(60));
        let (ws, _) = connect_async(self.url(&token)).await.unwrap();
        ws
    }
}

fn identity(name: &str) -> Identity {
    Identity {
        id: IdentityId::from(name),
        username: name.to_string(),
        name: format!("{name} (test)"),
        avatar: None,
        about: None,
    }
}

fn seeded_database() -> Database {
    let db = Database::open_in_memory().unwrap();
    for name in ["alice", "bob"] {
        db.insert_user(&NewUser::new(identity(name), "hash")).unwrap();
    }
    db
}

async fn send(ws: &mut Ws, event: ClientEvent) {
    ws.send(WsMessage::Text(event.to_frame().unwrap()))
        .await
        .unwrap();
}

/// Next server event, or `None` once the server closed the socket.
async fn next_event(ws: &mut Ws) -> Option<ServerEvent> {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame {
            Ok(WsMessage::Text(text)) => return Some(ServerEvent::from_frame(&text).unwrap()),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Skip presence chatter and return the next other event.
async fn next_non_status(ws: &mut Ws) -> ServerEvent {
    loop {
        match next_event(ws).await {
            Some(ServerEvent::UserStatus(_)) => continue,
            Some(event) => return event,
            None => panic!("socket closed"),
        }
    }
}

/// Next presence change for `who`.
async fn next_status_of(ws: &mut Ws, who: &str) -> Presence {
    loop {
        if let Some(ServerEvent::UserStatus(change)) = next_event(ws).await {
            if let Some(presence) = change.get(&IdentityId::from(who)) {
                return *presence;
            }
        }
    }
}

#[tokio::test]
async fn message_flows_between_two_identities() {
    let server = TestServer::start(Arc::new(SharedDatabase::new(seeded_database()))).await;

    let mut alice = server.connect("alice").await;
    let ServerEvent::Data(data) = next_non_status(&mut alice).await else {
        panic!("expected initial data");
    };
    assert_eq!(data.user.id.as_str(), "alice");
    assert_eq!(data.contacts.len(), 1);

    let mut bob = server.connect("bob").await;
    assert!(matches!(next_non_status(&mut bob).await, ServerEvent::Data(_)));
    assert_eq!(next_status_of(&mut alice, "bob").await, Presence::Online);

    send(
        &mut alice,
        ClientEvent::Message(SendMessage {
            receiver: "bob".into(),
            content: "hi".into(),
        }),
    )
    .await;

    let ServerEvent::Message(received) = next_non_status(&mut bob).await else {
        panic!("expected message");
    };
    assert_eq!(received.sender.as_str(), "alice");
    assert_eq!(received.receiver.as_str(), "bob");
    assert_eq!(received.content, "hi");
    assert!(!received.seen);

    // The write is asynchronous; it lands shortly after delivery.
    let bob_id = IdentityId::from("bob");
    let mut stored = Vec::new();
    for _ in 0..50 {
        stored = server.store.find_messages_for(&bob_id).unwrap();
        if !stored.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored, vec![received]);
}

#[tokio::test]
async fn presence_is_announced_on_first_connect_and_last_disconnect() {
    let server = TestServer::start(Arc::new(SharedDatabase::new(seeded_database()))).await;

    let mut alice = server.connect("alice").await;
    assert!(matches!(next_non_status(&mut alice).await, ServerEvent::Data(_)));

    let mut bob_1 = server.connect("bob").await;
    assert_eq!(next_status_of(&mut alice, "bob").await, Presence::Online);
    let mut bob_2 = server.connect("bob").await;
    assert!(matches!(next_non_status(&mut bob_2).await, ServerEvent::Data(ref d)
        if d.presence.get(&IdentityId::from("bob")) == Some(&Presence::Online)));

    bob_1.close(None).await.unwrap();
    bob_2.close(None).await.unwrap();

    // Neither the second connect nor the first close produced an announcement.
    let presence = next_status_of(&mut alice, "bob").await;
    assert!(matches!(presence, Presence::LastSeen(_)));
}

#[tokio::test]
async fn call_signals_reach_the_target() {
    let server = TestServer::start(Arc::new(SharedDatabase::new(seeded_database()))).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    assert!(matches!(next_non_status(&mut alice).await, ServerEvent::Data(_)));
    assert!(matches!(next_non_status(&mut bob).await, ServerEvent::Data(_)));

    send(
        &mut alice,
        ClientEvent::CallUser(CallInvite {
            recipient_id: "bob".into(),
            caller_name: "Alice".into(),
        }),
    )
    .await;
    assert_eq!(
        next_non_status(&mut bob).await,
        ServerEvent::IncomingCall(IncomingCall {
            from: "alice".into(),
            caller_name: "Alice".into(),
        })
    );

    send(
        &mut bob,
        ClientEvent::Answer(SdpSignal {
            sdp: SessionDescription::answer("v=0"),
            target: "alice".into(),
        }),
    )
    .await;
    assert_eq!(
        next_non_status(&mut alice).await,
        ServerEvent::Answer(AnswerReceived {
            sdp: SessionDescription::answer("v=0"),
            callee: "bob".into(),
        })
    );
}

#[tokio::test]
async fn bad_token_fails_the_handshake() {
    let server = TestServer::start(Arc::new(SharedDatabase::new(seeded_database()))).await;

    let forged = format!("alice.{}.{}", i64::MAX, "00".repeat(32));
    match connect_async(server.url(&forged)).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }

    // A token for an identity that does not exist is rejected the same way.
    let ghost = server
        .tokens
        .issue(&IdentityId::from("ghost"), Duration::from_secs(60));
    assert!(connect_async(server.url(&ghost)).await.is_err());
}

#[tokio::test]
async fn undecodable_frame_is_answered_and_connection_survives() {
    let server = TestServer::start(Arc::new(SharedDatabase::new(seeded_database()))).await;
    let mut alice = server.connect("alice").await;
    assert!(matches!(next_non_status(&mut alice).await, ServerEvent::Data(_)));

    alice
        .send(WsMessage::Text(r#"{"event":"shout","data":1}"#.into()))
        .await
        .unwrap();
    assert_eq!(
        next_non_status(&mut alice).await,
        ServerEvent::Error(ErrorCode::BadRequest)
    );

    send(&mut alice, ClientEvent::Typing("alice".into())).await;
    send(
        &mut alice,
        ClientEvent::Message(SendMessage {
            receiver: "bob".into(),
            content: String::new(),
        }),
    )
    .await;
    assert_eq!(
        next_non_status(&mut alice).await,
        ServerEvent::Error(ErrorCode::BadRequest)
    );
}

/// Identities resolve but message history cannot be read.
struct HistoryUnavailable(SharedDatabase);

impl Persistence for HistoryUnavailable {
    fn create_message(&self, message: &Message) -> Result<(), StoreError> {
        self.0.create_message(message)
    }

    fn find_messages_for(&self, _: &IdentityId) -> Result<Vec<Message>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn mark_seen(&self, sender: &IdentityId, receiver: &IdentityId) -> Result<usize, StoreError> {
        self.0.mark_seen(sender, receiver)
    }

    fn list_other_identities(&self, excluding: &IdentityId) -> Result<Vec<Identity>, StoreError> {
        self.0.list_other_identities(excluding)
    }

    fn find_identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        self.0.find_identity(id)
    }
}

#[tokio::test]
async fn failed_initial_sync_closes_the_connection() {
    let store = HistoryUnavailable(SharedDatabase::new(seeded_database()));
    let server = TestServer::start(Arc::new(store)).await;

    let mut alice = server.connect("alice").await;
    assert_eq!(
        next_non_status(&mut alice).await,
        ServerEvent::Error(ErrorCode::SyncFailed)
    );
    loop {
        match next_event(&mut alice).await {
            Some(ServerEvent::UserStatus(_)) => continue,
            Some(other) => panic!("unexpected event after sync failure: {other:?}"),
            None => break,
        }
    }
}
