//! Event relay: chat messages, ancillary signals and call signaling.
//!
//! The relay never inspects whether a target is online. Delivery goes to
//! whatever connection group currently exists under the target id, which may
//! be empty.

use std::sync::Arc;

use tracing::{debug, error, warn};

use parley_shared::protocol::{
    AnswerReceived, CallInvite, ClientEvent, ErrorCode, HangUpSignal, IceCandidateReceived,
    IceSignal, IncomingCall, OfferReceived, SdpSignal, SendMessage, ServerEvent,
};
use parley_shared::types::{Identity, IdentityId, Message};
use parley_store::Persistence;

use crate::presence::{ConnectionId, Outbox, PresenceRegistry};

/// One live socket as seen by the relay.
pub struct Connection {
    pub id: ConnectionId,
    identity: Option<Identity>,
    outbox: Outbox,
}

impl Connection {
    pub fn new(id: ConnectionId, identity: Option<Identity>, outbox: Outbox) -> Self {
        Self {
            id,
            identity,
            outbox,
        }
    }

    /// The bound identity, or `None` (with a warning) for an unbound socket.
    pub fn identity(&self, event: &str) -> Option<&Identity> {
        if self.identity.is_none() {
            warn!(connection = %self.id, event, "Event on unbound connection ignored");
        }
        self.identity.as_ref()
    }

    /// Queue an event for this connection only.
    pub fn reply(&self, event: ServerEvent) {
        if self.outbox.send(event).is_err() {
            debug!(connection = %self.id, "Reply dropped, writer gone");
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    registry: Arc<PresenceRegistry>,
    store: Arc<dyn Persistence>,
}

impl Relay {
    pub fn new(registry: Arc<PresenceRegistry>, store: Arc<dyn Persistence>) -> Self {
        Self { registry, store }
    }

    /// Handle one inbound event. Events are processed in arrival order per
    /// connection; callers await this before reading the next frame.
    pub async fn handle(&self, conn: &Connection, event: ClientEvent) {
        let name = event.name();
        let Some(identity) = conn.identity(name) else {
            return;
        };
        let me = identity.id.clone();

        match event {
            ClientEvent::Message(request) => self.relay_message(conn, me, request).await,
            ClientEvent::Typing(receiver) => {
                let delivered = self
                    .registry
                    .send_to_except(&receiver, Some(conn.id), &ServerEvent::Typing(me.clone()))
                    .await;
                debug!(from = %me, to = %receiver, delivered, "Relayed typing");
            }
            ClientEvent::Seen(sender) => self.mark_seen(sender, me),
            ClientEvent::CallUser(CallInvite {
                recipient_id,
                caller_name,
            }) => {
                let event = ServerEvent::IncomingCall(IncomingCall {
                    from: me.clone(),
                    caller_name,
                });
                self.forward(name, &me, &recipient_id, event).await;
            }
            ClientEvent::Offer(SdpSignal { sdp, target }) => {
                let event = ServerEvent::Offer(OfferReceived {
                    sdp,
                    caller: me.clone(),
                });
                self.forward(name, &me, &target, event).await;
            }
            ClientEvent::Answer(SdpSignal { sdp, target }) => {
                let event = ServerEvent::Answer(AnswerReceived {
                    sdp,
                    callee: me.clone(),
                });
                self.forward(name, &me, &target, event).await;
            }
            ClientEvent::IceCandidate(IceSignal { candidate, target }) => {
                let event = ServerEvent::IceCandidate(IceCandidateReceived {
                    candidate,
                    from: me.clone(),
                });
                self.forward(name, &me, &target, event).await;
            }
            ClientEvent::HangUp(HangUpSignal { target }) => {
                self.forward(name, &me, &target, ServerEvent::HangUp {}).await;
            }
        }
    }

    async fn relay_message(&self, conn: &Connection, sender: IdentityId, request: SendMessage) {
        if let Err(e) = request.validate() {
            warn!(connection = %conn.id, from = %sender, error = %e, "Rejected message");
            conn.reply(ServerEvent::Error(ErrorCode::BadRequest));
            return;
        }

        let receiver = request.receiver;
        let message = Message::new(sender.clone(), receiver.clone(), request.content);

        // Persistence is best-effort and never delays delivery.
        let store = self.store.clone();
        let record = message.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.create_message(&record) {
                error!(message_id = %record.id, error = %e, "Failed to persist message");
            }
        });

        let event = ServerEvent::Message(message);
        let mut delivered = self
            .registry
            .send_to_except(&receiver, Some(conn.id), &event)
            .await;
        if receiver != sender {
            delivered += self
                .registry
                .send_to_except(&sender, Some(conn.id), &event)
                .await;
        }
        debug!(from = %sender, to = %receiver, delivered, "Relayed message");
    }

    fn mark_seen(&self, sender: IdentityId, receiver: IdentityId) {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || match store.mark_seen(&sender, &receiver) {
            Ok(updated) => debug!(sender = %sender, receiver = %receiver, updated, "Marked seen"),
            Err(e) => error!(sender = %sender, receiver = %receiver, error = %e, "Failed to mark seen"),
        });
    }

    async fn forward(&self, name: &str, from: &IdentityId, target: &IdentityId, event: ServerEvent) {
        let delivered = self.registry.send_to(target, &event).await;
        debug!(event = name, from = %from, to = %target, delivered, "Relayed call signal");
    }
}
