//! Local view of the conversation: contacts, history, presence and the
//! typing indicator.
//!
//! Mutators return the events the server should hear about; sending them is
//! the caller's job.

use std::time::{Duration, Instant};

use tracing::debug;

use parley_shared::constants::TYPING_INDICATOR_SECS;
use parley_shared::protocol::{ClientEvent, InitialData, SendMessage};
use parley_shared::types::{Identity, IdentityId, Message, Presence, PresenceSnapshot};
use parley_shared::ProtocolError;

const TYPING_TTL: Duration = Duration::from_secs(TYPING_INDICATOR_SECS);

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub identity: Identity,
    /// Unknown until the first presence snapshot mentions the contact.
    pub status: Option<Presence>,
}

#[derive(Debug, Default)]
pub struct ChatState {
    user: Option<Identity>,
    contacts: Vec<Contact>,
    messages: Vec<Message>,
    active: Option<IdentityId>,
    typing: Option<(IdentityId, Instant)>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a fresh initial sync.
    pub fn on_data(&mut self, data: InitialData) {
        debug!(
            user = %data.user.id,
            contacts = data.contacts.len(),
            messages = data.messages.len(),
            "Chat state synced"
        );
        self.active = data.contacts.first().map(|c| c.id.clone());
        self.contacts = data
            .contacts
            .into_iter()
            .map(|identity| Contact {
                identity,
                status: None,
            })
            .collect();
        self.messages = data.messages;
        self.user = Some(data.user);
        self.typing = None;
        self.on_user_status(&data.presence);
    }

    /// Record an inbound message. A message from the open conversation is
    /// marked seen at once and the returned `seen` event should be sent.
    pub fn on_message(&mut self, mut message: Message) -> Option<ClientEvent> {
        let mut ack = None;
        if self.active.as_ref() == Some(&message.sender) {
            self.typing = None;
            message.seen = true;
            ack = Some(ClientEvent::Seen(message.sender.clone()));
        }
        // A message relayed just before the sync can also be in its history.
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(known) => known.seen |= message.seen,
            None => self.messages.push(message),
        }
        ack
    }

    /// Merge a presence change. Identities that are not contacts are ignored.
    pub fn on_user_status(&mut self, snapshot: &PresenceSnapshot) {
        for contact in &mut self.contacts {
            if let Some(presence) = snapshot.get(&contact.identity.id) {
                contact.status = Some(*presence);
            }
        }
    }

    /// Show the typing indicator for `sender` if it is the open conversation.
    /// Returns whether the indicator changed.
    pub fn on_typing(&mut self, sender: IdentityId, now: Instant) -> bool {
        if self.active.as_ref() != Some(&sender) {
            return false;
        }
        self.typing = Some((sender, now));
        true
    }

    /// Who is typing in the open conversation, if the indicator is still live.
    pub fn typing(&self, now: Instant) -> Option<&IdentityId> {
        self.typing
            .as_ref()
            .filter(|(_, since)| now.saturating_duration_since(*since) < TYPING_TTL)
            .map(|(who, _)| who)
    }

    /// Append an outgoing message locally and build the event that sends it.
    /// Without an open conversation or a synced user nothing happens.
    pub fn send_message(
        &mut self,
        content: impl Into<String>,
    ) -> Result<Option<ClientEvent>, ProtocolError> {
        let (Some(user), Some(receiver)) = (&self.user, &self.active) else {
            return Ok(None);
        };
        let request = SendMessage {
            receiver: receiver.clone(),
            content: content.into(),
        };
        request.validate()?;

        self.messages.push(Message::new(
            user.id.clone(),
            request.receiver.clone(),
            request.content.clone(),
        ));
        Ok(Some(ClientEvent::Message(request)))
    }

    pub fn send_typing(&self) -> Option<ClientEvent> {
        self.active.clone().map(ClientEvent::Typing)
    }

    /// Open the conversation with `contact`, marking its messages seen.
    pub fn select_contact(&mut self, contact: IdentityId) -> ClientEvent {
        for message in &mut self.messages {
            if message.sender == contact {
                message.seen = true;
            }
        }
        if self.active.as_ref() != Some(&contact) {
            self.typing = None;
        }
        self.active = Some(contact.clone());
        ClientEvent::Seen(contact)
    }

    pub fn user(&self) -> Option<&Identity> {
        self.user.as_ref()
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn contact(&self, id: &IdentityId) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.identity.id == id)
    }

    pub fn active_contact(&self) -> Option<&IdentityId> {
        self.active.as_ref()
    }

    /// The conversation with `contact`, oldest first.
    pub fn conversation(&self, contact: &IdentityId) -> impl Iterator<Item = &Message> + '_ {
        let contact = contact.clone();
        self.messages.iter().filter(move |m| m.involves(&contact))
    }

    pub fn unseen_from(&self, contact: &IdentityId) -> usize {
        self.messages
            .iter()
            .filter(|m| &m.sender == contact && !m.seen)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn identity(name: &str) -> Identity {
        Identity {
            id: name.into(),
            username: name.to_string(),
            name: name.to_uppercase(),
            avatar: None,
            about: None,
        }
    }

    fn synced() -> ChatState {
        let mut presence = PresenceSnapshot::new();
        presence.insert("bob".into(), Presence::Online);
        presence.insert("mallory".into(), Presence::Online);

        let mut state = ChatState::new();
        state.on_data(InitialData {
            user: identity("me"),
            contacts: vec![identity("bob"), identity("carol")],
            messages: vec![Message::new("carol".into(), "me".into(), "hey".into())],
            presence,
        });
        state
    }

    #[test]
    fn test_sync_selects_first_contact_and_applies_presence() {
        let state = synced();
        assert_eq!(state.user().unwrap().id.as_str(), "me");
        assert_eq!(state.active_contact().unwrap().as_str(), "bob");
        assert_eq!(
            state.contact(&"bob".into()).unwrap().status,
            Some(Presence::Online)
        );
        assert_eq!(state.contact(&"carol".into()).unwrap().status, None);
        assert_eq!(state.contacts().len(), 2);
    }

    #[test]
    fn test_message_from_active_contact_is_seen() {
        let mut state = synced();
        let now = Instant::now();
        assert!(state.on_typing("bob".into(), now));

        let ack = state.on_message(Message::new("bob".into(), "me".into(), "hi".into()));
        assert_eq!(ack, Some(ClientEvent::Seen("bob".into())));
        assert!(state.typing(now).is_none());
        assert_eq!(state.unseen_from(&"bob".into()), 0);

        let ack = state.on_message(Message::new("carol".into(), "me".into(), "yo".into()));
        assert_eq!(ack, None);
        assert_eq!(state.unseen_from(&"carol".into()), 2);
    }

    #[test]
    fn test_typing_only_for_active_contact_and_expires() {
        let mut state = synced();
        let now = Instant::now();

        assert!(!state.on_typing("carol".into(), now));
        assert!(state.typing(now).is_none());

        assert!(state.on_typing("bob".into(), now));
        assert_eq!(
            state.typing(now + Duration::from_secs(2)).map(IdentityId::as_str),
            Some("bob")
        );
        assert!(state.typing(now + Duration::from_secs(3)).is_none());
    }

    #[test]
    fn test_send_message_appends_locally() {
        let mut state = synced();
        let event = state.send_message("hello").unwrap().unwrap();
        assert_eq!(
            event,
            ClientEvent::Message(SendMessage {
                receiver: "bob".into(),
                content: "hello".into(),
            })
        );
        let local: Vec<_> = state.conversation(&"bob".into()).collect();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].sender.as_str(), "me");

        assert!(matches!(
            state.send_message(""),
            Err(ProtocolError::EmptyContent)
        ));
        assert_eq!(state.conversation(&"bob".into()).count(), 1);
    }

    #[test]
    fn test_conversation_accepts_temporary_ids() {
        let state = synced();
        let history: Vec<&Message> = state.conversation(&IdentityId::from("carol")).collect();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hey");
    }

    #[test]
    fn test_message_already_in_history_is_not_duplicated() {
        let mut state = synced();
        let message = Message::new("bob".into(), "me".into(), "early".into());
        state.on_message(message.clone());
        state.on_message(message);
        assert_eq!(state.conversation(&"bob".into()).count(), 1);
    }

    #[test]
    fn test_nothing_to_send_without_a_conversation() {
        let mut state = ChatState::new();
        assert_eq!(state.send_message("hello").unwrap(), None);
        assert_eq!(state.send_typing(), None);
    }

    #[test]
    fn test_select_contact_marks_history_seen() {
        let mut state = synced();
        assert_eq!(state.unseen_from(&"carol".into()), 1);

        let event = state.select_contact("carol".into());
        assert_eq!(event, ClientEvent::Seen("carol".into()));
        assert_eq!(state.unseen_from(&"carol".into()), 0);
        assert_eq!(state.send_typing(), Some(ClientEvent::Typing("carol".into())));
    }

    #[test]
    fn test_status_merge_keeps_unmentioned_contacts() {
        let mut state = synced();
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let mut change = PresenceSnapshot::new();
        change.insert("bob".into(), Presence::LastSeen(at));
        state.on_user_status(&change);

        assert_eq!(
            state.contact(&"bob".into()).unwrap().status,
            Some(Presence::LastSeen(at))
        );
        assert_eq!(state.contact(&"carol".into()).unwrap().status, None);
    }
}
