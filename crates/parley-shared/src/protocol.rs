//! Real-time wire protocol.
//!
//! Every WebSocket text frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Event names are the compatibility contract between clients and the relay,
//! so each variant pins its name explicitly.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_CONTENT_SIZE;
use crate::error::ProtocolError;
use crate::types::{Identity, IdentityId, Message, PresenceSnapshot};

// ---------------------------------------------------------------------------
// Negotiation payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP blob in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub receiver: IdentityId,
    pub content: String,
}

impl SendMessage {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.content.trim().is_empty() {
            return Err(ProtocolError::EmptyContent);
        }
        if self.content.len() > MAX_CONTENT_SIZE {
            return Err(ProtocolError::ContentTooLarge {
                size: self.content.len(),
                max: MAX_CONTENT_SIZE,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvite {
    pub recipient_id: IdentityId,
    pub caller_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpSignal {
    pub sdp: SessionDescription,
    pub target: IdentityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceSignal {
    pub candidate: IceCandidate,
    pub target: IdentityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangUpSignal {
    pub target: IdentityId,
}

/// Events a client may send. Transport close stands in for `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Message(SendMessage),
    /// Receiver id
    Typing(IdentityId),
    /// Sender id whose messages the caller has now seen
    Seen(IdentityId),
    CallUser(CallInvite),
    Offer(SdpSignal),
    Answer(SdpSignal),
    IceCandidate(IceSignal),
    HangUp(HangUpSignal),
}

impl ClientEvent {
    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Message(_) => "message",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::Seen(_) => "seen",
            ClientEvent::CallUser(_) => "callUser",
            ClientEvent::Offer(_) => "offer",
            ClientEvent::Answer(_) => "answer",
            ClientEvent::IceCandidate(_) => "iceCandidate",
            ClientEvent::HangUp(_) => "hangUp",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Everything a freshly connected client needs, pushed once after connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialData {
    pub user: Identity,
    pub contacts: Vec<Identity>,
    pub messages: Vec<Message>,
    pub presence: PresenceSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub from: IdentityId,
    pub caller_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferReceived {
    pub sdp: SessionDescription,
    pub caller: IdentityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerReceived {
    pub sdp: SessionDescription,
    pub callee: IdentityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateReceived {
    pub candidate: IceCandidate,
    pub from: IdentityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Credential rejected or connection unbound.
    AuthError,
    /// Frame could not be decoded or failed validation.
    BadRequest,
    /// Initial sync could not be assembled; the connection is closed.
    SyncFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Data(InitialData),
    Message(Message),
    /// Sender id
    Typing(IdentityId),
    #[serde(rename = "user_status")]
    UserStatus(PresenceSnapshot),
    IncomingCall(IncomingCall),
    Offer(OfferReceived),
    Answer(AnswerReceived),
    IceCandidate(IceCandidateReceived),
    HangUp {},
    Error(ErrorCode),
}

impl ServerEvent {
    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Data(_) => "data",
            ServerEvent::Message(_) => "message",
            ServerEvent::Typing(_) => "typing",
            ServerEvent::UserStatus(_) => "user_status",
            ServerEvent::IncomingCall(_) => "incomingCall",
            ServerEvent::Offer(_) => "offer",
            ServerEvent::Answer(_) => "answer",
            ServerEvent::IceCandidate(_) => "iceCandidate",
            ServerEvent::HangUp {} => "hangUp",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Split off the call-signaling events, handing everything else back.
    pub fn into_call_signal(self) -> Result<CallSignal, ServerEvent> {
        match self {
            ServerEvent::IncomingCall(IncomingCall { from, caller_name }) => {
                Ok(CallSignal::IncomingCall { from, caller_name })
            }
            ServerEvent::Offer(OfferReceived { sdp, caller }) => {
                Ok(CallSignal::Offer { sdp, caller })
            }
            ServerEvent::Answer(AnswerReceived { sdp, callee }) => {
                Ok(CallSignal::Answer { sdp, callee })
            }
            ServerEvent::IceCandidate(IceCandidateReceived { candidate, from }) => {
                Ok(CallSignal::IceCandidate { candidate, from })
            }
            ServerEvent::HangUp {} => Ok(CallSignal::HangUp),
            other => Err(other),
        }
    }
}

/// Inbound call-control events as seen by a client's call state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSignal {
    IncomingCall {
        from: IdentityId,
        caller_name: String,
    },
    Offer {
        sdp: SessionDescription,
        caller: IdentityId,
    },
    Answer {
        sdp: SessionDescription,
        callee: IdentityId,
    },
    IceCandidate {
        candidate: IceCandidate,
        from: IdentityId,
    },
    HangUp,
}
