//! Seams between the call state machine and the media stack.
//!
//! The state machine only ever talks to these traits, so the same logic
//! drives the `webrtc` backend in production and scripted fakes in tests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use parley_shared::protocol::{IceCandidate, SessionDescription};

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No audio input available")]
    NoInput,

    #[error("Audio capture denied: {0}")]
    Denied(String),

    #[error("Audio device error: {0}")]
    Device(String),
}

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    Rtc(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Negotiation channel closed")]
    Closed,
}

/// Connection state of a negotiation channel, as reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ChannelState {
    /// States after which the call cannot continue.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChannelState::Disconnected | ChannelState::Failed | ChannelState::Closed
        )
    }
}

/// Asynchronous notifications raised by an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A locally gathered candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
    StateChanged(ChannelState),
    /// The peer's audio stream is now flowing.
    RemoteTrack,
}

/// Acquired local audio. Must be stopped to release the device.
pub trait LocalCapture: Send + Sync + 'static {
    fn stop(&mut self);
}

/// The peer-to-peer media transport exchanging offers, answers and ICE
/// candidates.
#[async_trait]
pub trait NegotiationChannel: Send + Sync + 'static {
    type Capture: LocalCapture;

    async fn attach_local(&self, capture: &Self::Capture) -> Result<(), NegotiationError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Install a remote offer and return the local answer.
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    type Capture: LocalCapture;
    type Channel: NegotiationChannel<Capture = Self::Capture>;

    async fn acquire_audio(&self) -> Result<Self::Capture, MediaError>;

    /// Build a negotiation channel. Its events are pushed into `events`
    /// until it is closed.
    async fn open_channel(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Self::Channel, NegotiationError>;
}
