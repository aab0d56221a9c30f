//! Voice calls for Parley clients: the call state machine and the media
//! stack it drives.

pub mod audio;
pub mod backend;
pub mod call;
#[cfg(feature = "device-audio")]
pub mod device;
pub mod rtc;

pub use audio::{
    AudioConfig, AudioInput, AudioOutput, AudioSink, AudioSource, PcmFramer, SilenceInput,
};
pub use backend::{
    ChannelEvent, ChannelState, LocalCapture, MediaBackend, MediaError, NegotiationChannel,
    NegotiationError,
};
pub use call::{CallAgent, CallError, CallHandle, CallNotice, CallState};
pub use rtc::RtcBackend;

#[cfg(feature = "device-audio")]
pub use device::{DeviceInput, DeviceOutput};
