//! [`MediaBackend`] on top of the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use parley_shared::protocol::{IceCandidate, SdpKind, SessionDescription};

use crate::audio::{AudioConfig, AudioInput, AudioOutput, AudioSink};
use crate::backend::{
    ChannelEvent, ChannelState, LocalCapture, MediaBackend, MediaError, NegotiationChannel,
    NegotiationError,
};

fn rtc_error(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Rtc(e.to_string())
}

pub struct RtcBackend {
    api: API,
    input: Arc<dyn AudioInput>,
    output: Option<Arc<dyn AudioOutput>>,
    audio: AudioConfig,
}

impl RtcBackend {
    pub fn new(input: Arc<dyn AudioInput>) -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(rtc_error)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media).map_err(rtc_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            input,
            output: None,
            audio: AudioConfig::default(),
        })
    }

    /// Microphone in, speaker out.
    #[cfg(feature = "device-audio")]
    pub fn with_devices() -> Result<Self, NegotiationError> {
        use crate::device::{DeviceInput, DeviceOutput};

        Ok(Self::new(Arc::new(DeviceInput::default()))?
            .with_output(Arc::new(DeviceOutput::default())))
    }

    /// Play remote audio through `output`. Without one the remote track is
    /// read and discarded.
    pub fn with_output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }
}

#[async_trait]
impl MediaBackend for RtcBackend {
    type Capture = RtcCapture;
    type Channel = RtcChannel;

    async fn acquire_audio(&self) -> Result<RtcCapture, MediaError> {
        let mut source = self.input.open()?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: self.audio.sample_rate,
                channels: self.audio.channels,
                ..Default::default()
            },
            "audio".to_owned(),
            "parley".to_owned(),
        ));

        let frame_duration = self.audio.frame_duration();
        let feeder_track = track.clone();
        let feeder = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_duration);
            loop {
                ticker.tick().await;
                let Some(data) = source.next_frame() else {
                    debug!("Audio source exhausted");
                    break;
                };
                let sample = Sample {
                    data,
                    duration: frame_duration,
                    ..Default::default()
                };
                if let Err(e) = feeder_track.write_sample(&sample).await {
                    warn!(error = %e, "Failed to write audio sample");
                    break;
                }
            }
        });

        info!("Audio capture started");
        Ok(RtcCapture {
            track,
            feeder: Some(feeder),
        })
    }

    async fn open_channel(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<RtcChannel, NegotiationError> {
        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(rtc_error)?);

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = candidates.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = from_rtc_candidate(init);
                        let _ = candidates.send(ChannelEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let states = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let states = states.clone();
            Box::pin(async move {
                if let Some(state) = channel_state(state) {
                    let _ = states.send(ChannelEvent::StateChanged(state));
                }
            })
        }));

        let tracks = events;
        let output = self.output.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tracks = tracks.clone();
                let output = output.clone();
                Box::pin(async move {
                    debug!(kind = %track.kind(), "Remote track started");
                    let _ = tracks.send(ChannelEvent::RemoteTrack);
                    tokio::spawn(play_remote(track, output));
                })
            },
        ));

        Ok(RtcChannel { pc })
    }
}

pub struct RtcCapture {
    track: Arc<TrackLocalStaticSample>,
    feeder: Option<JoinHandle<()>>,
}

impl LocalCapture for RtcCapture {
    fn stop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
            info!("Audio capture stopped");
        }
    }
}

impl Drop for RtcCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct RtcChannel {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl NegotiationChannel for RtcChannel {
    type Capture = RtcCapture;

    async fn attach_local(&self, capture: &RtcCapture) -> Result<(), NegotiationError> {
        let track: Arc<dyn TrackLocal + Send + Sync> = capture.track.clone();
        let sender = self.pc.add_track(track).await.map_err(rtc_error)?;

        // RTCP must be read for interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::InvalidDescription(format!(
                "expected an offer, got {:?}",
                offer.kind
            )));
        }
        self.pc
            .set_remote_description(to_rtc_description(offer)?)
            .await
            .map_err(rtc_error)?;
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc_description(answer)?)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(rtc_error)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Failed to close peer connection");
        }
    }
}

/// Feed the remote track into the speaker, or just drain it.
async fn play_remote(track: Arc<TrackRemote>, output: Option<Arc<dyn AudioOutput>>) {
    let mut sink: Option<Box<dyn AudioSink>> = match output {
        Some(output) => match tokio::task::spawn_blocking(move || output.open()).await {
            Ok(Ok(sink)) => Some(sink),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to open audio output");
                None
            }
            Err(e) => {
                warn!(error = %e, "Audio output task failed");
                None
            }
        },
        None => None,
    };

    while let Ok((packet, _)) = track.read_rtp().await {
        if let Some(sink) = sink.as_mut() {
            sink.play(&packet.payload);
        }
    }
    debug!("Remote track ended");
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(NegotiationError::InvalidDescription(
                "rollback is not supported".into(),
            ))
        }
    };
    result.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn channel_state(state: RTCPeerConnectionState) -> Option<ChannelState> {
    Some(match state {
        RTCPeerConnectionState::New => ChannelState::New,
        RTCPeerConnectionState::Connecting => ChannelState::Connecting,
        RTCPeerConnectionState::Connected => ChannelState::Connected,
        RTCPeerConnectionState::Disconnected => ChannelState::Disconnected,
        RTCPeerConnectionState::Failed => ChannelState::Failed,
        RTCPeerConnectionState::Closed => ChannelState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SilenceInput;

    fn backend() -> RtcBackend {
        RtcBackend::new(Arc::new(SilenceInput)).unwrap()
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_backends() {
        let (caller_backend, callee_backend) = (backend(), backend());
        let (caller_events, _caller_rx) = mpsc::unbounded_channel();
        let (callee_events, _callee_rx) = mpsc::unbounded_channel();

        let caller = caller_backend.open_channel(&[], caller_events).await.unwrap();
        let callee = callee_backend.open_channel(&[], callee_events).await.unwrap();

        let mut caller_capture = caller_backend.acquire_audio().await.unwrap();
        let mut callee_capture = callee_backend.acquire_audio().await.unwrap();
        caller.attach_local(&caller_capture).await.unwrap();
        callee.attach_local(&callee_capture).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.to_lowercase().contains("opus"));

        let answer = callee.accept_offer(offer).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        caller.apply_answer(answer).await.unwrap();

        caller_capture.stop();
        callee_capture.stop();
        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_answer_is_not_accepted_as_offer() {
        let backend = backend();
        let (events, _rx) = mpsc::unbounded_channel();
        let channel = backend.open_channel(&[], events).await.unwrap();

        let result = channel
            .accept_offer(SessionDescription::answer("v=0"))
            .await;
        assert!(matches!(result, Err(NegotiationError::InvalidDescription(_))));
        channel.close().await;
    }

    #[test]
    fn test_rollback_has_no_rtc_description() {
        let desc = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(desc).is_err());
    }
}
