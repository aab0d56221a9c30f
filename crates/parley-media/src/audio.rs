//! Local audio input and remote audio output.
//!
//! Devices sit behind [`AudioInput`] and [`AudioOutput`] so the call path can
//! run on machines without a sound card. Frames are Opus packets of
//! `AudioConfig::frame_size_ms` each. Sound card support lives in
//! `device` behind the `device-audio` feature.

use bytes::Bytes;
use tracing::debug;

use crate::backend::MediaError;

/// Opus "silence" packet (TOC byte for 20ms CELT plus an empty frame).
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size_ms: 20,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }

    pub fn frame_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(u64::from(self.frame_size_ms))
    }
}

/// An open capture producing encoded frames.
pub trait AudioSource: Send + 'static {
    /// Next encoded frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Option<Bytes>;
}

/// Something that can open an [`AudioSource`], such as a microphone.
pub trait AudioInput: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn AudioSource>, MediaError>;
}

/// An open playback stream fed with encoded frames from the peer.
pub trait AudioSink: Send + 'static {
    fn play(&mut self, packet: &[u8]);
}

/// Something that can open an [`AudioSink`], such as a speaker.
pub trait AudioOutput: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn AudioSink>, MediaError>;
}

/// Cuts an arbitrary run of PCM samples into fixed-size frames.
#[derive(Debug)]
pub struct PcmFramer {
    frame_size: usize,
    buffer: Vec<f32>,
}

impl PcmFramer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            buffer: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Append `samples` and hand every completed frame to `emit`.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        self.buffer.extend_from_slice(samples);
        while self.buffer.len() >= self.frame_size {
            emit(self.buffer.drain(..self.frame_size).collect());
        }
    }

    /// Samples waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// An input that always opens and only ever produces silence.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilenceInput;

impl AudioInput for SilenceInput {
    fn open(&self) -> Result<Box<dyn AudioSource>, MediaError> {
        debug!("Opening silent audio input");
        Ok(Box::new(SilenceSource))
    }
}

#[derive(Debug, Default)]
pub struct SilenceSource;

impl AudioSource for SilenceSource {
    fn next_frame(&mut self) -> Option<Bytes> {
        Some(Bytes::from_static(&OPUS_SILENCE_FRAME))
    }
}
