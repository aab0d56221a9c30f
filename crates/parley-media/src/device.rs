//! Sound card capture and playback through `cpal`, Opus coded with
//! `audiopus`.
//!
//! Each stream runs on its own thread, since `cpal::Stream` may not leave the
//! thread that built it. Dropping the source or sink stops the thread.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::thread;

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info, warn};

use crate::audio::{
    AudioConfig, AudioInput, AudioOutput, AudioSink, AudioSource, PcmFramer, OPUS_SILENCE_FRAME,
};
use crate::backend::MediaError;

/// Captured frames buffered ahead of the encoder (one second at 20 ms).
const CAPTURE_BACKLOG: usize = 50;

/// Largest Opus packet we produce.
const MAX_PACKET: usize = 4000;

fn opus_error(e: audiopus::Error) -> MediaError {
    MediaError::Device(format!("opus: {e}"))
}

fn opus_channels(config: &AudioConfig) -> Channels {
    if config.channels >= 2 {
        Channels::Stereo
    } else {
        Channels::Mono
    }
}

fn stream_config(config: &AudioConfig) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Keeps a stream thread alive; dropping it ends the stream.
struct StreamGuard {
    _stop: std_mpsc::Sender<()>,
}

/// Build and start a stream on a dedicated thread, waiting until it plays.
fn hold_stream<F>(build: F) -> Result<StreamGuard, MediaError>
where
    F: FnOnce() -> Result<cpal::Stream, MediaError> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), MediaError>>(1);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    thread::Builder::new()
        .name("parley-audio".into())
        .spawn(move || {
            let started = build().and_then(|stream| {
                stream
                    .play()
                    .map_err(|e| MediaError::Device(e.to_string()))?;
                Ok(stream)
            });
            let stream = match started {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Blocks until the guard is dropped.
            let _ = stop_rx.recv();
            drop(stream);
            debug!("Audio stream thread finished");
        })
        .map_err(|e| MediaError::Device(e.to_string()))?;

    ready_rx
        .recv()
        .map_err(|_| MediaError::Device("audio thread exited".into()))??;
    Ok(StreamGuard { _stop: stop_tx })
}

/// The default microphone.
#[derive(Debug, Clone, Default)]
pub struct DeviceInput {
    config: AudioConfig,
}

impl DeviceInput {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioInput for DeviceInput {
    fn open(&self) -> Result<Box<dyn AudioSource>, MediaError> {
        let encoder = Encoder::new(
            SampleRate::Hz48000,
            opus_channels(&self.config),
            Application::Voip,
        )
        .map_err(opus_error)?;

        let (frame_tx, frame_rx) = std_mpsc::sync_channel::<Vec<f32>>(CAPTURE_BACKLOG);
        let config = self.config.clone();

        let guard = hold_stream(move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or(MediaError::NoInput)?;
            info!(device = ?device.name(), "Using input device");

            let mut framer = PcmFramer::new(config.frame_size_samples());
            device
                .build_input_stream(
                    &stream_config(&config),
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        framer.push(data, |frame| {
                            if frame_tx.try_send(frame).is_err() {
                                warn!("Audio frame channel full, dropping frame");
                            }
                        });
                    },
                    move |err| error!("Audio input error: {err}"),
                    None,
                )
                .map_err(|e| MediaError::Denied(e.to_string()))
        })?;

        info!("Microphone capture started");
        Ok(Box::new(DeviceSource {
            _guard: guard,
            frames: frame_rx,
            encoder,
            packet: vec![0u8; MAX_PACKET],
        }))
    }
}

pub struct DeviceSource {
    _guard: StreamGuard,
    frames: std_mpsc::Receiver<Vec<f32>>,
    encoder: Encoder,
    packet: Vec<u8>,
}

impl AudioSource for DeviceSource {
    fn next_frame(&mut self) -> Option<Bytes> {
        let pcm = match self.frames.try_recv() {
            Ok(pcm) => pcm,
            // The device is behind the pacing timer; keep the track going.
            Err(std_mpsc::TryRecvError::Empty) => {
                return Some(Bytes::from_static(&OPUS_SILENCE_FRAME))
            }
            Err(std_mpsc::TryRecvError::Disconnected) => return None,
        };
        match self.encoder.encode_float(&pcm, &mut self.packet) {
            Ok(len) => Some(Bytes::copy_from_slice(&self.packet[..len])),
            Err(e) => {
                warn!(error = %e, "Failed to encode audio frame");
                Some(Bytes::from_static(&OPUS_SILENCE_FRAME))
            }
        }
    }
}

/// The default speaker.
#[derive(Debug, Clone, Default)]
pub struct DeviceOutput {
    config: AudioConfig,
}

impl DeviceOutput {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioOutput for DeviceOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>, MediaError> {
        let decoder =
            Decoder::new(SampleRate::Hz48000, opus_channels(&self.config)).map_err(opus_error)?;

        let (pcm_tx, pcm_rx) = std_mpsc::channel::<Vec<f32>>();
        let config = self.config.clone();

        let guard = hold_stream(move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| MediaError::Device("no output device".into()))?;
            info!(device = ?device.name(), "Using output device");

            let mut queue: VecDeque<f32> = VecDeque::new();
            device
                .build_output_stream(
                    &stream_config(&config),
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        while let Ok(frame) = pcm_rx.try_recv() {
                            queue.extend(frame);
                        }
                        for sample in data.iter_mut() {
                            *sample = queue.pop_front().unwrap_or(0.0);
                        }
                    },
                    move |err| error!("Audio output error: {err}"),
                    None,
                )
                .map_err(|e| MediaError::Device(e.to_string()))
        })?;

        info!("Speaker playback started");
        let frame_len = self.config.frame_size_samples() * usize::from(self.config.channels);
        Ok(Box::new(DeviceSink {
            _guard: guard,
            decoder,
            pcm: pcm_tx,
            // Opus frames run up to 120 ms.
            scratch: vec![0.0; frame_len * 6],
        }))
    }
}

pub struct DeviceSink {
    _guard: StreamGuard,
    decoder: Decoder,
    pcm: std_mpsc::Sender<Vec<f32>>,
    scratch: Vec<f32>,
}

impl AudioSink for DeviceSink {
    fn play(&mut self, packet: &[u8]) {
        match self
            .decoder
            .decode_float(Some(packet), &mut self.scratch[..], false)
        {
            Ok(samples) => {
                let _ = self.pcm.send(self.scratch[..samples].to_vec());
            }
            Err(e) => debug!(error = %e, "Dropped undecodable audio packet"),
        }
    }
}
