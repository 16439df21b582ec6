//! The device pair a session holds: one microphone stream and one output
//! sink, acquired together and released together exactly once.
//!
//! Real-time I/O runs on dedicated OS threads (NOT tokio tasks); the
//! backends below are the seam between those threads and the session.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

use super::scheduler::BufferId;
use super::stream_decoder::OutputBuffer;

/// Audio device configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Uplink sample rate (16000)
    pub input_sample_rate: u32,
    /// Downlink sample rate (24000)
    pub output_sample_rate: u32,
    /// Samples per captured frame
    pub frame_size: usize,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_size: 4096,
            playback_period_size: 1024,
        }
    }
}

/// A running microphone stream. Frames flow into the sender handed to
/// [`CaptureBackend::open`] until `stop` is called or the receiver drops.
pub trait CaptureStream: Send {
    /// Release the microphone. Must be safe to call more than once.
    fn stop(&mut self);
}

/// Acquires the microphone. May block (device busy, permission prompt);
/// callers run it off the event loop under a timeout.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, frames: mpsc::Sender<Vec<f32>>) -> Result<Box<dyn CaptureStream>>;
}

/// An output device with its own clock on which buffers are placed.
pub trait PlaybackSink: Send {
    /// Device clock in seconds.
    fn now(&self) -> f64;
    /// Queue `buffer` to start at device time `at`, or as soon as possible
    /// when `at` has already been rendered. Returns the time it will
    /// actually start. When it finishes on its own, `id` is sent on the
    /// channel given to [`PlaybackBackend::open`].
    fn start(&mut self, id: BufferId, at: f64, buffer: OutputBuffer) -> Result<f64>;
    /// Silence a buffer immediately; no completion is reported for it.
    fn stop(&mut self, id: BufferId);
    /// Release the output device. Must be safe to call more than once.
    fn close(&mut self);
}

pub trait PlaybackBackend: Send + Sync {
    fn open(&self, ended: mpsc::UnboundedSender<BufferId>) -> Result<Box<dyn PlaybackSink>>;
}

/// Backends used for every session a controller starts.
#[derive(Clone)]
pub struct AudioBackends {
    pub capture: Arc<dyn CaptureBackend>,
    pub playback: Arc<dyn PlaybackBackend>,
}

impl AudioBackends {
    #[cfg(feature = "alsa-audio")]
    pub fn alsa(config: &AudioConfig) -> Self {
        Self {
            capture: Arc::new(super::capture::AlsaCaptureBackend::new(config)),
            playback: Arc::new(super::play::AlsaPlaybackBackend::new(config)),
        }
    }
}

/// Devices held by one session.
pub struct AudioSystem {
    capture: Option<Box<dyn CaptureStream>>,
    playback: Option<Box<dyn PlaybackSink>>,
}

impl AudioSystem {
    pub fn new(capture: Box<dyn CaptureStream>, playback: Box<dyn PlaybackSink>) -> Self {
        Self {
            capture: Some(capture),
            playback: Some(playback),
        }
    }

    /// Output device clock, or 0 once released.
    pub fn now(&self) -> f64 {
        self.playback.as_ref().map_or(0.0, |p| p.now())
    }

    pub fn play(&mut self, id: BufferId, at: f64, buffer: OutputBuffer) -> Result<f64> {
        match self.playback.as_mut() {
            Some(p) => p.start(id, at, buffer),
            None => Err(crate::error::VoiceError::PlaybackUnavailable {
                message: "output device already released".to_string(),
            }),
        }
    }

    pub fn stop_buffer(&mut self, id: BufferId) {
        if let Some(p) = self.playback.as_mut() {
            p.stop(id);
        }
    }

    pub fn is_released(&self) -> bool {
        self.capture.is_none() && self.playback.is_none()
    }

    /// Stop the microphone first so no frame outlives the session, then the
    /// output device. Each is released at most once.
    pub fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            log::info!("Microphone released");
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
            log::info!("Output device released");
        }
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        if !self.is_released() {
            log::warn!("Audio devices still held on drop, releasing");
            self.release();
        }
    }
}
