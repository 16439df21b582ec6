//! audio - Microphone capture, PCM codec, and scheduled agent playback
//!
//! Uses ALSA for device I/O on dedicated threads (feature `alsa-audio`);
//! everything above the device layer is plain data and runs anywhere.

#[cfg(feature = "alsa-audio")]
mod alsa_device;
pub mod audio_system;
pub mod capture;
pub mod pcm;
pub mod play;
pub mod scheduler;
pub mod stream_decoder;

pub use audio_system::{
    AudioBackends, AudioConfig, AudioSystem, CaptureBackend, CaptureStream, PlaybackBackend,
    PlaybackSink,
};
pub use scheduler::{BufferId, PlaybackScheduler, ScheduledBuffer};
pub use stream_decoder::{OutputBuffer, Pcm16Decoder, StreamDecoder};
