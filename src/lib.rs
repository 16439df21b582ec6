//! MediVoice: a realtime voice session client.
//!
//! Microphone frames are encoded to 16-bit PCM and streamed to a hosted
//! realtime model; the agent's audio comes back in chunks that are played
//! back-to-back on the output device clock and flushed when the user barges
//! in.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod net_link;
pub mod protocol;

pub use config::Config;
pub use controller::{SessionController, SessionInput, SessionSettings, SessionState, SessionStatus};
pub use error::{Result, VoiceError};
pub use net_link::{NetEvent, SessionConfig, Transport, TransportSession, WsTransport};
