//! Error types for a voice session.

use thiserror::Error;

use crate::controller::SessionState;

/// Shown when a session fails to start.
pub const START_FAILURE_MESSAGE: &str = "Failed to access microphone or connect to AI service.";
/// Shown when a running session dies on a transport error.
pub const CONNECTION_ERROR_MESSAGE: &str = "Connection error. Please try again.";

#[derive(Error, Debug)]
pub enum VoiceError {
    // Start-up failures, fatal to the session being started
    #[error("Microphone unavailable: {message}")]
    CaptureUnavailable { message: String },

    #[error("Audio output unavailable: {message}")]
    PlaybackUnavailable { message: String },

    #[error("Failed to open realtime session: {message}")]
    TransportOpenFailure { message: String },

    // Runtime failures
    #[error("Realtime session error: {message}")]
    TransportRuntime { message: String },

    /// A single downlink packet could not be decoded. Never fatal.
    #[error("Malformed downlink audio: {message}")]
    Decode { message: String },

    #[error("Cannot {action} while session is {state}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },

    #[error("Invalid configuration value for {key}: {message}")]
    Config { key: String, message: String },
}

impl VoiceError {
    /// The static message a presentation layer shows for this error.
    pub fn user_message(&self) -> &'static str {
        match self {
            VoiceError::TransportRuntime { .. } => CONNECTION_ERROR_MESSAGE,
            _ => START_FAILURE_MESSAGE,
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
