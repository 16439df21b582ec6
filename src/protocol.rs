//! Wire messages exchanged with the realtime endpoint.
//!
//! Client frames are externally tagged JSON objects (`{"setup": {...}}`,
//! `{"realtimeInput": {...}}`); server frames carry at most one of
//! `setupComplete`, `serverContent` or `goAway`.

use serde::{Deserialize, Serialize};

/// Mime descriptor attached to every uplink packet.
pub const UPLINK_MIME_TYPE: &str = "audio/pcm;rate=16000";

// ======================== Client → server ========================

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// One encoded input frame: `{ media: { mimeType, data } }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UplinkPacket {
    pub media: Blob,
}

impl UplinkPacket {
    pub fn pcm16k(data: String) -> Self {
        Self {
            media: Blob {
                mime_type: UPLINK_MIME_TYPE.to_string(),
                data,
            },
        }
    }
}

impl From<UplinkPacket> for ClientMessage {
    fn from(packet: UplinkPacket) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![packet.media],
        })
    }
}

// ======================== Shared ========================

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

// ======================== Server → client ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Downlink events in the order the session must apply them.
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkEvent {
    /// Base64 PCM (24 kHz, mono, s16le) from a model turn.
    AudioChunk(String),
    Interrupted,
    TurnComplete,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Audio parts first (in part order), then the interruption flag, then
    /// turn completion.
    pub fn into_events(self) -> Vec<DownlinkEvent> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };
        let mut events: Vec<DownlinkEvent> = content
            .model_turn
            .into_iter()
            .flat_map(|turn| turn.parts)
            .filter_map(|part| part.inline_data)
            .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
            .map(|blob| DownlinkEvent::AudioChunk(blob.data))
            .collect();
        if content.interrupted {
            events.push(DownlinkEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(DownlinkEvent::TurnComplete);
        }
        events
    }
}
