//! Transport Session: one long-lived WebSocket to the realtime endpoint.
//!
//! `connect` performs the HTTP upgrade and sends `setup`; the link task then
//! reports [`NetEvent::Opened`] once the endpoint answers `setupComplete`.
//! Uplink packets handed over before that, or after the link started
//! closing, are dropped with a debug log. A closed link is never reopened.

use std::fmt::Display;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use crate::error::{Result, VoiceError};
use crate::protocol::{
    ClientMessage, Content, DownlinkEvent, GenerationConfig, Modality, PrebuiltVoiceConfig,
    ServerMessage, Setup, SpeechConfig, UplinkPacket, VoiceConfig,
};

const EVENT_QUEUE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    /// The endpoint accepted the setup; uplink may flow.
    Opened,
    AudioChunk(String),
    Interrupted,
    TurnComplete,
    /// The link is gone. `error` is set unless it closed normally.
    Closed { error: Option<String> },
}

impl From<DownlinkEvent> for NetEvent {
    fn from(event: DownlinkEvent) -> Self {
        match event {
            DownlinkEvent::AudioChunk(data) => NetEvent::AudioChunk(data),
            DownlinkEvent::Interrupted => NetEvent::Interrupted,
            DownlinkEvent::TurnComplete => NetEvent::TurnComplete,
        }
    }
}

#[derive(Debug)]
pub enum NetCommand {
    SendAudio(UplinkPacket),
    Close,
}

/// What is sent at connect time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub response_modalities: Vec<Modality>,
    pub system_instruction: String,
    pub voice: String,
}

impl SessionConfig {
    pub fn setup_message(&self) -> ClientMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: self.response_modalities.clone(),
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content::text(self.system_instruction.clone()),
        })
    }
}

/// Handle to an open link: fire-and-forget uplink, ordered downlink events.
pub struct TransportSession {
    commands: mpsc::UnboundedSender<NetCommand>,
    events: mpsc::Receiver<NetEvent>,
}

impl TransportSession {
    pub fn new(
        commands: mpsc::UnboundedSender<NetCommand>,
        events: mpsc::Receiver<NetEvent>,
    ) -> Self {
        Self { commands, events }
    }

    /// Never blocks; packets queue in the link with no throttling.
    pub fn send(&self, packet: UplinkPacket) {
        if self.commands.send(NetCommand::SendAudio(packet)).is_err() {
            log::debug!("Link closed, uplink packet dropped");
        }
    }

    pub fn close(&self) {
        let _ = self.commands.send(NetCommand::Close);
    }

    /// `None` once the link task has gone away.
    pub async fn recv(&mut self) -> Option<NetEvent> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportSession>;
}

/// The hosted realtime endpoint over WebSocket.
pub struct WsTransport {
    url: String,
    api_key: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

fn open_failure(e: impl Display) -> VoiceError {
    VoiceError::TransportOpenFailure {
        message: e.to_string(),
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportSession> {
        let mut url = Url::parse(&self.url).map_err(open_failure)?;
        url.query_pairs_mut().append_pair("key", &self.api_key);

        log::info!("Connecting to {}...", self.url);
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(open_failure)?;
        log::info!("Connected!");

        let (mut write, read) = ws_stream.split();

        let setup = serde_json::to_string(&config.setup_message()).map_err(open_failure)?;
        log::debug!("Sending setup: {}", setup);
        write
            .send(Message::Text(setup.into()))
            .await
            .map_err(open_failure)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(run_link(write, read, cmd_rx, event_tx));

        Ok(TransportSession::new(cmd_tx, event_rx))
    }
}

/// Pump one link until either side closes it.
pub async fn run_link<W, R, E>(
    mut write: W,
    mut read: R,
    mut commands: mpsc::UnboundedReceiver<NetCommand>,
    events: mpsc::Sender<NetEvent>,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let mut opened = false;

    loop {
        tokio::select! {
            msg = read.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Close(frame))) => {
                        let error = frame.and_then(|f| {
                            (f.code != CloseCode::Normal)
                                .then(|| format!("closed with code {}: {}", u16::from(f.code), f.reason.as_str()))
                        });
                        log::info!("Server closed connection: {:?}", error);
                        let _ = events.send(NetEvent::Closed { error }).await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::error!("Connection error: {}", e);
                        let _ = events.send(NetEvent::Closed { error: Some(e.to_string()) }).await;
                        return;
                    }
                    None => {
                        log::info!("Connection stream ended");
                        let _ = events.send(NetEvent::Closed { error: None }).await;
                        return;
                    }
                };

                let msg: ServerMessage = match serde_json::from_slice(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Unparseable server frame ({} bytes): {}", frame.len(), e);
                        continue;
                    }
                };
                if msg.is_setup_complete() && !opened {
                    opened = true;
                    log::info!("Setup complete, session open");
                    if events.send(NetEvent::Opened).await.is_err() {
                        return;
                    }
                }
                if let Some(go_away) = &msg.go_away {
                    log::warn!("Server going away, time left: {:?}", go_away.time_left);
                }
                for event in msg.into_events() {
                    if events.send(event.into()).await.is_err() {
                        return;
                    }
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(NetCommand::SendAudio(packet)) => {
                        if !opened {
                            log::debug!("Session not open yet, uplink packet dropped");
                            continue;
                        }
                        let text = match serde_json::to_string(&ClientMessage::from(packet)) {
                            Ok(text) => text,
                            Err(e) => {
                                log::error!("Failed to encode uplink packet: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            log::error!("Send failed: {}", e);
                            let _ = events.send(NetEvent::Closed { error: Some(e.to_string()) }).await;
                            return;
                        }
                    }
                    Some(NetCommand::Close) | None => {
                        log::info!("Closing connection");
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        return;
                    }
                }
            }
        }
    }
}
