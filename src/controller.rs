//! Lifecycle Controller: owns the one active session and every resource it
//! holds.
//!
//! `Idle → Starting → Connected → Stopping → Idle`. A failed start returns to
//! `Idle`; a remote close or transport error tears a connected session down.
//! Teardown runs at most once per session whichever path triggers it:
//! [`SessionController::stop`], a `Closed` event, or dropping the controller.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::audio::{
    AudioBackends, AudioSystem, BufferId, CaptureBackend, CaptureStream, Pcm16Decoder,
    PlaybackScheduler, StreamDecoder, pcm,
};
use crate::config::system_instruction;
use crate::error::{Result, VoiceError};
use crate::net_link::{NetEvent, SessionConfig, Transport, TransportSession};
use crate::protocol::Modality;

const FRAME_QUEUE: usize = 100;
const ACTIVITY_LOG_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Connected,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// True while any agent buffer is scheduled or playing.
    pub agent_speaking: bool,
    pub language: String,
    /// User-facing message of the last failure, cleared on the next start.
    pub last_error: Option<String>,
    /// The most recent activity lines, oldest first.
    pub activity: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub voice: String,
    pub language: String,
    pub languages: Vec<String>,
    pub output_sample_rate: u32,
    pub capture_timeout: Duration,
    pub connect_timeout: Duration,
}

impl SessionSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            response_modalities: vec![Modality::Audio],
            system_instruction: system_instruction(&self.language),
            voice: self.voice.clone(),
        }
    }
}

/// One unit of work for the controller, in arrival order.
#[derive(Debug)]
pub enum SessionInput {
    Frame(Vec<f32>),
    Net(NetEvent),
    PlaybackEnded(BufferId),
}

/// Everything acquired for one connect-to-disconnect lifetime.
struct Session {
    id: Uuid,
    scheduler: PlaybackScheduler,
    decoder: Box<dyn StreamDecoder>,
    audio: AudioSystem,
    link: TransportSession,
    frames: mpsc::Receiver<Vec<f32>>,
    ended: mpsc::UnboundedReceiver<BufferId>,
}

pub struct SessionController {
    state: SessionState,
    settings: SessionSettings,
    backends: AudioBackends,
    transport: Arc<dyn Transport>,
    session: Option<Session>,
    status: watch::Sender<SessionStatus>,
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        backends: AudioBackends,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            language: settings.language.clone(),
            ..SessionStatus::default()
        });
        Self {
            state: SessionState::Idle,
            settings,
            backends,
            transport,
            session: None,
            status,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Number of agent buffers scheduled or playing.
    pub fn scheduled_buffers(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.scheduler.len())
    }

    /// Takes effect on the next `start`.
    pub fn set_language(&mut self, language: &str) -> Result<()> {
        if !self.settings.languages.iter().any(|l| l == language) {
            return Err(VoiceError::Config {
                key: "language".to_string(),
                message: format!("'{}' is not supported", language),
            });
        }
        self.settings.language = language.to_string();
        self.status.send_modify(|s| s.language = language.to_string());
        Ok(())
    }

    /// Acquire the microphone and output device, open the link and wait for
    /// the endpoint to accept the setup. Returns in `Connected` or, on any
    /// failure, in `Idle` with everything already released.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(VoiceError::InvalidState {
                action: "start",
                state: self.state,
            });
        }
        self.status.send_modify(|s| s.last_error = None);
        self.set_state(SessionState::Starting);
        self.log_activity("Initializing audio...");

        match self.open_session().await {
            Ok(session) => {
                log::info!("Session {} connected ({})", session.id, self.settings.language);
                self.session = Some(session);
                self.set_state(SessionState::Connected);
                self.log_activity("Connected! Start speaking.");
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start session: {}", e);
                let message = e.user_message().to_string();
                self.status.send_modify(|s| s.last_error = Some(message));
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    async fn open_session(&self) -> Result<Session> {
        let (frame_tx, mut frames) = mpsc::channel(FRAME_QUEUE);
        let mut capture = acquire_capture(
            self.backends.capture.clone(),
            frame_tx,
            self.settings.capture_timeout,
        )
        .await?;

        let (ended_tx, ended) = mpsc::unbounded_channel();
        let playback = match self.backends.playback.open(ended_tx) {
            Ok(playback) => playback,
            Err(e) => {
                frames.close();
                capture.stop();
                return Err(e);
            }
        };
        let mut audio = AudioSystem::new(capture, playback);

        self.log_activity("Connecting to the voice service...");
        let config = self.settings.session_config();
        let limit = self.settings.connect_timeout;
        let connecting = async {
            let mut link = self.transport.connect(&config).await?;
            wait_for_open(&mut link).await?;
            Ok::<_, VoiceError>(link)
        };
        let link = match tokio::time::timeout(limit, connecting).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                frames.close();
                audio.release();
                return Err(e);
            }
            Err(_) => {
                frames.close();
                audio.release();
                return Err(VoiceError::TransportOpenFailure {
                    message: format!("no setup acknowledgement within {:?}", limit),
                });
            }
        };

        // frames captured before the link opened are never sent
        let mut stale = 0;
        while stale < FRAME_QUEUE && frames.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            log::debug!("Discarded {} frames captured before open", stale);
        }

        Ok(Session {
            id: Uuid::new_v4(),
            scheduler: PlaybackScheduler::new(),
            decoder: Box::new(Pcm16Decoder::new(self.settings.output_sample_rate, 1)),
            audio,
            link,
            frames,
            ended,
        })
    }

    /// Wait for the next frame, downlink event or playback completion.
    /// Downlink events win ties so an interruption is applied before any
    /// later chunk. `None` when no session is active.
    pub async fn next_input(&mut self) -> Option<SessionInput> {
        let session = self.session.as_mut()?;
        tokio::select! {
            biased;
            event = session.link.recv() => Some(SessionInput::Net(event.unwrap_or(NetEvent::Closed {
                error: Some("link task ended".to_string()),
            }))),
            Some(id) = session.ended.recv() => Some(SessionInput::PlaybackEnded(id)),
            Some(frame) = session.frames.recv() => Some(SessionInput::Frame(frame)),
        }
    }

    pub fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Frame(frame) => self.forward_frame(&frame),
            SessionInput::Net(event) => self.handle_net_event(event),
            SessionInput::PlaybackEnded(id) => self.handle_playback_ended(id),
        }
    }

    /// Drive the session until `shutdown` resolves or the link closes.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    self.stop();
                    break;
                }
                input = self.next_input() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
            }
        }
    }

    /// Safe to call in any state and any number of times.
    pub fn stop(&mut self) {
        if self.session.is_none() {
            // a start that was cancelled mid-way
            if self.state != SessionState::Idle {
                self.set_state(SessionState::Idle);
            }
            return;
        }
        self.teardown();
    }

    fn forward_frame(&mut self, frame: &[f32]) {
        if self.state != SessionState::Connected {
            log::debug!("Frame dropped in state {}", self.state);
            return;
        }
        if let Some(session) = &self.session {
            session.link.send(pcm::encode_uplink(frame));
        }
    }

    fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Opened => log::debug!("Duplicate open ignored"),
            NetEvent::AudioChunk(data) => self.play_chunk(&data),
            NetEvent::Interrupted => self.interrupt(),
            NetEvent::TurnComplete => log::debug!("Model turn complete"),
            NetEvent::Closed { error } => {
                self.log_activity("Session closed.");
                if let Some(message) = error {
                    let e = VoiceError::TransportRuntime { message };
                    log::error!("{}", e);
                    let message = e.user_message().to_string();
                    self.status.send_modify(|s| s.last_error = Some(message));
                }
                self.teardown();
            }
        }
    }

    fn play_chunk(&mut self, data: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let buffer = match session.decoder.decode(data) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Skipping downlink chunk: {}", e);
                return;
            }
        };
        let slot = session
            .scheduler
            .schedule(session.audio.now(), buffer.duration());
        let started = match session.audio.play(slot.id, slot.start, buffer) {
            Ok(started) => started,
            Err(e) => {
                log::error!("Failed to start buffer {}: {}", slot.id, e);
                if session.scheduler.finish(slot.id) == Some(true) {
                    self.set_speaking(false);
                }
                return;
            }
        };
        session.scheduler.reschedule(slot.id, started);
        log::debug!(
            "Buffer {} scheduled at {:.3}s for {:.3}s",
            slot.id,
            started,
            slot.duration
        );
        self.set_speaking(true);
    }

    fn interrupt(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let now = session.audio.now();
        let stopped = session.scheduler.interrupt(now);
        for id in &stopped {
            session.audio.stop_buffer(*id);
        }
        log::info!("Interrupted, {} buffers flushed", stopped.len());
        self.log_activity("Interrupted by user.");
        self.set_speaking(false);
    }

    fn handle_playback_ended(&mut self, id: BufferId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.scheduler.finish(id) {
            Some(true) => {
                log::debug!("Agent finished speaking");
                self.set_speaking(false);
            }
            Some(false) => {}
            None => log::debug!("Completion for flushed buffer {} ignored", id),
        }
    }

    fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.set_state(SessionState::Stopping);

        let pending = session.scheduler.drain();
        for id in &pending {
            session.audio.stop_buffer(*id);
        }
        session.link.close();
        // unblocks a capture thread waiting on a full queue before it is joined
        session.frames.close();
        session.audio.release();
        log::info!(
            "Session {} released ({} buffers stopped)",
            session.id,
            pending.len()
        );

        self.set_speaking(false);
        self.set_state(SessionState::Idle);
        self.log_activity("Session stopped.");
    }

    fn set_state(&mut self, state: SessionState) {
        log::info!("Session state: {} -> {}", self.state, state);
        self.state = state;
        self.status.send_modify(|s| s.state = state);
    }

    fn set_speaking(&self, speaking: bool) {
        self.status.send_if_modified(|s| {
            let changed = s.agent_speaking != speaking;
            s.agent_speaking = speaking;
            changed
        });
    }

    fn log_activity(&self, entry: &str) {
        log::info!("{}", entry);
        self.status.send_modify(|s| {
            s.activity.push(entry.to_string());
            if s.activity.len() > ACTIVITY_LOG_LEN {
                s.activity.remove(0);
            }
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Open the microphone off the event loop; a device or permission prompt
/// that does not answer within `limit` counts as unavailable.
async fn acquire_capture(
    backend: Arc<dyn CaptureBackend>,
    frames: mpsc::Sender<Vec<f32>>,
    limit: Duration,
) -> Result<Box<dyn CaptureStream>> {
    let opening = tokio::task::spawn_blocking(move || backend.open(frames));
    match tokio::time::timeout(limit, opening).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(VoiceError::CaptureUnavailable {
            message: format!("capture open failed: {}", e),
        }),
        Err(_) => Err(VoiceError::CaptureUnavailable {
            message: format!("no microphone within {:?}", limit),
        }),
    }
}

async fn wait_for_open(link: &mut TransportSession) -> Result<()> {
    loop {
        match link.recv().await {
            Some(NetEvent::Opened) => return Ok(()),
            Some(NetEvent::Closed { error }) => {
                return Err(VoiceError::TransportOpenFailure {
                    message: error.unwrap_or_else(|| "closed during setup".to_string()),
                });
            }
            Some(other) => log::debug!("Ignoring {:?} before setup completed", other),
            None => {
                return Err(VoiceError::TransportOpenFailure {
                    message: "link ended during setup".to_string(),
                });
            }
        }
    }
}
