use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use medivoice::audio::{
    AudioBackends, BufferId, CaptureBackend, CaptureStream, OutputBuffer, PlaybackBackend,
    PlaybackSink,
};
use medivoice::error::{CONNECTION_ERROR_MESSAGE, START_FAILURE_MESSAGE};
use medivoice::net_link::NetCommand;
use medivoice::{
    NetEvent, SessionConfig, SessionController, SessionSettings, SessionState,
    Transport, TransportSession, VoiceError,
};

const FRAME: usize = 4096;
const RATE: f64 = 24000.0;

// ---------------------------------------------------------------- capture

#[derive(Clone, Copy, PartialEq)]
enum MicMode {
    Ready,
    Denied,
    Hangs,
    /// Produces frames as fast as the queue takes them.
    Floods,
}

#[derive(Default)]
struct MicLog {
    opens: usize,
    stops: usize,
    frames: Option<mpsc::Sender<Vec<f32>>>,
}

struct MockMic {
    mode: MicMode,
    log: Arc<Mutex<MicLog>>,
}

struct MockMicStream(Arc<Mutex<MicLog>>);

impl CaptureStream for MockMicStream {
    fn stop(&mut self) {
        let mut log = self.0.lock().unwrap();
        log.stops += 1;
        log.frames = None;
    }
}

impl CaptureBackend for MockMic {
    fn open(&self, frames: mpsc::Sender<Vec<f32>>) -> medivoice::Result<Box<dyn CaptureStream>> {
        match self.mode {
            MicMode::Denied => {
                return Err(VoiceError::CaptureUnavailable {
                    message: "permission denied".to_string(),
                });
            }
            MicMode::Hangs => std::thread::sleep(Duration::from_millis(300)),
            MicMode::Ready | MicMode::Floods => {}
        }
        if self.mode == MicMode::Floods {
            self.log.lock().unwrap().opens += 1;
            let running = Arc::new(AtomicBool::new(true));
            let flag = running.clone();
            let handle = std::thread::spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    if frames.blocking_send(vec![0.0; 16]).is_err() {
                        break;
                    }
                }
            });
            return Ok(Box::new(FloodStream {
                running,
                handle: Some(handle),
                log: self.log.clone(),
            }));
        }
        // captured while the link is still opening
        let _ = frames.try_send(vec![0.25; 16]);
        let mut log = self.log.lock().unwrap();
        log.opens += 1;
        log.frames = Some(frames);
        Ok(Box::new(MockMicStream(self.log.clone())))
    }
}

/// Stops like a device thread: clear the flag, then join.
struct FloodStream {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    log: Arc<Mutex<MicLog>>,
}

impl CaptureStream for FloodStream {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
            self.log.lock().unwrap().stops += 1;
        }
    }
}

// --------------------------------------------------------------- playback

#[derive(Default)]
struct SpeakerLog {
    opens: usize,
    closes: usize,
    clock: f64,
    /// How much later than asked the sink places the next buffer.
    lag: f64,
    starts: Vec<(BufferId, f64, usize)>,
    stops: Vec<BufferId>,
    ended: Option<mpsc::UnboundedSender<BufferId>>,
}

struct MockSpeaker {
    log: Arc<Mutex<SpeakerLog>>,
}

struct MockSpeakerSink(Arc<Mutex<SpeakerLog>>);

impl PlaybackSink for MockSpeakerSink {
    fn now(&self) -> f64 {
        self.0.lock().unwrap().clock
    }

    fn start(&mut self, id: BufferId, at: f64, buffer: OutputBuffer) -> medivoice::Result<f64> {
        let mut log = self.0.lock().unwrap();
        let placed = at + log.lag;
        log.starts.push((id, placed, buffer.frames()));
        Ok(placed)
    }

    fn stop(&mut self, id: BufferId) {
        self.0.lock().unwrap().stops.push(id);
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closes += 1;
    }
}

impl PlaybackBackend for MockSpeaker {
    fn open(
        &self,
        ended: mpsc::UnboundedSender<BufferId>,
    ) -> medivoice::Result<Box<dyn PlaybackSink>> {
        let mut log = self.log.lock().unwrap();
        log.opens += 1;
        log.ended = Some(ended);
        Ok(Box::new(MockSpeakerSink(self.log.clone())))
    }
}

// -------------------------------------------------------------- transport

#[derive(Clone, Copy, PartialEq)]
enum LinkMode {
    /// Acknowledges setup and answers every uplink packet with the same audio.
    Echo,
    Refuse,
    RejectSetup,
    NeverOpens,
}

#[derive(Default)]
struct LinkLog {
    connects: usize,
    uplink: usize,
    closes: usize,
    model: Option<String>,
    events: Option<mpsc::Sender<NetEvent>>,
}

struct MockTransport {
    mode: LinkMode,
    log: Arc<Mutex<LinkLog>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, config: &SessionConfig) -> medivoice::Result<TransportSession> {
        {
            let mut log = self.log.lock().unwrap();
            log.connects += 1;
            log.model = Some(config.model.clone());
        }
        if self.mode == LinkMode::Refuse {
            return Err(VoiceError::TransportOpenFailure {
                message: "handshake refused".to_string(),
            });
        }

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::channel(100);
        self.log.lock().unwrap().events = Some(ev_tx.clone());

        let mode = self.mode;
        let log = self.log.clone();
        tokio::spawn(async move {
            match mode {
                LinkMode::Echo => {
                    let _ = ev_tx.send(NetEvent::Opened).await;
                }
                LinkMode::RejectSetup => {
                    let _ = ev_tx
                        .send(NetEvent::Closed {
                            error: Some("invalid model".to_string()),
                        })
                        .await;
                }
                _ => {}
            }
            while let Some(command) = cmd_rx.recv().await {
                match command {
                    NetCommand::SendAudio(packet) => {
                        log.lock().unwrap().uplink += 1;
                        let _ = ev_tx.send(NetEvent::AudioChunk(packet.media.data)).await;
                    }
                    NetCommand::Close => {
                        log.lock().unwrap().closes += 1;
                        break;
                    }
                }
            }
        });

        Ok(TransportSession::new(cmd_tx, ev_rx))
    }
}

// ---------------------------------------------------------------- harness

struct Harness {
    controller: SessionController,
    mic: Arc<Mutex<MicLog>>,
    speaker: Arc<Mutex<SpeakerLog>>,
    link: Arc<Mutex<LinkLog>>,
}

fn settings() -> SessionSettings {
    SessionSettings {
        model: "test-native-audio".to_string(),
        voice: "Kore".to_string(),
        language: "English".to_string(),
        languages: vec![
            "English".to_string(),
            "Hindi".to_string(),
            "Marathi".to_string(),
        ],
        output_sample_rate: 24000,
        capture_timeout: Duration::from_millis(100),
        connect_timeout: Duration::from_millis(200),
    }
}

fn harness(mic_mode: MicMode, link_mode: LinkMode) -> Harness {
    let mic = Arc::new(Mutex::new(MicLog::default()));
    let speaker = Arc::new(Mutex::new(SpeakerLog::default()));
    let link = Arc::new(Mutex::new(LinkLog::default()));
    let backends = AudioBackends {
        capture: Arc::new(MockMic {
            mode: mic_mode,
            log: mic.clone(),
        }),
        playback: Arc::new(MockSpeaker {
            log: speaker.clone(),
        }),
    };
    let transport = Arc::new(MockTransport {
        mode: link_mode,
        log: link.clone(),
    });
    Harness {
        controller: SessionController::new(settings(), backends, transport),
        mic,
        speaker,
        link,
    }
}

impl Harness {
    async fn speak(&self, frames: usize) {
        let sender = self.mic.lock().unwrap().frames.clone().unwrap();
        for _ in 0..frames {
            sender.send(vec![0.5; FRAME]).await.unwrap();
        }
    }

    async fn inject(&self, event: NetEvent) {
        let events = self.link.lock().unwrap().events.clone().unwrap();
        events.send(event).await.unwrap();
    }

    async fn step(&mut self) {
        let input = tokio::time::timeout(Duration::from_secs(2), self.controller.next_input())
            .await
            .expect("no input within 2s")
            .expect("no active session");
        self.controller.handle(input);
    }

    async fn pump_until_starts(&mut self, count: usize) {
        while self.speaker.lock().unwrap().starts.len() < count {
            self.step().await;
        }
    }
}

fn assert_close(a: f64, b: f64) {
    assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
}

// ------------------------------------------------------------------ tests

#[tokio::test]
async fn test_echo_plays_back_to_back() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    let status = h.controller.subscribe();

    h.controller.start().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(status.borrow().state, SessionState::Connected);
    assert_eq!(h.link.lock().unwrap().uplink, 0);
    assert_eq!(
        h.link.lock().unwrap().model.as_deref(),
        Some("test-native-audio")
    );

    h.speak(3).await;
    h.pump_until_starts(3).await;

    {
        let speaker = h.speaker.lock().unwrap();
        let d = FRAME as f64 / RATE;
        // the frame captured before open never reaches the wire
        assert!(speaker.starts.iter().all(|(_, _, frames)| *frames == FRAME));
        assert_close(speaker.starts[0].1, 0.0);
        assert_close(speaker.starts[1].1, d);
        assert_close(speaker.starts[2].1, 2.0 * d);
    }
    assert_eq!(h.link.lock().unwrap().uplink, 3);
    assert_eq!(h.controller.scheduled_buffers(), 3);
    assert!(status.borrow().agent_speaking);

    h.controller.stop();
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.scheduled_buffers(), 0);
    assert!(!status.borrow().agent_speaking);
    assert_eq!(h.speaker.lock().unwrap().stops.len(), 3);
    assert_eq!(
        status.borrow().activity.last().map(String::as_str),
        Some("Session stopped.")
    );
}

#[tokio::test]
async fn test_late_chunk_starts_at_device_now() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();

    h.speak(1).await;
    h.pump_until_starts(1).await;
    // the first buffer has long finished when the next one arrives
    h.speaker.lock().unwrap().clock = 10.0;
    h.speak(1).await;
    h.pump_until_starts(2).await;

    assert_close(h.speaker.lock().unwrap().starts[1].1, 10.0);
}

#[tokio::test]
async fn test_late_placement_shifts_following_chunks() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();

    h.speaker.lock().unwrap().lag = 0.02;
    h.speak(1).await;
    h.pump_until_starts(1).await;
    h.speaker.lock().unwrap().lag = 0.0;
    h.speak(1).await;
    h.pump_until_starts(2).await;

    let speaker = h.speaker.lock().unwrap();
    assert_close(speaker.starts[0].1, 0.02);
    assert_close(speaker.starts[1].1, 0.02 + FRAME as f64 / RATE);
}

#[tokio::test]
async fn test_stop_with_full_frame_queue() {
    let mut h = harness(MicMode::Floods, LinkMode::Echo);
    h.controller.start().await.unwrap();
    // nobody pumps frames, so the queue fills and the producer blocks
    tokio::time::sleep(Duration::from_millis(50)).await;

    let Harness {
        mut controller,
        mic,
        ..
    } = h;
    let stopping = tokio::task::spawn_blocking(move || {
        controller.stop();
        controller
    });
    let controller = tokio::time::timeout(Duration::from_secs(2), stopping)
        .await
        .expect("stop blocked on the capture thread")
        .unwrap();

    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(mic.lock().unwrap().stops, 1);
}

#[tokio::test]
async fn test_capture_denied_returns_to_idle() {
    let mut h = harness(MicMode::Denied, LinkMode::Echo);
    let result = h.controller.start().await;

    assert!(matches!(result, Err(VoiceError::CaptureUnavailable { .. })));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(
        h.controller.status().last_error.as_deref(),
        Some(START_FAILURE_MESSAGE)
    );
    assert_eq!(h.link.lock().unwrap().connects, 0);
    assert_eq!(h.speaker.lock().unwrap().opens, 0);
}

#[tokio::test]
async fn test_capture_timeout() {
    let mut h = harness(MicMode::Hangs, LinkMode::Echo);
    let result = h.controller.start().await;

    assert!(matches!(result, Err(VoiceError::CaptureUnavailable { .. })));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.link.lock().unwrap().connects, 0);
}

#[tokio::test]
async fn test_refused_connect_releases_devices() {
    let mut h = harness(MicMode::Ready, LinkMode::Refuse);
    let result = h.controller.start().await;

    assert!(matches!(result, Err(VoiceError::TransportOpenFailure { .. })));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.mic.lock().unwrap().stops, 1);
    assert_eq!(h.speaker.lock().unwrap().closes, 1);

    h.controller.stop();
    assert_eq!(h.mic.lock().unwrap().stops, 1);
    assert_eq!(h.speaker.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_setup_rejected() {
    let mut h = harness(MicMode::Ready, LinkMode::RejectSetup);
    let result = h.controller.start().await;

    match result {
        Err(VoiceError::TransportOpenFailure { message }) => assert_eq!(message, "invalid model"),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
    assert_eq!(h.mic.lock().unwrap().stops, 1);
    assert_eq!(h.speaker.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_setup_never_acknowledged() {
    let mut h = harness(MicMode::Ready, LinkMode::NeverOpens);
    let result = h.controller.start().await;

    assert!(matches!(result, Err(VoiceError::TransportOpenFailure { .. })));
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.mic.lock().unwrap().stops, 1);
}

#[tokio::test]
async fn test_start_while_connected_rejected() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();

    let result = h.controller.start().await;
    assert!(matches!(
        result,
        Err(VoiceError::InvalidState {
            state: SessionState::Connected,
            ..
        })
    ));
    assert_eq!(h.link.lock().unwrap().connects, 1);
    assert_eq!(h.controller.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();

    h.controller.stop();
    h.controller.stop();

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.mic.lock().unwrap().stops, 1);
    assert_eq!(h.speaker.lock().unwrap().closes, 1);
    assert!(h.controller.next_input().await.is_none());

    // the link task sees the close request
    for _ in 0..50 {
        if h.link.lock().unwrap().closes == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.link.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();
    h.controller.stop();
    h.controller.start().await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(h.link.lock().unwrap().connects, 2);
    assert_eq!(h.mic.lock().unwrap().opens, 2);
}

#[tokio::test]
async fn test_remote_error_tears_down_once() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();

    h.inject(NetEvent::Closed {
        error: Some("connection reset".to_string()),
    })
    .await;
    h.step().await;

    assert_eq!(h.controller.state(), SessionState::Idle);
    let status = h.controller.status();
    assert_eq!(status.last_error.as_deref(), Some(CONNECTION_ERROR_MESSAGE));
    assert!(status.activity.iter().any(|a| a == "Session closed."));
    assert_eq!(h.mic.lock().unwrap().stops, 1);
    assert_eq!(h.speaker.lock().unwrap().closes, 1);

    h.controller.stop();
    assert_eq!(h.mic.lock().unwrap().stops, 1);
    assert_eq!(h.speaker.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_normal_close_sets_no_error() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();

    h.inject(NetEvent::Closed { error: None }).await;
    h.step().await;

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.controller.status().last_error, None);
}

#[tokio::test]
async fn test_interruption_flushes_scheduled_audio() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();
    h.speak(2).await;
    h.pump_until_starts(2).await;

    h.inject(NetEvent::Interrupted).await;
    h.step().await;

    assert_eq!(h.controller.scheduled_buffers(), 0);
    assert!(!h.controller.status().agent_speaking);
    let mut stopped = h.speaker.lock().unwrap().stops.clone();
    stopped.sort();
    assert_eq!(stopped, vec![0, 1]);
    assert_eq!(
        h.controller.status().activity.last().map(String::as_str),
        Some("Interrupted by user.")
    );

    // a fresh turn starts at the device clock, not after the flushed audio
    h.speaker.lock().unwrap().clock = 0.05;
    h.speak(1).await;
    h.pump_until_starts(3).await;
    assert_close(h.speaker.lock().unwrap().starts[2].1, 0.05);
}

#[tokio::test]
async fn test_speaking_ends_with_last_buffer() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();
    h.speak(2).await;
    h.pump_until_starts(2).await;
    let ended = h.speaker.lock().unwrap().ended.clone().unwrap();

    ended.send(0).unwrap();
    h.step().await;
    assert!(h.controller.status().agent_speaking);
    assert_eq!(h.controller.scheduled_buffers(), 1);

    ended.send(1).unwrap();
    h.step().await;
    assert!(!h.controller.status().agent_speaking);
    assert_eq!(h.controller.scheduled_buffers(), 0);

    // a stale completion changes nothing
    ended.send(1).unwrap();
    h.step().await;
    assert_eq!(h.controller.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_malformed_chunk_skipped() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.start().await.unwrap();

    h.inject(NetEvent::AudioChunk("%%% not base64".to_string()))
        .await;
    h.step().await;
    // three bytes: half a sample left over
    h.inject(NetEvent::AudioChunk("AAAA".to_string())).await;
    h.step().await;

    assert_eq!(h.controller.state(), SessionState::Connected);
    assert!(h.speaker.lock().unwrap().starts.is_empty());

    h.speak(1).await;
    h.pump_until_starts(1).await;
    assert_close(h.speaker.lock().unwrap().starts[0].1, 0.0);
}

#[tokio::test]
async fn test_language_selection() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    h.controller.set_language("Marathi").unwrap();
    assert_eq!(h.controller.status().language, "Marathi");
    assert!(
        h.controller
            .settings()
            .session_config()
            .system_instruction
            .contains("in Marathi ONLY")
    );
    assert!(matches!(
        h.controller.set_language("French"),
        Err(VoiceError::Config { .. })
    ));
    assert_eq!(h.controller.settings().language, "Marathi");
}

#[tokio::test]
async fn test_activity_log_keeps_last_five() {
    let mut h = harness(MicMode::Ready, LinkMode::Echo);
    for _ in 0..3 {
        h.controller.start().await.unwrap();
        h.controller.stop();
    }
    let activity = h.controller.status().activity;
    assert_eq!(activity.len(), 5);
    assert_eq!(activity.last().map(String::as_str), Some("Session stopped."));
}

#[tokio::test]
async fn test_drop_releases_session() {
    let h = harness(MicMode::Ready, LinkMode::Echo);
    let (mut controller, mic, speaker) = (h.controller, h.mic, h.speaker);
    controller.start().await.unwrap();
    drop(controller);

    assert_eq!(mic.lock().unwrap().stops, 1);
    assert_eq!(speaker.lock().unwrap().closes, 1);
}
