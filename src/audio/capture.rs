//! Microphone capture: ALSA periods → fixed-size float frames.

/// Regroups device periods of any size into frames of exactly `frame_size`
/// samples. Leftover samples wait for the next period.
pub struct FrameAssembler {
    frame_size: usize,
    accum: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            accum: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Append one period; returns every frame it completed, oldest first.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.accum.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.accum.len() >= self.frame_size {
            frames.push(self.accum.drain(..self.frame_size).collect());
        }
        frames
    }

    /// Samples waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.accum.len()
    }
}

#[cfg(feature = "alsa-audio")]
pub use alsa_capture::AlsaCaptureBackend;

#[cfg(feature = "alsa-audio")]
mod alsa_capture {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::thread::{self, JoinHandle};
    use tokio::sync::mpsc;

    use super::FrameAssembler;
    use crate::audio::alsa_device;
    use crate::audio::audio_system::{AudioConfig, CaptureBackend, CaptureStream};
    use crate::error::{Result, VoiceError};

    pub struct AlsaCaptureBackend {
        device: String,
        sample_rate: u32,
        frame_size: usize,
    }

    impl AlsaCaptureBackend {
        pub fn new(config: &AudioConfig) -> Self {
            Self {
                device: config.capture_device.clone(),
                sample_rate: config.input_sample_rate,
                frame_size: config.frame_size,
            }
        }
    }

    impl CaptureBackend for AlsaCaptureBackend {
        fn open(&self, frames: mpsc::Sender<Vec<f32>>) -> Result<Box<dyn CaptureStream>> {
            let running = Arc::new(AtomicBool::new(true));
            let (ready_tx, ready_rx) = std_mpsc::sync_channel::<std::result::Result<(), String>>(1);

            let device = self.device.clone();
            let sample_rate = self.sample_rate;
            let frame_size = self.frame_size;
            let thread_running = running.clone();
            let handle = thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    capture_thread(&device, sample_rate, frame_size, frames, &thread_running, ready_tx)
                })
                .map_err(|e| VoiceError::CaptureUnavailable {
                    message: format!("failed to spawn capture thread: {}", e),
                })?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Box::new(AlsaCapture {
                    running,
                    handle: Some(handle),
                })),
                Ok(Err(message)) => {
                    let _ = handle.join();
                    Err(VoiceError::CaptureUnavailable { message })
                }
                Err(_) => {
                    let _ = handle.join();
                    Err(VoiceError::CaptureUnavailable {
                        message: "capture thread exited during open".to_string(),
                    })
                }
            }
        }
    }

    struct AlsaCapture {
        running: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl CaptureStream for AlsaCapture {
        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            // the thread notices within one period
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }

    impl Drop for AlsaCapture {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn capture_thread(
        device: &str,
        sample_rate: u32,
        frame_size: usize,
        frames: mpsc::Sender<Vec<f32>>,
        running: &AtomicBool,
        ready: std_mpsc::SyncSender<std::result::Result<(), String>>,
    ) {
        let (pcm, params) = match alsa_device::open_capture(device, sample_rate) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready.send(Err(format!("{:#}", e)));
                return;
            }
        };
        let io = match pcm.io_f32() {
            Ok(io) => io,
            Err(e) => {
                let _ = ready.send(Err(e.to_string()));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let mut assembler = FrameAssembler::new(frame_size);
        let mut read_buf = vec![0f32; params.period_size.max(1)];

        log::info!(
            "Capture started: rate={}, period={}, frame_size={}",
            params.sample_rate,
            params.period_size,
            frame_size,
        );

        while running.load(Ordering::Relaxed) {
            match io.readi(&mut read_buf) {
                Ok(n) => {
                    for frame in assembler.push(&read_buf[..n]) {
                        if frames.blocking_send(frame).is_err() {
                            log::info!("Frame receiver closed, capture exiting");
                            return;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM capture: {}", e2);
                        break;
                    }
                }
            }
        }

        log::info!(
            "Capture stopped, {} samples of a partial frame discarded",
            assembler.pending()
        );
    }
}
