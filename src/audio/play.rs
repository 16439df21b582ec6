//! Agent playback: a device-clocked timeline of scheduled buffers.
//!
//! The playback thread writes one period at a time. Each period is rendered
//! from whatever buffers cover it (silence otherwise), so the device clock
//! keeps running between turns. The clock is the number of frames rendered,
//! advanced under the timeline lock, so a buffer can never be placed on a
//! frame that was already rendered. Stopping a buffer whose frames already
//! reached the device drops the device queue before the next period.

use super::scheduler::BufferId;

struct TimelineEntry {
    id: BufferId,
    start: u64,
    samples: Vec<i16>,
}

impl TimelineEntry {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Buffers placed at absolute frame positions, plus the position up to
/// which frames have already been rendered for the device.
#[derive(Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    position: u64,
}

impl Timeline {
    /// First frame not yet rendered. This is the device clock.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Place `samples` at frame `start`. A start that is already rendered
    /// moves to the current position. Returns the frame it will start at.
    pub fn insert(&mut self, id: BufferId, start: u64, samples: Vec<i16>) -> u64 {
        let start = start.max(self.position);
        self.entries.push(TimelineEntry { id, start, samples });
        start
    }

    /// Take `id` off the timeline. Returns true when some of its frames may
    /// already sit in the device queue: it was partly rendered, or it was
    /// rendered completely and is no longer tracked.
    pub fn remove(&mut self, id: BufferId) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(i) => self.entries.remove(i).start < self.position,
            None => true,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Render the next `out.len()` frames, advance the position and drop
    /// entries whose last frame has been rendered. Returns the finished ids.
    pub fn render(&mut self, out: &mut [i16]) -> Vec<BufferId> {
        out.fill(0);
        let pos = self.position;
        let period_end = pos + out.len() as u64;
        let mut finished = Vec::new();

        for entry in &self.entries {
            let from = entry.start.max(pos);
            let to = entry.end().min(period_end);
            for frame in from..to {
                let dst = &mut out[(frame - pos) as usize];
                *dst = dst.saturating_add(entry.samples[(frame - entry.start) as usize]);
            }
            if entry.end() <= period_end {
                finished.push(entry.id);
            }
        }

        self.entries.retain(|e| e.end() > period_end);
        self.position = period_end;
        finished
    }
}

#[cfg(feature = "alsa-audio")]
pub use alsa_playback::AlsaPlaybackBackend;

#[cfg(feature = "alsa-audio")]
mod alsa_playback {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread::{self, JoinHandle};
    use alsa::pcm::PCM;
    use tokio::sync::mpsc;

    use super::Timeline;
    use crate::audio::alsa_device;
    use crate::audio::audio_system::{AudioConfig, PlaybackBackend, PlaybackSink};
    use crate::audio::pcm::float_to_pcm16;
    use crate::audio::scheduler::BufferId;
    use crate::audio::stream_decoder::OutputBuffer;
    use crate::error::{Result, VoiceError};

    pub struct AlsaPlaybackBackend {
        device: String,
        sample_rate: u32,
        period_size: usize,
    }

    impl AlsaPlaybackBackend {
        pub fn new(config: &AudioConfig) -> Self {
            Self {
                device: config.playback_device.clone(),
                sample_rate: config.output_sample_rate,
                period_size: config.playback_period_size,
            }
        }
    }

    struct Shared {
        running: AtomicBool,
        /// Set when a stopped buffer may still be queued in the device.
        flush: AtomicBool,
        timeline: Mutex<Timeline>,
    }

    impl PlaybackBackend for AlsaPlaybackBackend {
        fn open(&self, ended: mpsc::UnboundedSender<BufferId>) -> Result<Box<dyn PlaybackSink>> {
            let shared = Arc::new(Shared {
                running: AtomicBool::new(true),
                flush: AtomicBool::new(false),
                timeline: Mutex::new(Timeline::default()),
            });
            let (ready_tx, ready_rx) = std_mpsc::sync_channel::<std::result::Result<(), String>>(1);

            let device = self.device.clone();
            let sample_rate = self.sample_rate;
            let period_size = (self.period_size > 0).then_some(self.period_size);
            let thread_shared = shared.clone();
            let handle = thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || {
                    playback_thread(&device, sample_rate, period_size, &thread_shared, ended, ready_tx)
                })
                .map_err(|e| VoiceError::PlaybackUnavailable {
                    message: format!("failed to spawn playback thread: {}", e),
                })?;

            let ready = ready_rx.recv().unwrap_or_else(|_| {
                Err("playback thread exited during open".to_string())
            });
            match ready {
                Ok(()) => Ok(Box::new(AlsaPlayback {
                    shared,
                    sample_rate,
                    handle: Some(handle),
                })),
                Err(message) => {
                    let _ = handle.join();
                    Err(VoiceError::PlaybackUnavailable { message })
                }
            }
        }
    }

    struct AlsaPlayback {
        shared: Arc<Shared>,
        sample_rate: u32,
        handle: Option<JoinHandle<()>>,
    }

    impl PlaybackSink for AlsaPlayback {
        fn now(&self) -> f64 {
            let timeline = self.shared.timeline.lock().unwrap_or_else(PoisonError::into_inner);
            timeline.position() as f64 / self.sample_rate as f64
        }

        fn start(&mut self, id: BufferId, at: f64, buffer: OutputBuffer) -> Result<f64> {
            if buffer.sample_rate != self.sample_rate {
                return Err(VoiceError::PlaybackUnavailable {
                    message: format!(
                        "buffer is {} Hz, device runs at {} Hz",
                        buffer.sample_rate, self.sample_rate
                    ),
                });
            }
            let samples: Vec<i16> = buffer.to_mono().into_iter().map(float_to_pcm16).collect();
            let requested = (at * self.sample_rate as f64).round().max(0.0) as u64;
            let start = self
                .shared
                .timeline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, requested, samples);
            if start != requested {
                log::debug!("Buffer {} moved from frame {} to {}", id, requested, start);
            }
            Ok(start as f64 / self.sample_rate as f64)
        }

        fn stop(&mut self, id: BufferId) {
            let queued = self
                .shared
                .timeline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id);
            if queued {
                self.shared.flush.store(true, Ordering::SeqCst);
            }
        }

        fn close(&mut self) {
            self.shared.running.store(false, Ordering::SeqCst);
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
            self.shared
                .timeline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    impl Drop for AlsaPlayback {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn playback_thread(
        device: &str,
        sample_rate: u32,
        period_size: Option<usize>,
        shared: &Shared,
        ended: mpsc::UnboundedSender<BufferId>,
        ready: std_mpsc::SyncSender<std::result::Result<(), String>>,
    ) {
        let (pcm, params) = match alsa_device::open_playback(device, sample_rate, period_size) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready.send(Err(format!("{:#}", e)));
                return;
            }
        };
        let io = match pcm.io_i16() {
            Ok(io) => io,
            Err(e) => {
                let _ = ready.send(Err(e.to_string()));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let mut period = vec![0i16; params.period_size.max(1)];

        log::info!(
            "Playback started: rate={}, period={}",
            params.sample_rate,
            params.period_size,
        );

        while shared.running.load(Ordering::Relaxed) {
            if shared.flush.swap(false, Ordering::SeqCst) {
                // discard whatever the device still holds of stopped buffers
                if let Err(e) = PCM::drop(&pcm) {
                    log::warn!("Failed to drop queued playback: {}", e);
                }
                if let Err(e) = pcm.prepare() {
                    log::error!("Failed to prepare PCM after drop: {}", e);
                    break;
                }
                log::debug!("Playback queue flushed");
            }

            let finished = shared
                .timeline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .render(&mut period);

            // Short writes and XRUNs are retried; after 3 failed recoveries
            // the rest of the period is dropped.
            let mut frames_written = 0;
            let mut retry_count = 0u32;
            while frames_written < period.len() {
                match io.writei(&period[frames_written..]) {
                    Ok(n) => {
                        frames_written += n;
                        retry_count = 0;
                    }
                    Err(e) => {
                        log::warn!("ALSA XRUN or error: {}, recovering...", e);
                        retry_count += 1;
                        if let Err(e2) = pcm.prepare() {
                            log::error!("Failed to recover PCM playback: {}", e2);
                            break;
                        }
                        if retry_count >= 3 {
                            log::error!(
                                "Max recovery retries reached, dropping {} frames",
                                period.len() - frames_written
                            );
                            break;
                        }
                    }
                }
            }

            for id in finished {
                if ended.send(id).is_err() {
                    log::debug!("Session gone, playback completion for {} dropped", id);
                }
            }
        }

        log::info!("Playback stopped");
    }
}
