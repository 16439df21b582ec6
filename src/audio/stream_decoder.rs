//! Downlink decoding: encoded packet → playable [`OutputBuffer`].

use crate::error::{Result, VoiceError};

use super::pcm;

/// A decoded, playable audio buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBuffer {
    /// Interleaved float samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl OutputBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels down to one.
    pub fn to_mono(&self) -> Vec<f32> {
        let ch = self.channels.max(1) as usize;
        if ch == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }
}

/// A trait for downlink decoders that turn one encoded packet into a
/// buffer ready for scheduling.
pub trait StreamDecoder: Send {
    fn decode(&mut self, payload: &str) -> Result<OutputBuffer>;
}

/// Base64 s16le PCM at a fixed rate and channel count.
pub struct Pcm16Decoder {
    sample_rate: u32,
    channels: u16,
}

impl Pcm16Decoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl StreamDecoder for Pcm16Decoder {
    fn decode(&mut self, payload: &str) -> Result<OutputBuffer> {
        let samples = pcm::decode_base64(payload)?;
        if samples.is_empty() {
            return Err(VoiceError::Decode {
                message: "empty audio chunk".to_string(),
            });
        }
        if samples.len() % self.channels.max(1) as usize != 0 {
            return Err(VoiceError::Decode {
                message: format!(
                    "{} samples do not split into {} channels",
                    samples.len(),
                    self.channels
                ),
            });
        }
        Ok(OutputBuffer {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }
}
