//! Float ↔ 16-bit PCM conversion and base64 framing.
//!
//! Byte order is little-endian on both legs.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use crate::error::{Result, VoiceError};
use crate::protocol::UplinkPacket;

/// Convert one float sample to signed 16-bit PCM.
///
/// Out-of-range input is clamped to [-1, 1]; negative values scale by 32768
/// and non-negative values by 32767 so that +1.0 does not overflow.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Inverse of [`float_to_pcm16`]: the same asymmetric scale per sign, so a
/// round trip is off by less than one quantization step.
pub fn pcm16_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Encode a frame of float samples to little-endian s16 bytes.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| float_to_pcm16(s).to_le_bytes())
        .collect()
}

/// Encode one captured frame into a ready-to-send uplink packet.
pub fn encode_uplink(samples: &[f32]) -> UplinkPacket {
    UplinkPacket::pcm16k(B64.encode(encode_frame(samples)))
}

/// Decode little-endian s16 bytes into float samples.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode {
            message: format!("odd PCM payload length {}", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| pcm16_to_float(i16::from_le_bytes([c[0], c[1]])))
        .collect())
}

/// Decode a base64 payload into float samples.
pub fn decode_base64(payload: &str) -> Result<Vec<f32>> {
    let bytes = B64.decode(payload).map_err(|e| VoiceError::Decode {
        message: format!("invalid base64: {}", e),
    })?;
    decode_frame(&bytes)
}
