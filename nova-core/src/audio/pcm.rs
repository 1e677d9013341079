//! Linear PCM conversions and the base64 wire encoding.
//!
//! Capture sends 16-bit little-endian PCM at 16 kHz; the remote answers with
//! the same encoding at 24 kHz. Both directions travel as standard base64.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};

use crate::error::{NovaError, Result};

/// Wire MIME descriptor attached to every outbound microphone frame.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Sample rate of outbound microphone frames.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of inbound model audio.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// `clamp(round(sample * 32768), -32768, 32767)`.
///
/// Out-of-range input saturates instead of wrapping. NaN maps to 0.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn encode_pcm16_le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// # Errors
/// `NovaError::Decode` when `bytes` is not a whole number of samples.
pub fn decode_pcm16_le(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(NovaError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    B64.decode(data.trim())
        .map_err(|e| NovaError::Decode(format!("invalid base64 audio: {e}")))
}
