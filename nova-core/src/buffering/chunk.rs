//! Typed audio units moving through capture and playback.

use std::sync::Arc;

use crate::audio::pcm;
use crate::error::Result;

/// A contiguous block of mono PCM samples at a known sample rate.
///
/// This is the playable unit handed to an [`AudioOutput`](crate::audio::output::AudioOutput).
/// Samples sit behind an `Arc` so the mixer and the controller that scheduled
/// the chunk can share it without copying.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz (e.g. 16000, 24000, 48000).
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Decode little-endian 16-bit mono PCM.
    ///
    /// # Errors
    /// `NovaError::Decode` when the byte length is odd.
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32) -> Result<Self> {
        Self::from_pcm16_interleaved(bytes, sample_rate, 1)
    }

    /// Decode little-endian 16-bit PCM with `channels` interleaved channels,
    /// down-mixing to mono.
    pub fn from_pcm16_interleaved(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<Self> {
        let ints = pcm::decode_pcm16_le(bytes)?;
        let floats: Vec<f32> = ints.iter().copied().map(pcm::i16_to_f32).collect();
        Ok(Self::from_interleaved(&floats, sample_rate, channels))
    }

    /// Build a mono chunk from interleaved samples. A trailing partial frame
    /// is dropped.
    pub fn from_interleaved(samples: &[f32], sample_rate: u32, channels: u16) -> Self {
        let ch = channels.max(1) as usize;
        if ch == 1 {
            return Self::new(samples.to_vec(), sample_rate);
        }
        let mono = samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect();
        Self::new(mono, sample_rate)
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
