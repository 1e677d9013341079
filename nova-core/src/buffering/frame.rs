//! Outbound microphone frames and the accumulator that cuts them.

use crate::audio::pcm;

/// A fixed-length block of 16-bit PCM at the wire input rate.
///
/// Immutable once built. Ownership moves into the outbound message on send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Convert f32 samples with explicit clamping (never wraps).
    pub fn from_f32(samples: &[f32]) -> Self {
        Self {
            samples: samples.iter().copied().map(pcm::f32_to_i16).collect(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Little-endian byte view, base64-encoded for the wire.
    pub fn to_base64(&self) -> String {
        pcm::encode_base64(&pcm::encode_pcm16_le(&self.samples))
    }
}

/// Accumulates resampled audio and yields full frames of `frame_samples`.
#[derive(Debug)]
pub struct Framer {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples and drain every complete frame.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            frames.push(AudioFrame::from_f32(&self.pending[..self.frame_samples]));
            self.pending.drain(..self.frame_samples);
        }
        frames
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_cuts_exact_frames_and_keeps_remainder() {
        let mut framer = Framer::new(4096);
        assert!(framer.push(&vec![0.1; 3000]).is_empty());
        let frames = framer.push(&vec![0.1; 6000]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 4096));
        assert_eq!(framer.pending(), 9000 - 8192);
    }

    #[test]
    fn frame_base64_is_little_endian_pcm() {
        let frame = AudioFrame::from_f32(&[0.5, -1.0]);
        assert_eq!(frame.samples(), &[16384, -32768]);
        // [0x00, 0x40, 0x00, 0x80]
        assert_eq!(frame.to_base64(), "AEAAgA==");
    }
}
