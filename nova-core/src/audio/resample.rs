//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Microphones capture at the device's native rate (commonly 44.1 or 48 kHz).
//! The live endpoint expects 16 kHz mono. `RateConverter` bridges that gap
//! on the capture pipeline thread, where allocation is allowed.
//!
//! When capture rate == target rate no rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{NovaError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when capture rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer — holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `capture_rate`: Sample rate of the incoming audio (Hz).
    /// - `target_rate`: Sample rate expected on the wire (Hz).
    /// - `chunk_size`: Input frame count per rubato call (e.g. `1024`).
    ///
    /// # Errors
    /// Returns `NovaError::AudioStream` if rubato fails to initialise.
    pub fn new(capture_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / capture_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| NovaError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::info!(capture_rate, target_rate, chunk_size, max_out, "capture resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call.
    ///
    /// In passthrough mode (same rates), input is returned directly.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Returns `true` when capture rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_rates_pass_samples_through() {
        let mut rc = RateConverter::new(16_000, 16_000, 1024).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..700).map(|i| (i as f32 * 0.01).sin()).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn downsampling_48k_yields_a_third() {
        let mut rc = RateConverter::new(48_000, 16_000, 1024).unwrap();
        let out = rc.process(&vec![0.0f32; 3 * 1024]);
        let expected = 1024usize;
        assert!(
            (out.len() as isize - expected as isize).unsigned_abs() <= 16,
            "output len={} expected≈{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn short_input_waits_for_a_full_block() {
        let mut rc = RateConverter::new(44_100, 16_000, 1024).unwrap();
        assert!(rc.process(&vec![0.0f32; 600]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 600]).is_empty());
    }
}
