//! Output-side audio abstraction: a clock plus schedulable voices.
//!
//! An [`AudioOutput`] models a hardware output context. Callers schedule a
//! [`AudioChunk`] to start at an absolute clock time (optionally from an
//! offset into the chunk, optionally through a live [`Gain`]) and may stop it
//! at any time. Every voice ends exactly once, either naturally or by `stop`,
//! and its end callback then runs.
//!
//! ## Callback contract
//!
//! End callbacks are **never** invoked from inside `play` or `stop`. They
//! run later on a backend-owned thread (cpal) or from an explicit pump
//! (simulation). Controllers rely on this to call `play`/`stop` while holding
//! their own state lock.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crate::buffering::chunk::AudioChunk;

/// Identifier of one scheduled voice, unique per output.
pub type VoiceId = u64;

/// Runs once when the voice stops sounding (naturally or forced).
pub type EndCallback = Box<dyn FnOnce(VoiceId) + Send + 'static>;

/// Live volume control shared between a controller and the mixer.
///
/// Stored as `f32` bits in an atomic so the audio callback can read it
/// without locking.
#[derive(Debug, Clone)]
pub struct Gain(Arc<AtomicU32>);

impl Gain {
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(clamp_volume(value).to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Set a new level in [0, 1]; out-of-range values are clamped.
    pub fn set(&self, value: f32) {
        self.0
            .store(clamp_volume(value).to_bits(), Ordering::Relaxed);
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn clamp_volume(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Everything needed to start one voice.
pub struct VoiceRequest {
    pub chunk: AudioChunk,
    /// Absolute output-clock time (seconds) at which sound begins.
    /// Times in the past start immediately.
    pub start_at: f64,
    /// Seconds into `chunk` to begin from.
    pub offset: f64,
    pub gain: Option<Gain>,
    pub on_end: Option<EndCallback>,
}

impl VoiceRequest {
    pub fn new(chunk: AudioChunk, start_at: f64) -> Self {
        Self {
            chunk,
            start_at,
            offset: 0.0,
            gain: None,
            on_end: None,
        }
    }

    pub fn offset(mut self, offset: f64) -> Self {
        self.offset = offset.max(0.0);
        self
    }

    pub fn gain(mut self, gain: Gain) -> Self {
        self.gain = Some(gain);
        self
    }

    pub fn on_end(mut self, callback: impl FnOnce(VoiceId) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(callback));
        self
    }

    /// Seconds of sound this request will produce if left alone.
    pub fn audible_secs(&self) -> f64 {
        (self.chunk.duration_secs() - self.offset).max(0.0)
    }
}

impl std::fmt::Debug for VoiceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceRequest")
            .field("samples", &self.chunk.samples.len())
            .field("sample_rate", &self.chunk.sample_rate)
            .field("start_at", &self.start_at)
            .field("offset", &self.offset)
            .field("has_gain", &self.gain.is_some())
            .finish_non_exhaustive()
    }
}

/// A hardware (or simulated) audio output context.
pub trait AudioOutput: Send + Sync + 'static {
    /// Current output-clock time in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Schedule a voice. Returns immediately.
    fn play(&self, request: VoiceRequest) -> VoiceId;

    /// Force-stop a voice. After return the voice produces no further sound.
    /// Unknown or already-ended ids are ignored.
    fn stop(&self, id: VoiceId);
}
