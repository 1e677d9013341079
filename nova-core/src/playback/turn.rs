//! `TurnPlayer` — single-buffer player for synthesized speech of one message.
//!
//! ## State machine
//!
//! ```text
//!            speak()                pause()
//!   Idle ───────────────► Playing ─────────► Paused
//!    ▲                     │   ▲                │
//!    │  natural end/stop() │   └──── resume() ──┘
//!    └─────────────────────┘          stop() from any state → Idle
//! ```
//!
//! Every voice the player starts carries a generation number. `pause`,
//! `stop` and `speak` bump the generation, so an end callback from a voice
//! that was superseded finds a mismatch and is ignored.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::audio::output::{AudioOutput, Gain, VoiceId, VoiceRequest};
use crate::buffering::chunk::AudioChunk;
use crate::error::{NovaError, Result};
use crate::ipc::events::{PlaybackStatusEvent, TurnState};

const STATUS_CAP: usize = 32;

#[derive(Debug)]
struct TurnPlaybackState {
    buffer: Option<AudioChunk>,
    voice: Option<VoiceId>,
    state: TurnState,
    pause_offset: f64,
    start_clock: f64,
    generation: u64,
}

impl Default for TurnPlaybackState {
    fn default() -> Self {
        Self {
            buffer: None,
            voice: None,
            state: TurnState::Idle,
            pause_offset: 0.0,
            start_clock: 0.0,
            generation: 0,
        }
    }
}

/// Turn-based playback controller.
pub struct TurnPlayer {
    output: Arc<dyn AudioOutput>,
    gain: Gain,
    state: Arc<Mutex<TurnPlaybackState>>,
    status_tx: broadcast::Sender<PlaybackStatusEvent>,
}

impl TurnPlayer {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CAP);
        Self {
            output,
            gain: Gain::default(),
            state: Arc::new(Mutex::new(TurnPlaybackState::default())),
            status_tx,
        }
    }

    /// Play `buffer` from the start, stopping whatever was playing.
    pub fn speak(&self, buffer: AudioChunk) {
        let mut st = self.state.lock();
        if let Some(voice) = st.voice.take() {
            self.output.stop(voice);
        }
        st.buffer = Some(buffer);
        st.pause_offset = 0.0;
        self.start_voice(&mut st, 0.0);
        debug!(generation = st.generation, "turn playback started");
        self.publish(&st);
    }

    /// # Errors
    /// `NovaError::PlaybackState` unless currently `Playing`. State is unchanged.
    pub fn pause(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.state != TurnState::Playing {
            return Err(invalid("pause", st.state));
        }
        let duration = st.buffer.as_ref().map_or(0.0, AudioChunk::duration_secs);
        let offset = (self.output.now() - st.start_clock).clamp(0.0, duration);
        st.generation += 1;
        if let Some(voice) = st.voice.take() {
            self.output.stop(voice);
        }
        st.pause_offset = offset;
        st.state = TurnState::Paused;
        debug!(offset, "turn playback paused");
        self.publish(&st);
        Ok(())
    }

    /// # Errors
    /// `NovaError::PlaybackState` unless currently `Paused`. State is unchanged.
    pub fn resume(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.state != TurnState::Paused || st.buffer.is_none() {
            return Err(invalid("resume", st.state));
        }
        let offset = st.pause_offset;
        self.start_voice(&mut st, offset);
        debug!(offset, "turn playback resumed");
        self.publish(&st);
        Ok(())
    }

    /// Stop and forget the buffer. Safe in any state, including `Idle`.
    pub fn stop(&self) {
        let mut st = self.state.lock();
        let was = st.state;
        st.generation += 1;
        if let Some(voice) = st.voice.take() {
            self.output.stop(voice);
        }
        st.buffer = None;
        st.state = TurnState::Idle;
        st.pause_offset = 0.0;
        if was != TurnState::Idle {
            self.publish(&st);
        }
    }

    /// Set the volume in [0, 1]. Applies to in-progress playback immediately.
    pub fn set_volume(&self, volume: f32) {
        self.gain.set(volume);
    }

    pub fn volume(&self) -> f32 {
        self.gain.get()
    }

    pub fn state(&self) -> TurnState {
        self.state.lock().state
    }

    /// Seconds of the current buffer played so far.
    pub fn position(&self) -> f64 {
        let st = self.state.lock();
        self.position_locked(&st)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackStatusEvent> {
        self.status_tx.subscribe()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Start a voice from `offset` under a fresh generation. Caller holds the lock.
    fn start_voice(&self, st: &mut TurnPlaybackState, offset: f64) {
        let Some(buffer) = st.buffer.clone() else {
            return;
        };
        st.generation += 1;
        let generation = st.generation;
        let now = self.output.now();
        let weak = Arc::downgrade(&self.state);
        let status_tx = self.status_tx.clone();
        let request = VoiceRequest::new(buffer, now)
            .offset(offset)
            .gain(self.gain.clone())
            .on_end(move |_| on_voice_end(&weak, generation, &status_tx));
        st.voice = Some(self.output.play(request));
        st.start_clock = now - offset;
        st.state = TurnState::Playing;
    }

    fn position_locked(&self, st: &TurnPlaybackState) -> f64 {
        match st.state {
            TurnState::Idle => 0.0,
            TurnState::Paused => st.pause_offset,
            TurnState::Playing => {
                let duration = st.buffer.as_ref().map_or(0.0, AudioChunk::duration_secs);
                (self.output.now() - st.start_clock).clamp(0.0, duration)
            }
        }
    }

    fn publish(&self, st: &TurnPlaybackState) {
        let _ = self.status_tx.send(PlaybackStatusEvent {
            state: st.state,
            position_secs: self.position_locked(st),
        });
    }
}

fn on_voice_end(
    state: &Weak<Mutex<TurnPlaybackState>>,
    generation: u64,
    status_tx: &broadcast::Sender<PlaybackStatusEvent>,
) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut st = state.lock();
    if st.generation != generation || st.state != TurnState::Playing {
        debug!(generation, current = st.generation, "stale turn completion ignored");
        return;
    }
    st.state = TurnState::Idle;
    st.voice = None;
    st.pause_offset = 0.0;
    let position_secs = st.buffer.as_ref().map_or(0.0, AudioChunk::duration_secs);
    debug!("turn playback finished");
    let _ = status_tx.send(PlaybackStatusEvent {
        state: TurnState::Idle,
        position_secs,
    });
}

fn invalid(action: &'static str, state: TurnState) -> NovaError {
    NovaError::PlaybackState {
        action,
        state: state.as_str(),
    }
}
