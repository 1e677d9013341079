//! Gapless scheduler for streamed model audio.
//!
//! ## Scheduling rule
//!
//! ```text
//! start    = max(cursor, output.now())
//! cursor  := start + chunk.duration
//! ```
//!
//! When the producer keeps up, every chunk starts exactly where the previous
//! one ends. When it falls behind, the next chunk starts "now" and the gap is
//! not carried forward.
//!
//! ## Interruption
//!
//! `flush()` stops every active voice, empties the active set and unsets the
//! cursor, all under the same lock `enqueue` takes. Nothing scheduled against
//! the old cursor can sound after `flush` returns.
//!
//! `close()` is a final flush: once it returns the scheduler refuses every
//! further chunk, so audio decoded after a session ended never plays.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::audio::output::{AudioOutput, VoiceId, VoiceRequest};
use crate::buffering::chunk::AudioChunk;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Nothing scheduled.
    Idle,
    /// At least one chunk is playing or waiting to play.
    Scheduling,
}

/// Where and when one enqueued chunk was placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: VoiceId,
    pub start_at: f64,
    pub duration: f64,
}

#[derive(Debug, Default)]
struct ScheduleState {
    /// Output-clock time for the next chunk. `0.0` means unset.
    cursor: f64,
    active: HashSet<VoiceId>,
    enqueued: u64,
    flushes: u64,
    closed: bool,
}

/// Streaming playback scheduler for one live session.
pub struct StreamScheduler {
    output: Arc<dyn AudioOutput>,
    sample_rate: u32,
    state: Arc<Mutex<ScheduleState>>,
}

impl StreamScheduler {
    /// `sample_rate` is the rate of incoming PCM (24 kHz for live audio).
    pub fn new(output: Arc<dyn AudioOutput>, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            state: Arc::new(Mutex::new(ScheduleState::default())),
        }
    }

    /// Decode raw 16-bit little-endian mono PCM and schedule it.
    ///
    /// Returns `Ok(None)` for an empty payload or a closed scheduler.
    ///
    /// # Errors
    /// `NovaError::Decode` for malformed bytes; scheduler state is untouched.
    pub fn enqueue_pcm(&self, bytes: &[u8]) -> Result<Option<ScheduledChunk>> {
        let chunk = AudioChunk::from_pcm16_le(bytes, self.sample_rate)?;
        if chunk.is_empty() {
            return Ok(None);
        }
        Ok(self.enqueue(chunk))
    }

    /// Schedule an already-decoded chunk right after the previous one.
    /// `None` once the scheduler is closed.
    pub fn enqueue(&self, chunk: AudioChunk) -> Option<ScheduledChunk> {
        let duration = chunk.duration_secs();
        let mut st = self.state.lock();
        if st.closed {
            trace!(duration, "chunk dropped: scheduler closed");
            return None;
        }

        let start_at = st.cursor.max(self.output.now());
        let weak: Weak<Mutex<ScheduleState>> = Arc::downgrade(&self.state);
        let id = self
            .output
            .play(VoiceRequest::new(chunk, start_at).on_end(move |id| {
                if let Some(state) = weak.upgrade() {
                    state.lock().active.remove(&id);
                }
            }));

        st.active.insert(id);
        st.cursor = start_at + duration;
        st.enqueued += 1;
        trace!(id, start_at, duration, cursor = st.cursor, "chunk scheduled");

        Some(ScheduledChunk {
            id,
            start_at,
            duration,
        })
    }

    /// Stop everything and reset the cursor. Returns how many chunks were cut.
    pub fn flush(&self) -> usize {
        let mut st = self.state.lock();
        self.flush_locked(&mut st)
    }

    /// Flush and refuse all later chunks. Idempotent.
    pub fn close(&self) -> usize {
        let mut st = self.state.lock();
        st.closed = true;
        self.flush_locked(&mut st)
    }

    fn flush_locked(&self, st: &mut ScheduleState) -> usize {
        let cut = st.active.len();
        for id in st.active.drain() {
            self.output.stop(id);
        }
        st.cursor = 0.0;
        st.flushes += 1;
        if cut > 0 {
            debug!(cut, "playback flushed");
        }
        cut
    }

    /// Clock time the next chunk would start at if the producer keeps up.
    /// `0.0` when unset.
    pub fn cursor(&self) -> f64 {
        self.state.lock().cursor
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_active(&self, id: VoiceId) -> bool {
        self.state.lock().active.contains(&id)
    }

    pub fn phase(&self) -> SchedulerPhase {
        if self.state.lock().active.is_empty() {
            SchedulerPhase::Idle
        } else {
            SchedulerPhase::Scheduling
        }
    }

    /// `(chunks enqueued, flushes)` since creation.
    pub fn counters(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.enqueued, st.flushes)
    }
}
