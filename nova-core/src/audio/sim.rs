//! `ManualOutput` — simulated output context with an explicitly advanced clock.
//!
//! Nothing sounds; the backend only tracks when each voice would start and
//! stop. Tests drive time with [`ManualOutput::advance`], which also delivers
//! end callbacks for voices that finished, exactly like the real backend's
//! completion thread would.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::output::{AudioOutput, EndCallback, Gain, VoiceId, VoiceRequest};

/// Observable record of one scheduled voice.
#[derive(Debug, Clone)]
pub struct SimVoice {
    pub id: VoiceId,
    /// Clock time sound begins (never earlier than the time it was scheduled).
    pub start_at: f64,
    pub offset: f64,
    /// Seconds of sound if left alone.
    pub audible_secs: f64,
    /// Clock time of a forced stop, if any.
    pub stopped_at: Option<f64>,
    pub ended: bool,
    pub gain: Option<Gain>,
}

impl SimVoice {
    /// Natural end time.
    pub fn natural_end(&self) -> f64 {
        self.start_at + self.audible_secs
    }

    /// Whether the voice is producing sound at time `t`.
    pub fn is_sounding_at(&self, t: f64) -> bool {
        let end = match self.stopped_at {
            Some(stop) => stop.min(self.natural_end()),
            None => self.natural_end(),
        };
        t >= self.start_at && t < end
    }
}

#[derive(Default)]
struct SimState {
    now: f64,
    next_id: VoiceId,
    voices: Vec<SimVoice>,
    callbacks: HashMap<VoiceId, EndCallback>,
    ended: VecDeque<VoiceId>,
}

/// Simulated [`AudioOutput`].
#[derive(Default)]
pub struct ManualOutput {
    state: Mutex<SimState>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `secs`, end every voice whose natural end
    /// has been reached, then deliver pending end callbacks.
    pub fn advance(&self, secs: f64) {
        {
            let mut st = self.state.lock();
            st.now += secs.max(0.0);
            let now = st.now;
            let mut finished = Vec::new();
            for voice in st.voices.iter_mut() {
                if !voice.ended && voice.natural_end() <= now {
                    voice.ended = true;
                    finished.push(voice.id);
                }
            }
            st.ended.extend(finished);
        }
        self.pump();
    }

    /// Deliver pending end callbacks (from forced stops or finished voices).
    ///
    /// Callbacks run without the internal lock held, so they may call back
    /// into this output.
    pub fn pump(&self) {
        loop {
            let next = {
                let mut st = self.state.lock();
                st.ended
                    .pop_front()
                    .map(|id| (id, st.callbacks.remove(&id)))
            };
            match next {
                Some((id, Some(callback))) => callback(id),
                Some((_, None)) => {}
                None => break,
            }
        }
    }

    pub fn voice(&self, id: VoiceId) -> Option<SimVoice> {
        self.state.lock().voices.iter().find(|v| v.id == id).cloned()
    }

    pub fn voices(&self) -> Vec<SimVoice> {
        self.state.lock().voices.clone()
    }

    /// Voices producing sound at the current clock time.
    pub fn sounding_now(&self) -> Vec<VoiceId> {
        let st = self.state.lock();
        let now = st.now;
        st.voices
            .iter()
            .filter(|v| !v.ended && v.is_sounding_at(now))
            .map(|v| v.id)
            .collect()
    }

    /// Voices that have not ended yet (sounding or still waiting to start).
    pub fn live_voices(&self) -> Vec<VoiceId> {
        self.state
            .lock()
            .voices
            .iter()
            .filter(|v| !v.ended)
            .map(|v| v.id)
            .collect()
    }
}

impl AudioOutput for ManualOutput {
    fn now(&self) -> f64 {
        self.state.lock().now
    }

    fn play(&self, request: VoiceRequest) -> VoiceId {
        let mut st = self.state.lock();
        st.next_id += 1;
        let id = st.next_id;
        let audible_secs = request.audible_secs();
        let start_at = request.start_at.max(st.now);
        st.voices.push(SimVoice {
            id,
            start_at,
            offset: request.offset,
            audible_secs,
            stopped_at: None,
            ended: false,
            gain: request.gain,
        });
        if let Some(callback) = request.on_end {
            st.callbacks.insert(id, callback);
        }
        id
    }

    fn stop(&self, id: VoiceId) {
        let mut st = self.state.lock();
        let now = st.now;
        let Some(voice) = st.voices.iter_mut().find(|v| v.id == id) else {
            return;
        };
        if voice.ended {
            return;
        }
        voice.ended = true;
        voice.stopped_at = Some(now);
        st.ended.push_back(id);
    }
}
