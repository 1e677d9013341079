//! # nova-core
//!
//! Realtime voice core of Nova Agent OS.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → MicrophoneSource → SPSC RingBuffer → capture pipeline (spawn_blocking)
//!                                                        │ resample → 4096-sample frames
//!                                                        ▼
//!                                              TransportSender::send ──► hosted model
//!                                                                             │
//!   MessageBridge ◄── transcripts / turn complete ◄── inbound task ◄──────────┘
//!   StreamScheduler ◄── audio chunks, interrupted ◄──┘
//!        │
//!        ▼
//!   AudioOutput (cpal mixer / simulated clock)
//! ```
//!
//! `TurnPlayer` drives the same `AudioOutput` for turn-based speech
//! (play/pause/resume/stop/volume).
//!
//! The capture callback is zero-alloc. All heap work happens on the
//! pipeline thread and the inbound task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::output::{AudioOutput, Gain, VoiceId, VoiceRequest};
pub use audio::sim::ManualOutput;
pub use audio::speaker::CpalOutput;
pub use audio::{CpalMicrophone, MicrophoneSource};
pub use buffering::chunk::AudioChunk;
pub use engine::{LiveConfig, LiveEngine, LiveServices};
pub use error::{NovaError, Result};
pub use ipc::bridge::{HistoryBridge, MessageBridge};
pub use ipc::events::{
    AudioActivityEvent, ChatEntry, ChatRole, PlaybackStatusEvent, SessionStatus,
    SessionStatusEvent, TranscriptDirection, TranscriptEvent, TurnState,
};
pub use playback::{StreamScheduler, TurnPlayer};
pub use transport::{LiveConnector, TransportSender};

#[cfg(feature = "ws")]
pub use transport::ws::WsConnector;
