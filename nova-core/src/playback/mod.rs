//! Output-side controllers built on [`crate::audio::output::AudioOutput`].
//!
//! - [`stream::StreamScheduler`]: gapless queue for streamed live audio.
//! - [`turn::TurnPlayer`]: play/pause/resume/stop for one synthesized message.

pub mod stream;
pub mod turn;

pub use stream::{ScheduledChunk, SchedulerPhase, StreamScheduler};
pub use turn::TurnPlayer;
