//! `LiveEngine` — top-level live session controller.
//!
//! ## Lifecycle
//!
//! ```text
//! LiveEngine::new()
//!     └─► start()   status = Opening
//!           credential check → microphone open → transport connect
//!           → capture bound to transport → inbound event task → status = Open
//!         └─► stop() / remote close / transport error
//!               status = Closing (Error first on failure) → Closed
//! ```
//!
//! `stop()` is idempotent and re-entrant: the session is taken out of its
//! slot under the lock and torn down outside it, so a second caller (the
//! inbound task reacting to the close it just caused, an error handler, a
//! bridge callback) finds the slot empty and returns.
//!
//! ## Threading
//!
//! Capture runs on a `spawn_blocking` thread (see [`pipeline`]). Inbound
//! messages are dispatched in arrival order by one Tokio task per session.
//! Each session carries a generation number; the inbound task checks it
//! before every dispatch so a task outliving its session can never touch
//! a newer one.

pub mod pipeline;
pub mod prompt;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    audio::{output::AudioOutput, pcm, MicrophoneSource},
    error::{NovaError, Result},
    ipc::{
        bridge::MessageBridge,
        events::{
            AudioActivityEvent, ChatEntry, SessionStatus, SessionStatusEvent, TranscriptDirection,
            TranscriptEvent,
        },
    },
    playback::stream::StreamScheduler,
    transport::{LiveConnector, LiveEvent, SetupRequest, TransportEvent, TransportSender},
};

use pipeline::{CaptureConfig, CaptureHandle, PipelineDiagnostics};

/// Broadcast channel capacity for status, transcript and activity events.
const BROADCAST_CAP: usize = 256;

/// User-side entry text when transcripts are not persisted (or empty).
pub const USER_TURN_PLACEHOLDER: &str = "Voice Interaction Complete";
/// Assistant-side counterpart of [`USER_TURN_PLACEHOLDER`].
pub const ASSISTANT_TURN_PLACEHOLDER: &str = "Live Dialogue Finalized";

/// Default live model.
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Configuration for `LiveEngine`.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Outbound frame rate (Hz). Default: 16000.
    pub input_sample_rate: u32,
    /// Inbound audio rate (Hz). Default: 24000.
    pub output_sample_rate: u32,
    /// Samples per outbound frame. Default: 4096.
    pub frame_samples: usize,
    pub model: String,
    /// Facts appended to the system instruction of every session.
    pub memories: Vec<String>,
    /// Use accumulated transcript text for turn-complete entries instead of
    /// the fixed placeholders. Default: true.
    pub persist_transcripts: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: pcm::INPUT_SAMPLE_RATE,
            output_sample_rate: pcm::OUTPUT_SAMPLE_RATE,
            frame_samples: 4096,
            model: DEFAULT_LIVE_MODEL.to_owned(),
            memories: Vec::new(),
            persist_transcripts: true,
        }
    }
}

/// Collaborators a live engine drives.
pub struct LiveServices {
    pub connector: Arc<dyn LiveConnector>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub output: Arc<dyn AudioOutput>,
    pub bridge: Arc<dyn MessageBridge>,
}

/// Per-invocation state, owned exclusively by the engine's session slot.
struct LiveSession {
    generation: u64,
    sender: Arc<dyn TransportSender>,
    capture: CaptureHandle,
    scheduler: Arc<StreamScheduler>,
    event_task: tokio::task::JoinHandle<()>,
}

/// Transcripts of the turn in progress. Owned by the inbound task.
#[derive(Debug, Default)]
struct TurnTranscripts {
    input: String,
    output: String,
}

struct EngineInner {
    config: LiveConfig,
    services: LiveServices,
    session: Mutex<Option<LiveSession>>,
    generation: AtomicU64,
    status: Mutex<SessionStatus>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    transcript_seq: AtomicU64,
    activity_seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
}

/// The live session controller.
///
/// `LiveEngine` is `Send + Sync`; share it behind an `Arc`. Dropping it
/// stops any running session.
pub struct LiveEngine {
    inner: Arc<EngineInner>,
}

impl LiveEngine {
    pub fn new(config: LiveConfig, services: LiveServices) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            inner: Arc::new(EngineInner {
                config,
                services,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                status: Mutex::new(SessionStatus::Closed),
                status_tx,
                transcript_tx,
                activity_tx,
                transcript_seq: AtomicU64::new(0),
                activity_seq: Arc::new(AtomicU64::new(0)),
                diagnostics: Arc::new(PipelineDiagnostics::default()),
            }),
        }
    }

    /// Open a live session.
    ///
    /// Returns once the transport is open and capture is bound to it.
    ///
    /// # Errors
    /// - `NovaError::AlreadyRunning` while a session is opening or open.
    /// - `NovaError::MissingCredential` for a blank credential; nothing is opened.
    /// - `NovaError::DeviceUnavailable` when the microphone cannot be opened.
    /// - `NovaError::Transport` when the connection fails (the microphone is
    ///   released again) or `stop()` ran while opening.
    pub async fn start(&self, credential: &str, system_prompt: &str, voice: &str) -> Result<()> {
        let inner = &self.inner;
        let credential = credential.trim();

        let generation = {
            let mut status = inner.status.lock();
            if status.is_active() {
                return Err(NovaError::AlreadyRunning);
            }
            if credential.is_empty() {
                warn!("live start refused: no credential configured");
                return Err(NovaError::MissingCredential);
            }
            *status = SessionStatus::Opening;
            inner.publish_status(SessionStatus::Opening, None);
            inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let span = info_span!("live_session", generation);
        self.open_session(generation, credential, system_prompt, voice)
            .instrument(span)
            .await
    }

    async fn open_session(
        &self,
        generation: u64,
        credential: &str,
        system_prompt: &str,
        voice: &str,
    ) -> Result<()> {
        let inner = &self.inner;
        let config = &inner.config;

        let capture = match pipeline::start_capture(
            Arc::clone(&inner.services.microphone),
            CaptureConfig {
                target_sample_rate: config.input_sample_rate,
                frame_samples: config.frame_samples,
            },
            inner.activity_tx.clone(),
            Arc::clone(&inner.activity_seq),
            Arc::clone(&inner.diagnostics),
        )
        .await
        {
            Ok(capture) => capture,
            Err(e) => {
                inner.abort_start(generation, &e);
                return Err(e);
            }
        };

        let instruction = prompt::build_system_instruction(system_prompt, &config.memories);
        let setup = SetupRequest::audio(config.model.clone(), instruction, voice.to_owned());
        let link = match inner.services.connector.connect(credential, &setup).await {
            Ok(link) => link,
            Err(e) => {
                capture.stop();
                let e = match e {
                    NovaError::Transport(_) => e,
                    other => NovaError::Transport(other.to_string()),
                };
                inner.abort_start(generation, &e);
                return Err(e);
            }
        };

        let scheduler = Arc::new(StreamScheduler::new(
            Arc::clone(&inner.services.output),
            config.output_sample_rate,
        ));

        let mut slot = inner.session.lock();
        if inner.generation.load(Ordering::SeqCst) != generation {
            drop(slot);
            link.sender.close();
            capture.stop();
            debug!("live start superseded by stop");
            return Err(NovaError::Transport(
                "live session stopped while opening".into(),
            ));
        }
        if let Err(e) = capture.bind(Arc::clone(&link.sender)) {
            drop(slot);
            link.sender.close();
            let e = NovaError::DeviceUnavailable(format!("capture ended before streaming: {e}"));
            inner.abort_start(generation, &e);
            return Err(e);
        }

        let event_task = tokio::spawn(
            run_events(
                Arc::clone(inner),
                generation,
                link.events,
                Arc::clone(&scheduler),
            )
            .instrument(tracing::Span::current()),
        );
        *slot = Some(LiveSession {
            generation,
            sender: link.sender,
            capture,
            scheduler,
            event_task,
        });
        inner.set_status(SessionStatus::Open, None);
        drop(slot);

        info!(model = %config.model, voice, "live session open");
        Ok(())
    }

    /// Close the session. Safe in any state, from any thread, any number
    /// of times.
    pub fn stop(&self) {
        self.inner.teardown(None, None, true);
    }

    /// Current session status (snapshot).
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.inner.transcript_tx.subscribe()
    }

    /// Live microphone level.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.inner.activity_tx.subscribe()
    }

    /// Snapshot of capture counters for observability.
    pub fn pipeline_diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.inner.diagnostics.snapshot()
    }

    /// Chunks currently scheduled or playing (0 without a session).
    pub fn active_playback(&self) -> usize {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(0, |s| s.scheduler.active_count())
    }

    pub fn config(&self) -> &LiveConfig {
        &self.inner.config
    }
}

impl Drop for LiveEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl EngineInner {
    /// Tear down the current session.
    ///
    /// `only` restricts teardown to one generation (used by the inbound task,
    /// which must never close a newer session). `failure` publishes `Error`
    /// with that detail before `Closing`.
    fn teardown(&self, only: Option<u64>, failure: Option<String>, abort_task: bool) {
        let session = {
            let mut slot = self.session.lock();
            if let Some(generation) = only {
                match slot.as_ref() {
                    Some(s) if s.generation == generation => {}
                    _ => return,
                }
            } else {
                // Cancels an in-flight start and orphans any inbound task.
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            slot.take()
        };

        let Some(session) = session else {
            // No session: only an in-flight start can be pending. It sees the
            // generation bump and cleans up after itself.
            let mut status = self.status.lock();
            if *status == SessionStatus::Opening {
                *status = SessionStatus::Closed;
                self.publish_status(SessionStatus::Closed, Some("stopped while opening".into()));
            }
            return;
        };

        if only.is_some() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(detail) = failure {
            warn!(generation = session.generation, "live session failed: {detail}");
            self.set_status(SessionStatus::Error, Some(detail));
        }
        self.set_status(SessionStatus::Closing, None);

        session.sender.close();
        let cut = session.scheduler.close();
        session.capture.stop();
        if abort_task {
            session.event_task.abort();
        }

        self.set_status(SessionStatus::Closed, None);
        let (chunks, interruptions) = session.scheduler.counters();
        info!(
            generation = session.generation,
            cut,
            chunks,
            interruptions = interruptions.saturating_sub(1),
            "live session closed"
        );
    }

    /// Report a failed start, unless a stop already superseded it.
    fn abort_start(&self, generation: u64, error: &NovaError) {
        let mut status = self.status.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *status = SessionStatus::Error;
        self.publish_status(SessionStatus::Error, Some(error.to_string()));
        *status = SessionStatus::Closed;
        self.publish_status(SessionStatus::Closed, None);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_status(&self, new_status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        self.publish_status(new_status, detail);
    }

    fn publish_status(&self, status: SessionStatus, detail: Option<String>) {
        let _ = self.status_tx.send(SessionStatusEvent { status, detail });
    }

    fn dispatch(&self, scheduler: &StreamScheduler, turn: &mut TurnTranscripts, event: LiveEvent) {
        match event {
            LiveEvent::InputTranscript(delta) => {
                turn.input.push_str(&delta);
                self.emit_transcript(TranscriptDirection::Input, delta, &turn.input);
            }
            LiveEvent::OutputTranscript(delta) => {
                turn.output.push_str(&delta);
                self.emit_transcript(TranscriptDirection::Output, delta, &turn.output);
            }
            LiveEvent::Interrupted => {
                let cut = scheduler.flush();
                info!(cut, "model interrupted, playback flushed");
            }
            LiveEvent::Audio(data) => {
                let placed = pcm::decode_base64(&data).and_then(|bytes| scheduler.enqueue_pcm(&bytes));
                if let Err(e) = placed {
                    warn!("dropping inbound audio chunk: {e}");
                }
            }
            LiveEvent::TurnComplete => {
                let finished = std::mem::take(turn);
                let (user_text, assistant_text) = if self.config.persist_transcripts {
                    (
                        non_empty_or(finished.input, USER_TURN_PLACEHOLDER),
                        non_empty_or(finished.output, ASSISTANT_TURN_PLACEHOLDER),
                    )
                } else {
                    (
                        USER_TURN_PLACEHOLDER.to_owned(),
                        ASSISTANT_TURN_PLACEHOLDER.to_owned(),
                    )
                };
                let (user, assistant) = ChatEntry::turn_pair(user_text, assistant_text);
                debug!(user_id = %user.id, "turn complete");
                self.services.bridge.on_turn_complete(user, assistant);
            }
        }
    }

    fn emit_transcript(&self, direction: TranscriptDirection, delta: String, text: &str) {
        self.services.bridge.on_transcript_delta(direction, &delta);
        let seq = self.transcript_seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.transcript_tx.send(TranscriptEvent {
            seq,
            direction,
            delta,
            text: text.to_owned(),
        });
    }
}

fn non_empty_or(text: String, placeholder: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        placeholder.to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Inbound event loop for one session generation.
async fn run_events(
    inner: Arc<EngineInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    scheduler: Arc<StreamScheduler>,
) {
    let mut turn = TurnTranscripts::default();
    while let Some(event) = events.recv().await {
        if !inner.is_current(generation) {
            debug!(generation, "stale session event ignored");
            return;
        }
        match event {
            TransportEvent::Message(message) => {
                for live_event in message.into_events() {
                    // A bridge callback may have stopped the session mid-message.
                    if !inner.is_current(generation) {
                        debug!(generation, "session ended while dispatching");
                        return;
                    }
                    inner.dispatch(&scheduler, &mut turn, live_event);
                }
            }
            TransportEvent::Error(detail) => {
                inner.teardown(Some(generation), Some(detail), false);
                return;
            }
            TransportEvent::Closed(reason) => {
                info!(reason = reason.as_deref().unwrap_or(""), "live transport closed by remote");
                inner.teardown(Some(generation), None, false);
                return;
            }
        }
    }
    // Stream ended without an explicit close.
    inner.teardown(Some(generation), None, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_wire_rates() {
        let config = LiveConfig::default();
        assert_eq!(config.input_sample_rate, 16_000);
        assert_eq!(config.output_sample_rate, 24_000);
        assert_eq!(config.frame_samples, 4096);
        assert!(config.persist_transcripts);
    }

    #[test]
    fn empty_transcript_falls_back_to_placeholder() {
        assert_eq!(non_empty_or("  ".into(), USER_TURN_PLACEHOLDER), USER_TURN_PLACEHOLDER);
        assert_eq!(non_empty_or(" hi ".into(), USER_TURN_PLACEHOLDER), "hi");
    }
}
