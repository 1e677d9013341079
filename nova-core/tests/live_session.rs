use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, OnceLock, Weak,
};
use std::time::{Duration, Instant};

use nova_core::audio::{pcm, CaptureStream};
use nova_core::buffering::{AudioProducer, Producer};
use nova_core::ipc::events::{ChatEntry, ChatRole, SessionStatus, TranscriptDirection};
use nova_core::transport::protocol::{InlineData, ModelTurn, Part, ServerContent, Transcription};
use nova_core::transport::stub::ScriptedConnector;
use nova_core::transport::ServerMessage;
use nova_core::{
    HistoryBridge, LiveConfig, LiveEngine, LiveServices, ManualOutput, MessageBridge,
    MicrophoneSource, NovaError,
};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MicCounters {
    opens: AtomicUsize,
    released: AtomicUsize,
}

struct FakeStream {
    counters: Arc<MicCounters>,
}

impl CaptureStream for FakeStream {
    fn sample_rate(&self) -> u32 {
        16_000
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeMic {
    counters: Arc<MicCounters>,
    deny: bool,
}

impl MicrophoneSource for FakeMic {
    fn open(
        &self,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> nova_core::Result<Box<dyn CaptureStream>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(NovaError::DeviceUnavailable("permission denied".into()));
        }
        std::thread::spawn(move || {
            let block = vec![0.1f32; 320];
            while running.load(Ordering::Relaxed) {
                producer.push_slice(&block);
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        Ok(Box::new(FakeStream {
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct Harness {
    engine: LiveEngine,
    connector: ScriptedConnector,
    output: Arc<ManualOutput>,
    bridge: Arc<HistoryBridge>,
    mic: Arc<MicCounters>,
}

fn harness_with(config: LiveConfig, deny_mic: bool) -> Harness {
    let connector = ScriptedConnector::new();
    let output = Arc::new(ManualOutput::new());
    let bridge = Arc::new(HistoryBridge::new());
    let mic = Arc::new(MicCounters::default());
    let engine = LiveEngine::new(
        config,
        LiveServices {
            connector: Arc::new(connector.clone()),
            microphone: Arc::new(FakeMic {
                counters: Arc::clone(&mic),
                deny: deny_mic,
            }),
            output: output.clone(),
            bridge: bridge.clone(),
        },
    );
    Harness {
        engine,
        connector,
        output,
        bridge,
        mic,
    }
}

fn harness() -> Harness {
    harness_with(LiveConfig::default(), false)
}

async fn open(h: &Harness) {
    h.engine
        .start("test-key", "You are Nova Prime.", "Zephyr")
        .await
        .expect("session opens");
    assert_eq!(h.engine.status(), SessionStatus::Open);
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > Duration::from_secs(5) {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn pcm_chunk(secs: f64) -> String {
    let samples = vec![1_000i16; (secs * 24_000.0) as usize];
    pcm::encode_base64(&pcm::encode_pcm16_le(&samples))
}

fn drain_statuses(rx: &mut broadcast::Receiver<nova_core::SessionStatusEvent>) -> Vec<SessionStatus> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev.status);
    }
    out
}

// ---------------------------------------------------------------------------
// Start failures
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_credential_opens_nothing() {
    let h = harness();
    let mut statuses = h.engine.subscribe_status();

    let result = h.engine.start("   ", "prompt", "Zephyr").await;

    assert!(matches!(result, Err(NovaError::MissingCredential)));
    assert!(result.unwrap_err().is_user_actionable());
    assert_eq!(h.mic.opens.load(Ordering::SeqCst), 0);
    assert_eq!(h.connector.connect_count(), 0);
    assert_eq!(h.engine.status(), SessionStatus::Closed);
    assert!(drain_statuses(&mut statuses).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_microphone_fails_before_transport() {
    let h = harness_with(LiveConfig::default(), true);
    let mut statuses = h.engine.subscribe_status();

    let result = h.engine.start("test-key", "prompt", "Zephyr").await;

    assert!(matches!(result, Err(NovaError::DeviceUnavailable(_))));
    assert_eq!(h.connector.connect_count(), 0);
    assert_eq!(h.engine.status(), SessionStatus::Closed);
    assert_eq!(
        drain_statuses(&mut statuses),
        vec![SessionStatus::Opening, SessionStatus::Error, SessionStatus::Closed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_failure_releases_microphone() {
    let h = harness();
    h.connector.fail_next_connect("handshake refused");

    let result = h.engine.start("test-key", "prompt", "Zephyr").await;

    assert!(matches!(result, Err(NovaError::Transport(_))));
    assert_eq!(h.engine.status(), SessionStatus::Closed);
    eventually("microphone release", || h.mic.released.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_while_open_is_rejected() {
    let h = harness();
    open(&h).await;
    let again = h.engine.start("test-key", "prompt", "Zephyr").await;
    assert!(matches!(again, Err(NovaError::AlreadyRunning)));
    assert_eq!(h.connector.connect_count(), 1);
    h.engine.stop();
}

// ---------------------------------------------------------------------------
// Open session
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_request_carries_memories_voice_and_transcription() {
    let config = LiveConfig {
        memories: vec!["Lives in Lisbon".into()],
        ..LiveConfig::default()
    };
    let h = harness_with(config, false);
    open(&h).await;

    let (credential, setup) = h.connector.last_connect().unwrap();
    assert_eq!(credential, "test-key");
    assert_eq!(setup.voice, "Zephyr");
    assert_eq!(setup.response_modalities, vec!["AUDIO".to_string()]);
    assert!(setup.input_audio_transcription && setup.output_audio_transcription);
    assert!(setup.system_instruction.starts_with("You are Nova Prime."));
    assert!(setup
        .system_instruction
        .lines()
        .any(|l| l == "[memory] Lives in Lisbon"));
    h.engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn microphone_frames_reach_the_transport() {
    let h = harness();
    open(&h).await;
    eventually("first frame", || h.connector.sent_count() >= 1).await;
    let frame = &h.connector.sent()[0];
    assert_eq!(frame.media.mime_type, "audio/pcm;rate=16000");
    h.engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transcripts_accumulate_and_turn_complete_emits_pair() {
    let h = harness();
    let mut transcripts = h.engine.subscribe_transcripts();
    open(&h).await;

    h.connector.push(ServerMessage::input_transcript("What's the "));
    h.connector.push(ServerMessage::input_transcript("weather?"));
    h.connector.push(ServerMessage::output_transcript("Sunny."));
    h.connector.push(ServerMessage::turn_complete());

    eventually("turn entries", || h.bridge.history().len() == 2).await;
    let history = h.bridge.history();
    assert_eq!(history[0].role, ChatRole::User);
    assert_eq!(history[0].content, "What's the weather?");
    assert_eq!(history[1].role, ChatRole::Assistant);
    assert_eq!(history[1].content, "Sunny.");

    let deltas = h.bridge.deltas();
    assert_eq!(deltas.len(), 3);
    assert_eq!(deltas[2], (TranscriptDirection::Output, "Sunny.".to_string()));

    let first = transcripts.recv().await.unwrap();
    let second = transcripts.recv().await.unwrap();
    assert_eq!(first.delta, "What's the ");
    assert_eq!(second.text, "What's the weather?");
    assert!(second.seq > first.seq);

    // Transcripts reset per turn; an empty turn falls back to placeholders.
    h.connector.push(ServerMessage::turn_complete());
    eventually("second turn", || h.bridge.history().len() == 4).await;
    let history = h.bridge.history();
    assert_eq!(history[2].content, nova_core::engine::USER_TURN_PLACEHOLDER);
    assert_eq!(history[3].content, nova_core::engine::ASSISTANT_TURN_PLACEHOLDER);
    h.engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn placeholders_used_when_transcripts_not_persisted() {
    let config = LiveConfig {
        persist_transcripts: false,
        ..LiveConfig::default()
    };
    let h = harness_with(config, false);
    open(&h).await;
    h.connector.push(ServerMessage::input_transcript("hello"));
    h.connector.push(ServerMessage::turn_complete());
    eventually("turn entries", || h.bridge.history().len() == 2).await;
    assert_eq!(h.bridge.history()[0].content, "Voice Interaction Complete");
    assert_eq!(h.bridge.history()[1].content, "Live Dialogue Finalized");
    h.engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_audio_plays_back_to_back() {
    let h = harness();
    open(&h).await;

    h.connector.push(ServerMessage::audio(&pcm_chunk(0.5)));
    h.connector.push(ServerMessage::audio(&pcm_chunk(0.25)));
    eventually("two voices", || h.output.voices().len() == 2).await;

    let voices = h.output.voices();
    assert!((voices[0].start_at - 0.0).abs() < 1e-9);
    assert!((voices[1].start_at - 0.5).abs() < 1e-9);
    assert_eq!(h.engine.active_playback(), 2);
    h.engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barge_in_cuts_playback_and_restarts_at_now() {
    let h = harness();
    open(&h).await;

    for _ in 0..3 {
        h.connector.push(ServerMessage::audio(&pcm_chunk(1.0)));
    }
    eventually("three voices", || h.output.voices().len() == 3).await;
    h.output.advance(0.4);

    h.connector.push(ServerMessage::interrupted());
    eventually("flush", || h.output.live_voices().is_empty()).await;
    assert_eq!(h.engine.active_playback(), 0);
    // Nothing scheduled against the old cursor sounds after the flush.
    assert!(h.output.sounding_now().is_empty());

    h.connector.push(ServerMessage::audio(&pcm_chunk(0.5)));
    eventually("post-interrupt voice", || h.output.voices().len() == 4).await;
    let next = h.output.voices()[3].clone();
    assert!((next.start_at - 0.4).abs() < 1e-9);
    assert_eq!(h.engine.status(), SessionStatus::Open);
    h.engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_audio_is_dropped_and_session_survives() {
    let h = harness();
    open(&h).await;

    h.connector.push(ServerMessage::audio("***not base64***"));
    // Three bytes: not a whole number of PCM16 samples.
    h.connector.push(ServerMessage::audio(&pcm::encode_base64(&[1, 2, 3])));
    h.connector.push(ServerMessage::audio(&pcm_chunk(0.1)));

    eventually("valid chunk", || h.output.voices().len() == 1).await;
    assert_eq!(h.engine.status(), SessionStatus::Open);
    h.engine.stop();
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_close_tears_everything_down() {
    let h = harness();
    open(&h).await;
    h.connector.push(ServerMessage::audio(&pcm_chunk(1.0)));
    eventually("voice", || h.output.voices().len() == 1).await;

    let mut statuses = h.engine.subscribe_status();
    h.connector.close_remote(Some("session expired"));

    eventually("closed", || h.engine.status() == SessionStatus::Closed).await;
    eventually("microphone release", || h.mic.released.load(Ordering::SeqCst) == 1).await;
    assert!(h.output.live_voices().is_empty());
    assert_eq!(
        drain_statuses(&mut statuses),
        vec![SessionStatus::Closing, SessionStatus::Closed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_error_reports_error_before_closed() {
    let h = harness();
    open(&h).await;
    let mut statuses = h.engine.subscribe_status();

    h.connector.fail_remote("connection reset");

    eventually("closed", || h.engine.status() == SessionStatus::Closed).await;
    assert_eq!(
        drain_statuses(&mut statuses),
        vec![SessionStatus::Error, SessionStatus::Closing, SessionStatus::Closed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_idempotent_and_session_can_restart() {
    let h = harness();
    h.engine.stop();
    open(&h).await;

    h.engine.stop();
    h.engine.stop();
    assert_eq!(h.engine.status(), SessionStatus::Closed);
    assert_eq!(h.connector.local_closes(), 1);
    eventually("microphone release", || h.mic.released.load(Ordering::SeqCst) == 1).await;

    open(&h).await;
    assert_eq!(h.connector.connect_count(), 2);
    assert_eq!(h.mic.opens.load(Ordering::SeqCst), 2);
    h.engine.stop();
}

/// Ends the session from inside the first transcript callback.
#[derive(Default)]
struct HangUpBridge {
    engine: OnceLock<Weak<LiveEngine>>,
    deltas: AtomicUsize,
}

impl MessageBridge for HangUpBridge {
    fn on_transcript_delta(&self, _direction: TranscriptDirection, _text: &str) {
        self.deltas.fetch_add(1, Ordering::SeqCst);
        if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
            engine.stop();
        }
    }

    fn on_turn_complete(&self, _user: ChatEntry, _assistant: ChatEntry) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_from_bridge_drops_rest_of_message() {
    let connector = ScriptedConnector::new();
    let output = Arc::new(ManualOutput::new());
    let bridge = Arc::new(HangUpBridge::default());
    let engine = Arc::new(LiveEngine::new(
        LiveConfig::default(),
        LiveServices {
            connector: Arc::new(connector.clone()),
            microphone: Arc::new(FakeMic {
                counters: Arc::new(MicCounters::default()),
                deny: false,
            }),
            output: output.clone(),
            bridge: bridge.clone(),
        },
    ));
    let _ = bridge.engine.set(Arc::downgrade(&engine));
    engine
        .start("test-key", "You are Nova Prime.", "Zephyr")
        .await
        .expect("session opens");

    // Transcript and audio in one message: the transcript is dispatched first.
    connector.push(ServerMessage {
        server_content: Some(ServerContent {
            output_transcription: Some(Transcription {
                text: Some("Goodbye".into()),
            }),
            model_turn: Some(ModelTurn {
                parts: vec![Part {
                    text: None,
                    inline_data: Some(InlineData {
                        data: pcm_chunk(1.0),
                        mime_type: Some("audio/pcm;rate=24000".into()),
                    }),
                }],
            }),
            ..ServerContent::default()
        }),
        ..ServerMessage::default()
    });

    eventually("closed", || engine.status() == SessionStatus::Closed).await;
    assert_eq!(bridge.deltas.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(output.voices().is_empty(), "audio scheduled after stop");
    assert!(output.live_voices().is_empty());
    assert_eq!(engine.active_playback(), 0);
}
