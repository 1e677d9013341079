//! Blocking capture pipeline.
//!
//! ## Stages
//!
//! ```text
//! 0. Open the microphone on this thread (MicrophoneSource), report result
//! 1. Wait for the transport bind, discarding everything captured meanwhile
//! 2. Drain ring buffer → Vec<f32> (one chunk per iteration)
//! 3. Broadcast the chunk's RMS level as AudioActivityEvent
//! 4. Resample to 16 kHz (passthrough when the device already runs at 16 kHz)
//! 5. Framer cuts fixed 4096-sample frames
//! 6. Each frame → OutboundMessage → TransportSender::send (fire-and-forget)
//! ```
//!
//! The whole loop runs in `spawn_blocking`, keeping the Tokio executor free
//! for the websocket and the inbound event task. A trailing partial frame at
//! stop is discarded.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::OnceLock;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{resample::RateConverter, CaptureStream, MicrophoneSource},
    buffering::{create_audio_ring, frame::Framer, AudioConsumer, Consumer},
    error::{NovaError, Result},
    ipc::events::AudioActivityEvent,
    transport::{OutboundMessage, TransportSender},
};

pub struct PipelineDiagnostics {
    pub samples_in: AtomicUsize,
    pub samples_resampled: AtomicUsize,
    pub samples_discarded: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub send_errors: AtomicUsize,
}

impl Default for PipelineDiagnostics {
    fn default() -> Self {
        Self {
            samples_in: AtomicUsize::new(0),
            samples_resampled: AtomicUsize::new(0),
            samples_discarded: AtomicUsize::new(0),
            frames_sent: AtomicUsize::new(0),
            send_errors: AtomicUsize::new(0),
        }
    }
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.samples_resampled.store(0, Ordering::Relaxed);
        self.samples_discarded.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.send_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_resampled: self.samples_resampled.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub samples_resampled: usize,
    /// Captured before the transport was bound.
    pub samples_discarded: usize,
    pub frames_sent: usize,
    pub send_errors: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Wire rate of outbound frames. Default: 16000.
    pub target_sample_rate: u32,
    /// Samples per outbound frame. Default: 4096.
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: crate::audio::pcm::INPUT_SAMPLE_RATE,
            frame_samples: 4096,
        }
    }
}

/// All context the loop needs, passed as one struct so the closure stays tidy.
struct PipelineContext {
    config: CaptureConfig,
    consumer: AudioConsumer,
    running: Arc<AtomicBool>,
    bind_rx: mpsc::Receiver<Arc<dyn TransportSender>>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    activity_seq: Arc<AtomicU64>,
    capture_sample_rate: u32,
    diagnostics: Arc<PipelineDiagnostics>,
}

/// Chunk size drained from the ring buffer per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Minimum sleep when the ring is empty (avoids busy-wait burning a core).
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// Poll interval while waiting for the transport bind.
const BIND_POLL: Duration = Duration::from_millis(10);

/// Log only the first send failure and every Nth after it.
const SEND_ERROR_LOG_EVERY: usize = 100;

/// Running capture. Dropping the handle does **not** stop capture; call
/// [`CaptureHandle::stop`].
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    bind_tx: Mutex<Option<mpsc::Sender<Arc<dyn TransportSender>>>>,
    device_sample_rate: u32,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CaptureHandle {
    /// Start forwarding frames to `sender`. Only the first bind takes effect.
    ///
    /// # Errors
    /// `NovaError::NotRunning` when capture already stopped.
    pub fn bind(&self, sender: Arc<dyn TransportSender>) -> Result<()> {
        let bind_tx = self.bind_tx.lock().take();
        match bind_tx {
            Some(tx) if self.is_running() => tx.send(sender).map_err(|_| NovaError::NotRunning),
            _ => Err(NovaError::NotRunning),
        }
    }

    /// Stop capture. Idempotent. The device is released on the pipeline
    /// thread shortly after.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("capture stop requested");
        }
        self.bind_tx.lock().take();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Native rate of the opened device (Hz).
    pub fn device_sample_rate(&self) -> u32 {
        self.device_sample_rate
    }

    /// Wait until the pipeline thread has exited and released the device.
    pub async fn finished(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Open the microphone on a blocking thread and start the pipeline.
///
/// Returns once the device is confirmed open (or failed). Frames flow only
/// after [`CaptureHandle::bind`].
///
/// # Errors
/// `NovaError::DeviceUnavailable` (or the source's own error) when the
/// microphone cannot be opened, `NovaError::AudioStream` when the resampler
/// cannot be built for the device rate.
pub async fn start_capture(
    microphone: Arc<dyn MicrophoneSource>,
    config: CaptureConfig,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    activity_seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
) -> Result<CaptureHandle> {
    diagnostics.reset();
    let running = Arc::new(AtomicBool::new(true));
    let (producer, consumer) = create_audio_ring();
    let (bind_tx, bind_rx) = mpsc::channel::<Arc<dyn TransportSender>>();
    // Carries the device sample rate on success.
    let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();

    let thread_running = Arc::clone(&running);
    let task = tokio::task::spawn_blocking(move || {
        // The stream must be opened and dropped on THIS thread.
        let stream: Box<dyn CaptureStream> =
            match microphone.open(producer, Arc::clone(&thread_running)) {
                Ok(stream) => stream,
                Err(e) => {
                    thread_running.store(false, Ordering::SeqCst);
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
        let capture_sample_rate = stream.sample_rate();

        if let Err(e) = RateConverter::new(capture_sample_rate, config.target_sample_rate, DRAIN_CHUNK) {
            thread_running.store(false, Ordering::SeqCst);
            let _ = open_tx.send(Err(e));
            return;
        }
        if open_tx.send(Ok(capture_sample_rate)).is_err() {
            // start_capture was cancelled.
            thread_running.store(false, Ordering::SeqCst);
            return;
        }

        run(PipelineContext {
            config,
            consumer,
            running: thread_running,
            bind_rx,
            activity_tx,
            activity_seq,
            capture_sample_rate,
            diagnostics,
        });

        // Stream drops here, releasing the device on this thread.
        drop(stream);
    });

    match open_rx.await {
        Ok(Ok(device_sample_rate)) => {
            info!(device_sample_rate, "microphone open");
            Ok(CaptureHandle {
                running,
                bind_tx: Mutex::new(Some(bind_tx)),
                device_sample_rate,
                task: Mutex::new(Some(task)),
            })
        }
        Ok(Err(e)) => {
            warn!("microphone open failed: {e}");
            Err(e)
        }
        Err(_) => {
            running.store(false, Ordering::SeqCst);
            Err(NovaError::Other(anyhow::anyhow!(
                "capture thread died before reporting device state"
            )))
        }
    }
}

/// Run the blocking loop until `ctx.running` becomes false.
fn run(mut ctx: PipelineContext) {
    let mut raw = vec![0f32; DRAIN_CHUNK];

    let Some(sender) = wait_for_bind(&mut ctx, &mut raw) else {
        debug!("capture stopped before transport bind");
        return;
    };
    info!(
        capture_rate = ctx.capture_sample_rate,
        target_rate = ctx.config.target_sample_rate,
        frame_samples = ctx.config.frame_samples,
        "capture pipeline streaming"
    );

    let mut resampler = match RateConverter::new(
        ctx.capture_sample_rate,
        ctx.config.target_sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create resampler: {e}");
            return;
        }
    };
    let mut framer = Framer::new(ctx.config.frame_samples);
    debug!(passthrough = resampler.is_passthrough(), "resampler ready");

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            continue;
        }
        ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);

        let rms = compute_rms(&raw[..n]);
        let seq = ctx.activity_seq.fetch_add(1, Ordering::Relaxed);
        let _ = ctx.activity_tx.send(AudioActivityEvent { seq, rms });

        let resampled = resampler.process(&raw[..n]);
        if resampled.is_empty() {
            // Partial chunk — waiting for more data to fill rubato's input buffer
            continue;
        }
        ctx.diagnostics
            .samples_resampled
            .fetch_add(resampled.len(), Ordering::Relaxed);

        for frame in framer.push(&resampled) {
            match sender.send(OutboundMessage::audio(frame)) {
                Ok(()) => {
                    ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let failures = ctx.diagnostics.send_errors.fetch_add(1, Ordering::Relaxed);
                    if failures % SEND_ERROR_LOG_EVERY == 0 {
                        warn!(failures = failures + 1, "frame send failed: {e}");
                    }
                }
            }
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        samples_in = snap.samples_in,
        samples_resampled = snap.samples_resampled,
        samples_discarded = snap.samples_discarded,
        frames_sent = snap.frames_sent,
        send_errors = snap.send_errors,
        partial_dropped = framer.pending(),
        "capture pipeline stopped — diagnostics"
    );
}

/// Block until a sender arrives, keeping the ring empty meanwhile.
fn wait_for_bind(
    ctx: &mut PipelineContext,
    scratch: &mut [f32],
) -> Option<Arc<dyn TransportSender>> {
    loop {
        discard_ring(ctx, scratch);
        if !ctx.running.load(Ordering::Relaxed) {
            return None;
        }
        match ctx.bind_rx.recv_timeout(BIND_POLL) {
            Ok(sender) => {
                // Audio captured before the bind never goes out.
                discard_ring(ctx, scratch);
                return Some(sender);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

fn discard_ring(ctx: &mut PipelineContext, scratch: &mut [f32]) {
    loop {
        let n = ctx.consumer.pop_slice(scratch);
        if n == 0 {
            break;
        }
        ctx.diagnostics
            .samples_discarded
            .fetch_add(n, Ordering::Relaxed);
    }
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("NOVA_PIPELINE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq = samples.iter().map(|s| s * s).sum::<f32>();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use crate::buffering::{AudioProducer, Producer};
    use crate::transport::stub::ScriptedConnector;
    use crate::transport::{LiveConnector, SetupRequest};

    struct FixedRateStream(u32);

    impl CaptureStream for FixedRateStream {
        fn sample_rate(&self) -> u32 {
            self.0
        }
    }

    /// Pushes a constant level into the ring from a helper thread.
    struct ToneMic {
        rate: u32,
        level: f32,
    }

    impl MicrophoneSource for ToneMic {
        fn open(
            &self,
            mut producer: AudioProducer,
            running: Arc<AtomicBool>,
        ) -> Result<Box<dyn CaptureStream>> {
            let level = self.level;
            let block = (self.rate / 100) as usize;
            std::thread::spawn(move || {
                let buf = vec![level; block];
                while running.load(Ordering::Relaxed) {
                    producer.push_slice(&buf);
                    std::thread::sleep(Duration::from_millis(2));
                }
            });
            Ok(Box::new(FixedRateStream(self.rate)))
        }
    }

    struct DeniedMic;

    impl MicrophoneSource for DeniedMic {
        fn open(&self, _p: AudioProducer, _r: Arc<AtomicBool>) -> Result<Box<dyn CaptureStream>> {
            Err(NovaError::DeviceUnavailable("permission denied".into()))
        }
    }

    fn channels() -> (broadcast::Sender<AudioActivityEvent>, Arc<AtomicU64>, Arc<PipelineDiagnostics>) {
        let (tx, _) = broadcast::channel(256);
        (tx, Arc::new(AtomicU64::new(0)), Arc::new(PipelineDiagnostics::default()))
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn rms_of_constant_signal_is_its_magnitude() {
        assert!((compute_rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
        assert_eq!(compute_rms(&[]), 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn denied_microphone_surfaces_device_unavailable() {
        let (tx, seq, diag) = channels();
        let result = start_capture(Arc::new(DeniedMic), CaptureConfig::default(), tx, seq, diag).await;
        assert!(matches!(result, Err(NovaError::DeviceUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_flow_only_after_bind_and_stop_is_idempotent() {
        let (tx, seq, diag) = channels();
        let mic = Arc::new(ToneMic { rate: 16_000, level: 0.25 });
        let handle = start_capture(mic, CaptureConfig::default(), tx, seq, Arc::clone(&diag))
            .await
            .unwrap();
        assert_eq!(handle.device_sample_rate(), 16_000);

        // Nothing is sent while unbound.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(diag.snapshot().frames_sent, 0);

        let connector = ScriptedConnector::new();
        let link = connector
            .connect("key", &SetupRequest::audio("m", String::new(), "Puck".into()))
            .await
            .unwrap();
        handle.bind(Arc::clone(&link.sender)).unwrap();

        let sent = connector.clone();
        let got = tokio::task::spawn_blocking(move || {
            wait_until(Duration::from_secs(5), || sent.sent_count() >= 2)
        })
        .await
        .unwrap();
        assert!(got, "expected frames after bind");

        let sent = connector.sent();
        assert!(sent.iter().all(|m| m.media.mime_type == "audio/pcm;rate=16000"));
        // 4096 samples of PCM16 → 8192 bytes → 10924 base64 chars.
        assert_eq!(sent[0].media.data.len(), 10_924);
        assert!(diag.snapshot().samples_discarded > 0);

        handle.stop();
        handle.stop();
        handle.finished().await;
        assert!(!handle.is_running());
        assert!(handle.bind(link.sender).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_before_bind_exits_cleanly() {
        let (tx, seq, diag) = channels();
        let mic = Arc::new(ToneMic { rate: 48_000, level: 0.1 });
        let handle = start_capture(mic, CaptureConfig::default(), tx, seq, Arc::clone(&diag))
            .await
            .unwrap();
        handle.stop();
        handle.finished().await;
        assert_eq!(diag.snapshot().frames_sent, 0);
    }
}
