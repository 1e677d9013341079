//! `CpalOutput` — real output device backed by a cpal stream and a small mixer.
//!
//! # Clock
//!
//! The output clock is the number of frames the device callback has rendered
//! divided by the device rate, so it advances exactly with the hardware.
//! Voices are placed on that clock by start frame and never drift relative
//! to each other.
//!
//! # Real-time constraints
//!
//! The render callback only `try_lock`s the mixer. On contention it renders
//! silence for that buffer and holds the clock, so sounding voices resume
//! where they were and scheduled voices keep their spacing. Finished voice
//! ids leave the callback through a bounded crossbeam channel (a voice whose
//! end cannot be queued stays in the mixer and is reported on the next
//! buffer). Ids of voices removed by `stop` go through an unbounded channel.
//! A separate completion thread runs the end callbacks for both.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send`, so the stream is created, parked and dropped on
//! one dedicated thread. `CpalOutput` itself only holds shared state and is
//! `Send + Sync`.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

use super::output::{AudioOutput, EndCallback, Gain, VoiceId, VoiceRequest};
use crate::error::Result;
#[cfg(not(feature = "audio-cpal"))]
use crate::error::NovaError;

/// Capacity of the finished-voice queue between the callback and the
/// completion thread.
#[cfg(feature = "audio-cpal")]
const ENDED_QUEUE_CAP: usize = 1024;

struct MixVoice {
    id: VoiceId,
    samples: Arc<[f32]>,
    start_frame: u64,
    /// Read position in source samples.
    pos: f64,
    /// Source samples advanced per device frame.
    step: f64,
    gain: Option<Gain>,
}

struct Shared {
    mixer: Mutex<Vec<MixVoice>>,
    frames_rendered: AtomicU64,
    device_rate: u32,
    next_id: AtomicU64,
    /// Natural ends, sent from the render callback.
    ended_tx: Sender<VoiceId>,
    /// Forced ends, sent from `stop`.
    stopped_tx: Sender<VoiceId>,
    callbacks: Arc<Mutex<HashMap<VoiceId, EndCallback>>>,
}

impl Shared {
    fn now_frames(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    /// Mix all due voices into `out` (interleaved, `channels` wide).
    #[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
    fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        out.fill(0.0);

        let Some(mut voices) = self.mixer.try_lock() else {
            // Silence, clock untouched.
            return;
        };
        let base = self.now_frames();
        let ended_tx = &self.ended_tx;
        voices.retain_mut(|voice| {
            let gain = voice.gain.as_ref().map_or(1.0, Gain::get);
            let len = voice.samples.len();
            let mut done = false;
            for f in 0..frames {
                if base + (f as u64) < voice.start_frame {
                    continue;
                }
                let idx = voice.pos as usize;
                if idx >= len {
                    done = true;
                    break;
                }
                let frac = (voice.pos - idx as f64) as f32;
                let a = voice.samples[idx];
                let b = voice.samples.get(idx + 1).copied().unwrap_or(a);
                let sample = (a + (b - a) * frac) * gain;
                for c in 0..channels {
                    out[f * channels + c] += sample;
                }
                voice.pos += voice.step;
            }
            let started = base + frames as u64 > voice.start_frame;
            if !done && started && voice.pos as usize >= len {
                done = true;
            }
            if !done {
                return true;
            }
            // Queue full: keep the spent voice and report it next buffer.
            matches!(ended_tx.try_send(voice.id), Err(TrySendError::Full(_)))
        });

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        self.frames_rendered
            .fetch_add(frames as u64, Ordering::AcqRel);
        drop(voices);
    }
}

/// Output device handle. Cheap to share behind an `Arc<dyn AudioOutput>`.
pub struct CpalOutput {
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    stream_thread: Option<JoinHandle<()>>,
    /// Actual device sample rate (Hz).
    pub sample_rate: u32,
}

impl CpalOutput {
    /// Open the preferred output device by name, falling back to the default.
    ///
    /// Blocks until the stream is confirmed running (or fails).
    ///
    /// # Errors
    /// `NovaError::AudioDevice` when no output device can be opened,
    /// `NovaError::AudioStream` when cpal fails to build or start the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(preferred_device: Option<&str>) -> Result<Self> {
        use crate::error::NovaError;

        let shutdown = Arc::new(AtomicBool::new(false));
        let preferred = preferred_device.map(str::to_owned);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<(u32, Arc<Shared>)>>();
        let shutdown_for_thread = Arc::clone(&shutdown);

        let stream_thread = std::thread::Builder::new()
            .name("nova-output".into())
            .spawn(move || {
                let opened = open_stream(preferred.as_deref());
                let (stream, shared, ended_rx, stopped_rx) = match opened {
                    Ok(parts) => parts,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                spawn_completion_thread(ended_rx, stopped_rx, Arc::clone(&shared.callbacks));
                let _ = open_tx.send(Ok((shared.device_rate, Arc::clone(&shared))));

                while !shutdown_for_thread.load(Ordering::Acquire) {
                    std::thread::park_timeout(std::time::Duration::from_millis(200));
                }
                // Stream drops here, on the thread that created it.
                drop(stream);
                tracing::debug!("output stream released");
            })
            .map_err(NovaError::Io)?;

        match open_rx.recv() {
            Ok(Ok((sample_rate, shared))) => Ok(Self {
                shared,
                shutdown,
                stream_thread: Some(stream_thread),
                sample_rate,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NovaError::AudioStream(
                "output thread exited before opening the device".into(),
            )),
        }
    }

    /// Stub when the `audio-cpal` feature is disabled.
    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(_preferred_device: Option<&str>) -> Result<Self> {
        Err(NovaError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl AudioOutput for CpalOutput {
    fn now(&self) -> f64 {
        self.shared.now_frames() as f64 / self.shared.device_rate as f64
    }

    fn play(&self, request: VoiceRequest) -> VoiceId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let rate = self.shared.device_rate as f64;
        let start_frame = ((request.start_at * rate).ceil().max(0.0) as u64)
            .max(self.shared.now_frames());
        let src_rate = request.chunk.sample_rate.max(1) as f64;

        if let Some(callback) = request.on_end {
            self.shared.callbacks.lock().insert(id, callback);
        }
        self.shared.mixer.lock().push(MixVoice {
            id,
            samples: request.chunk.samples,
            start_frame,
            pos: request.offset * src_rate,
            step: src_rate / rate,
            gain: request.gain,
        });
        id
    }

    fn stop(&self, id: VoiceId) {
        let removed = {
            let mut voices = self.shared.mixer.lock();
            let before = voices.len();
            voices.retain(|v| v.id != id);
            voices.len() != before
        };
        if removed && self.shared.stopped_tx.send(id).is_err() {
            tracing::warn!(id, "output completion thread gone; end callback dropped");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.stream_thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn spawn_completion_thread(
    ended_rx: crossbeam_channel::Receiver<VoiceId>,
    stopped_rx: crossbeam_channel::Receiver<VoiceId>,
    callbacks: Arc<Mutex<HashMap<VoiceId, EndCallback>>>,
) {
    let spawned = std::thread::Builder::new()
        .name("nova-output-ended".into())
        .spawn(move || loop {
            // Both senders live in the shared mixer state and drop together.
            let next = crossbeam_channel::select! {
                recv(ended_rx) -> id => id,
                recv(stopped_rx) -> id => id,
            };
            let Ok(id) = next else { break };
            let callback = callbacks.lock().remove(&id);
            if let Some(callback) = callback {
                callback(id);
            }
        });
    if let Err(e) = spawned {
        tracing::error!("failed to spawn output completion thread: {e}");
    }
}

/// Stream plus shared state, natural-end receiver and stop receiver.
#[cfg(feature = "audio-cpal")]
type OpenedStream = (
    cpal::Stream,
    Arc<Shared>,
    crossbeam_channel::Receiver<VoiceId>,
    crossbeam_channel::Receiver<VoiceId>,
);

#[cfg(feature = "audio-cpal")]
fn open_stream(preferred_device: Option<&str>) -> Result<OpenedStream> {
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat, StreamConfig,
    };

    use crate::error::NovaError;

    let host = cpal::default_host();
    let mut selected = None;
    if let Some(name) = preferred_device {
        match host.output_devices() {
            Ok(mut devices) => {
                selected = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false));
                if selected.is_none() {
                    tracing::warn!("preferred output device '{name}' not found, falling back");
                }
            }
            Err(e) => tracing::warn!("failed to list output devices: {e}"),
        }
    }
    let device = match selected {
        Some(d) => d,
        None => host
            .default_output_device()
            .ok_or_else(|| NovaError::AudioDevice("no default output device found".into()))?,
    };

    tracing::info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = device
        .default_output_config()
        .map_err(|e| NovaError::AudioDevice(e.to_string()))?;
    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    tracing::info!(device_rate, channels, "output config selected");

    let (ended_tx, ended_rx) = crossbeam_channel::bounded(ENDED_QUEUE_CAP);
    let (stopped_tx, stopped_rx) = crossbeam_channel::unbounded();
    let shared = Arc::new(Shared {
        mixer: Mutex::new(Vec::new()),
        frames_rendered: AtomicU64::new(0),
        device_rate,
        next_id: AtomicU64::new(0),
        ended_tx,
        stopped_tx,
        callbacks: Arc::new(Mutex::new(HashMap::new())),
    });

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let shared = Arc::clone(&shared);
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| shared.render(data, channels),
                |err| tracing::error!("audio output stream error: {err}"),
                None,
            )
        }
        SampleFormat::I16 => {
            let shared = Arc::clone(&shared);
            let mut scratch: Vec<f32> = Vec::with_capacity(16_384);
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    scratch.resize(data.len(), 0.0);
                    shared.render(&mut scratch, channels);
                    for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                        *dst = super::pcm::f32_to_i16(*src);
                    }
                },
                |err| tracing::error!("audio output stream error: {err}"),
                None,
            )
        }
        fmt => {
            return Err(NovaError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| NovaError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| NovaError::AudioStream(e.to_string()))?;

    Ok((stream, shared, ended_rx, stopped_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::chunk::AudioChunk;

    use crossbeam_channel::Receiver;

    fn shared_with(rate: u32, cap: usize) -> (Arc<Shared>, Receiver<VoiceId>, Receiver<VoiceId>) {
        let (ended_tx, ended_rx) = crossbeam_channel::bounded(cap);
        let (stopped_tx, stopped_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            mixer: Mutex::new(Vec::new()),
            frames_rendered: AtomicU64::new(0),
            device_rate: rate,
            next_id: AtomicU64::new(0),
            ended_tx,
            stopped_tx,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        });
        (shared, ended_rx, stopped_rx)
    }

    fn shared(rate: u32) -> (Arc<Shared>, Receiver<VoiceId>) {
        let (shared, ended_rx, _stopped_rx) = shared_with(rate, 64);
        (shared, ended_rx)
    }

    fn push(shared: &Shared, id: VoiceId, samples: Vec<f32>, start_frame: u64, gain: Option<Gain>) {
        shared.mixer.lock().push(MixVoice {
            id,
            samples: AudioChunk::new(samples, 8).samples,
            start_frame,
            pos: 0.0,
            step: 1.0,
            gain,
        });
    }

    #[test]
    fn voices_start_on_their_frame_and_report_end() {
        let (shared, ended_rx) = shared(8);
        push(&shared, 1, vec![0.5; 4], 2, None);

        let mut out = vec![0.0f32; 8];
        shared.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(ended_rx.try_recv().ok(), Some(1));
        assert!(shared.mixer.lock().is_empty());
        assert_eq!(shared.now_frames(), 8);
    }

    #[test]
    fn gain_scales_and_channels_duplicate() {
        let (shared, _rx) = shared(8);
        push(&shared, 1, vec![0.8; 16], 0, Some(Gain::new(0.5)));
        let mut out = vec![0.0f32; 4];
        shared.render(&mut out, 2);
        assert!(out.iter().all(|s| (s - 0.4).abs() < 1e-6));
    }

    #[test]
    fn mix_is_clamped() {
        let (shared, _rx) = shared(8);
        push(&shared, 1, vec![0.9; 4], 0, None);
        push(&shared, 2, vec![0.9; 4], 0, None);
        let mut out = vec![0.0f32; 2];
        shared.render(&mut out, 1);
        assert_eq!(out, vec![1.0, 1.0]);
    }

    #[test]
    fn contended_buffer_holds_the_clock() {
        let (shared, _rx) = shared(8);
        push(&shared, 1, vec![0.5; 4], 0, None);
        push(&shared, 2, vec![0.5; 4], 4, None);

        let mut out = vec![0.0f32; 2];
        {
            let _held = shared.mixer.lock();
            shared.render(&mut out, 1);
        }
        assert_eq!(out, vec![0.0, 0.0]);
        assert_eq!(shared.now_frames(), 0);

        let mut out = vec![0.0f32; 8];
        shared.render(&mut out, 1);
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6), "voices overlap: {out:?}");
        assert_eq!(shared.now_frames(), 8);
    }

    #[test]
    fn full_end_queue_reports_on_next_buffer() {
        let (shared, ended_rx, _stopped_rx) = shared_with(8, 1);
        push(&shared, 1, vec![0.1; 2], 0, None);
        push(&shared, 2, vec![0.1; 2], 0, None);

        let mut out = vec![0.0f32; 4];
        shared.render(&mut out, 1);
        assert_eq!(ended_rx.try_recv().ok(), Some(1));
        assert_eq!(shared.mixer.lock().len(), 1);

        shared.render(&mut out, 1);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(ended_rx.try_recv().ok(), Some(2));
        assert!(shared.mixer.lock().is_empty());
    }

    #[test]
    fn stop_reports_through_its_own_queue() {
        let (shared, ended_rx, stopped_rx) = shared_with(8, 1);
        let output = CpalOutput {
            shared,
            shutdown: Arc::new(AtomicBool::new(false)),
            stream_thread: None,
            sample_rate: 8,
        };
        let chunk = AudioChunk::new(vec![0.2; 8], 8);
        let a = output.play(VoiceRequest::new(chunk.clone(), 0.0));
        let b = output.play(VoiceRequest::new(chunk, 0.0));
        output.stop(a);
        output.stop(b);
        output.stop(b);

        assert_eq!(stopped_rx.try_iter().collect::<Vec<_>>(), vec![a, b]);
        assert!(ended_rx.try_recv().is_err());
        assert!(output.shared.mixer.lock().is_empty());
    }
}
