//! Audio devices: microphone capture, output playback, PCM conversion.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate after warm-up, block on a mutex or perform I/O.
//! Capture satisfies that contract by writing directly into an SPSC ring
//! buffer producer whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`AudioCapture`] therefore must be created and dropped on the same
//! thread; the capture pipeline opens it inside `spawn_blocking` through a
//! [`MicrophoneSource`].

pub mod device;
pub mod output;
pub mod pcm;
pub mod resample;
pub mod sim;
pub mod speaker;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, Stream, StreamConfig,
};

use crate::{
    buffering::AudioProducer,
    error::{NovaError, Result},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// A granted, running microphone stream.
///
/// Not required to be `Send`: implementations may hold thread-bound OS
/// handles. The capture pipeline drops it on the thread that opened it.
pub trait CaptureStream {
    /// Rate (Hz) of the mono samples pushed into the ring.
    fn sample_rate(&self) -> u32;
}

/// Something that can grant microphone access.
///
/// `open` is called on the capture pipeline thread. It pushes mono f32
/// samples into `producer` for as long as `running` is `true`.
pub trait MicrophoneSource: Send + Sync + 'static {
    /// # Errors
    /// `NovaError::DeviceUnavailable` when permission is denied or no input
    /// device exists.
    fn open(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn CaptureStream>>;
}

/// The system microphone via cpal.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    /// Input device name to prefer over the system default.
    pub preferred_device: Option<String>,
}

impl CpalMicrophone {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn CaptureStream>> {
        match AudioCapture::open_with_preference(
            producer,
            running,
            self.preferred_device.as_deref(),
        ) {
            Ok(capture) => Ok(Box::new(capture)),
            Err(NovaError::DeviceUnavailable(msg)) => Err(NovaError::DeviceUnavailable(msg)),
            Err(e) => Err(NovaError::DeviceUnavailable(e.to_string())),
        }
    }
}

/// Handle to an active cpal input stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on Windows/macOS.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to make the callback no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl CaptureStream for AudioCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available device.
    ///
    /// # Errors
    /// `NovaError::DeviceUnavailable` when no input device exists,
    /// `NovaError::AudioDevice` / `NovaError::AudioStream` when cpal cannot
    /// configure or start the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices
                        .find(|device| device.name().map(|n| n == preferred_name).unwrap_or(false));
                    if selected_device.is_none() {
                        warn!("preferred input device '{preferred_name}' not found, falling back");
                    }
                }
                Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| NovaError::DeviceUnavailable(e.to_string()))?;
            let fallback = devices
                .next()
                .ok_or_else(|| NovaError::DeviceUnavailable("no input device found".into()))?;
            warn!("no default input device, falling back to first available input");
            fallback
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| NovaError::AudioDevice(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_mono_input::<f32>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                |s| s,
            ),
            SampleFormat::I16 => build_mono_input::<i16>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                pcm::i16_to_f32,
            ),
            SampleFormat::U8 => build_mono_input::<u8>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                |s| (s as f32 - 128.0) / 128.0,
            ),
            fmt => Err(NovaError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| NovaError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Stub when the `audio-cpal` feature is disabled.
    #[cfg(not(feature = "audio-cpal"))]
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(NovaError::DeviceUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build an input stream that down-mixes every callback buffer to mono and
/// pushes it into the ring.
#[cfg(feature = "audio-cpal")]
fn build_mono_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    to_f32: fn(T) -> f32,
) -> Result<Stream>
where
    T: cpal::SizedSample + Copy + 'static,
{
    use crate::buffering::Producer;

    let ch = config.channels.max(1) as usize;
    let mut mix_buf: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, slot) in mix_buf.iter_mut().enumerate() {
                    let base = f * ch;
                    let sum: f32 = data[base..base + ch].iter().map(|s| to_f32(*s)).sum();
                    *slot = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("ring buffer full: dropped {} frames", mix_buf.len() - written);
                }
            },
            |err| error!("audio input stream error: {err}"),
            None,
        )
        .map_err(|e| NovaError::AudioStream(e.to_string()))
}
