//! Audio output sink
//!
//! The playback thread hands decoded PCM to an [`AudioSink`]. The default
//! implementation drives a cpal output stream through a lock-free SPSC ring
//! buffer so the realtime callback never takes a lock. Shells that own their
//! platform audio route PCM through the listener callback instead and install
//! a [`NullSink`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use ringbuf::{traits::*, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::AudioError;

/// Ring depth in samples (~46ms of stereo @ 44.1kHz)
const RING_CAPACITY: usize = 4096;

/// Producer backoff while the ring is full
const WRITE_BACKOFF: Duration = Duration::from_millis(2);

/// Destination for decoded PCM
///
/// `write` blocks until the sink has accepted every sample (accepted, not
/// played; device-side latency is bounded by the sink's internal buffering).
/// Called only from the runway's playback thread.
pub trait AudioSink: Send {
    fn write(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
    ) -> Result<(), AudioError>;

    /// Drop any queued-but-unplayed audio immediately
    fn flush(&mut self);
}

/// Sink that discards all audio
///
/// For shells that consume PCM via `EngineListener::on_start_audio` and play
/// it through their own platform audio path.
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[f32], _sample_rate: u32, _channels: u16) -> Result<(), AudioError> {
        Ok(())
    }

    fn flush(&mut self) {}
}

/// cpal-backed sink
///
/// The stream is (re)built lazily to match the PCM spec of the chunk being
/// played; TTS backends emit one spec per session so rebuilds are rare.
pub struct CpalSink {
    device_name: Option<String>,
    /// Audio output stream; not Send, built and touched only on the thread
    /// that calls write()
    stream: Option<Stream>,
    producer: Option<HeapProd<f32>>,
    stream_spec: Option<(u32, u16)>,
    /// Set by flush(); the callback drains the ring to silence and clears it
    purge: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
}

// SAFETY: CpalSink can be sent to the playback thread because:
// - All fields except `stream` are Send
// - `stream` is None until the first write() and is only created, used, and
//   dropped on the single thread that owns the sink afterwards
// - The cpal callback thread has its own handles (consumer, purge, underruns)
unsafe impl Send for CpalSink {}

impl CpalSink {
    /// Create a sink on the named device (None = default output device)
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            stream: None,
            producer: None,
            stream_spec: None,
            purge: Arc::new(AtomicBool::new(false)),
            underruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Underruns observed by the device callback since creation
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    fn ensure_stream(&mut self, sample_rate: u32, channels: u16) -> Result<(), AudioError> {
        if self.stream_spec == Some((sample_rate, channels)) && self.stream.is_some() {
            return Ok(());
        }

        // Tear down any stream built for a different spec
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);
        }

        let host = cpal::default_host();
        let device = if let Some(name) = self.device_name.as_ref() {
            let mut devices = host
                .output_devices()
                .map_err(|e| AudioError::Output(format!("Failed to enumerate devices: {}", e)))?;
            devices
                .find(|d| d.name().ok().as_ref() == Some(name))
                .ok_or_else(|| AudioError::Output(format!("Device '{}' not found", name)))?
        } else {
            host.default_output_device().ok_or(AudioError::NoDevice)?
        };

        info!(
            "Opening audio device {:?} at {}Hz / {}ch",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            sample_rate,
            channels
        );

        let config = Self::pick_config(&device, sample_rate, channels)?;

        let ring = HeapRb::<f32>::new(RING_CAPACITY);
        let (producer, mut consumer) = ring.split();

        let purge = Arc::clone(&self.purge);
        let underruns = Arc::clone(&self.underruns);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if purge.swap(false, Ordering::AcqRel) {
                        while consumer.try_pop().is_some() {}
                    }
                    let mut filled = 0;
                    for slot in data.iter_mut() {
                        match consumer.try_pop() {
                            Some(sample) => {
                                *slot = sample.clamp(-1.0, 1.0);
                                filled += 1;
                            }
                            None => *slot = 0.0,
                        }
                    }
                    if filled == 0 && !data.is_empty() {
                        underruns.fetch_add(1, Ordering::Relaxed);
                    }
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::Output(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| AudioError::Output(format!("Failed to start stream: {}", e)))?;

        self.stream = Some(stream);
        self.producer = Some(producer);
        self.stream_spec = Some((sample_rate, channels));
        Ok(())
    }

    /// Prefer an exact (rate, channels, f32) match, falling back to the
    /// device default configuration.
    fn pick_config(
        device: &cpal::Device,
        sample_rate: u32,
        channels: u16,
    ) -> Result<StreamConfig, AudioError> {
        let mut supported = device
            .supported_output_configs()
            .map_err(|e| AudioError::Output(format!("Failed to get device configs: {}", e)))?;

        let preferred = supported.find(|config| {
            config.channels() == channels
                && config.min_sample_rate().0 <= sample_rate
                && config.max_sample_rate().0 >= sample_rate
                && config.sample_format() == SampleFormat::F32
        });

        if let Some(config) = preferred {
            return Ok(config.with_sample_rate(cpal::SampleRate(sample_rate)).config());
        }

        let default = device
            .default_output_config()
            .map_err(|e| AudioError::Output(format!("Failed to get default config: {}", e)))?;
        debug!(
            "No exact config match; using device default {}Hz / {}ch",
            default.sample_rate().0,
            default.channels()
        );
        Ok(default.config())
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, samples: &[f32], sample_rate: u32, channels: u16) -> Result<(), AudioError> {
        self.ensure_stream(sample_rate, channels)?;

        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| AudioError::Output("stream not initialised".to_string()))?;

        let mut offset = 0;
        while offset < samples.len() {
            if self.purge.load(Ordering::Acquire) {
                // A flush raced this write; drop the rest of the slice.
                return Ok(());
            }
            offset += producer.push_slice(&samples[offset..]);
            if offset < samples.len() {
                std::thread::sleep(WRITE_BACKOFF);
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.purge.store(true, Ordering::Release);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
    }
}
