//! Core audio data types
//!
//! PCM produced by the MP3 pre-decode and consumed by the playback thread.

/// PcmChunk holds decoded audio for one server chunk, ready for playback.
///
/// **Format:**
/// - Samples are f32 (floating point -1.0 to 1.0)
/// - Interleaved by channel: [L, R, L, R, ...] for stereo
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// PCM audio samples (interleaved)
    pub samples: Vec<f32>,

    /// Sample rate of the decoded stream
    pub sample_rate: u32,

    /// Channel count (1 = mono, 2 = stereo)
    pub channel_count: u16,
}

impl PcmChunk {
    /// Create a new PcmChunk from decoded audio data
    pub fn new(samples: Vec<f32>, sample_rate: u32, channel_count: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channel_count,
        }
    }

    /// Number of per-channel frames (samples.len() / channels)
    pub fn frame_count(&self) -> usize {
        if self.channel_count == 0 {
            return 0;
        }
        self.samples.len() / self.channel_count as usize
    }

    /// Duration in milliseconds, derived from PCM length and sample rate
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frame_count() as u64 * 1000) / self.sample_rate as u64
    }

    /// True when the decoder produced no usable audio
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
