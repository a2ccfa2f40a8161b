//! Error types for the animation engine

use thiserror::Error;

/// Main error type for the animation engine
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound event stream violated the chunk/batch protocol
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Frame or audio decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Audio playback errors
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors raised while demultiplexing the inbound event stream
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// `chunk_ready` arrived for a chunk with no prior audio or frames
    #[error("chunk_ready for unknown chunk {chunk_index}")]
    ChunkReadyWithoutChunk { chunk_index: u32 },

    /// A frame batch arrived after its chunk already completed
    #[error("frame_batch for chunk {chunk_index} after chunk_ready fired")]
    BatchAfterReady { chunk_index: u32 },

    /// An index field fell outside the range the stream promised
    #[error("out-of-range {field} ({value}) for chunk {chunk_index}")]
    IndexOutOfRange {
        chunk_index: u32,
        field: &'static str,
        value: u64,
    },
}

/// Errors related to overlay/base frame and audio decoding
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Overlay image bytes could not be decoded
    #[error("Image decode failed for key {key}: {reason}")]
    Image { key: String, reason: String },

    /// Base64 payload was malformed
    #[error("Invalid base64 image payload: {0}")]
    Base64(String),

    /// MP3 payload could not be probed or decoded
    #[error("Audio decode failed for chunk {chunk_index}: {reason}")]
    Audio { chunk_index: u32, reason: String },

    /// Decoder produced no PCM
    #[error("Audio decode produced empty PCM for chunk {chunk_index}")]
    EmptyPcm { chunk_index: u32 },
}

/// Errors related to the audio output path
#[derive(Debug, Error)]
pub enum AudioError {
    /// No audio device available
    #[error("No audio output device available")]
    NoDevice,

    /// Device or stream configuration failed
    #[error("Audio output error: {0}")]
    Output(String),

    /// Pre-decode did not finish within the configured ceiling
    #[error("Pre-decode timed out for chunk {chunk_index} after {waited_ms}ms")]
    PreDecodeTimeout { chunk_index: u32, waited_ms: u64 },
}

/// Result type alias using the engine error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error recovery strategies
///
/// Maps each failure class to the engine's documented policy: transient frame
/// errors log and continue, protocol violations drop the offending event, and
/// resource exhaustion forces the engine back to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Log the error and continue; the skip-draw timeout covers the gap
    LogAndContinue,

    /// Drop the offending item (event or chunk) and keep the message alive
    Skip,

    /// Fatal engine error; force_idle_now and surface to the shell
    Fatal,
}

impl Error {
    /// Get the recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            // A single overlay frame failing to decode leaves the frame
            // permanently not-ready; the conductor force-advances past it.
            Error::Decode(DecodeError::Image { .. }) => RecoveryStrategy::LogAndContinue,
            Error::Decode(DecodeError::Base64(_)) => RecoveryStrategy::LogAndContinue,

            // Missing audio degrades that chunk to wall-clock pacing.
            Error::Decode(DecodeError::Audio { .. }) => RecoveryStrategy::Skip,
            Error::Decode(DecodeError::EmptyPcm { .. }) => RecoveryStrategy::Skip,
            Error::Audio(AudioError::PreDecodeTimeout { .. }) => RecoveryStrategy::Skip,

            // Malformed events are dropped without aborting the message.
            Error::Protocol(_) => RecoveryStrategy::Skip,

            Error::Audio(AudioError::NoDevice) => RecoveryStrategy::Fatal,
            Error::Audio(AudioError::Output(_)) => RecoveryStrategy::Fatal,

            Error::Io(_) | Error::Config(_) | Error::Other(_) => RecoveryStrategy::Fatal,
        }
    }
}
