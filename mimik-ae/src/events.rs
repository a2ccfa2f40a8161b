//! Inbound event schema and the engine listener capability
//!
//! The transport is external; it hands the engine already-framed, typed
//! events. The serde derives here match the JSON the backend emits so a
//! transport that delivers text can go through [`InboundEvent::from_json`]
//! without glue. Unknown fields (for example the per-frame overlay
//! coordinates some backends still send) are ignored; the chunk-level
//! `zone_top_left` from `audio_chunk` is the authoritative placement.

use serde::Deserialize;

use crate::audio::types::PcmChunk;
use mimik_common::EngineMode;

/// An overlay sprite payload: raw encoded image bytes or a base64 string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImagePayload {
    Base64(String),
    Bytes(Vec<u8>),
}

impl ImagePayload {
    /// Decode to raw encoded-image bytes (base64 is unwrapped, bytes pass through)
    pub fn into_bytes(self) -> Result<Vec<u8>, crate::error::DecodeError> {
        use base64::Engine as _;
        match self {
            ImagePayload::Bytes(bytes) => Ok(bytes),
            ImagePayload::Base64(text) => base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| crate::error::DecodeError::Base64(e.to_string())),
        }
    }
}

/// One overlay frame record from a `frame_batch` event
#[derive(Debug, Clone, Deserialize)]
pub struct FrameRecord {
    pub chunk_index: u32,
    pub sequence_index: u32,
    #[serde(default)]
    pub section_index: u32,
    pub animation_name: String,
    /// Index into the base-frame array of `animation_name`; authoritative
    /// from the server (the lip-sync contract).
    pub matched_sprite_frame_number: u32,
    #[serde(default)]
    pub overlay_id: Option<String>,
    #[serde(default)]
    pub sheet_filename: String,
    #[serde(default)]
    pub character: Option<String>,
    pub image: ImagePayload,
}

impl FrameRecord {
    /// Content-addressed cache key for this record's decoded image
    ///
    /// Identical content yields identical keys: either the server-provided
    /// `overlay_id`, or `{animation_name}/{matched_sprite_frame_number}/{sheet_filename}`.
    pub fn cache_key(&self) -> String {
        match &self.overlay_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!(
                "{}/{}/{}",
                self.animation_name, self.matched_sprite_frame_number, self.sheet_filename
            ),
        }
    }
}

/// Inbound events from the bidirectional transport
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// MP3 audio for one chunk; the backend emits this before the chunk's
    /// frame batches. Carries the authoritative overlay placement.
    AudioChunk {
        chunk_index: u32,
        data: Vec<u8>,
        zone_top_left: (i32, i32),
    },

    /// A batch of overlay frame records; a chunk's frames may be split
    /// across several batches arriving in any order.
    FrameBatch {
        chunk_index: u32,
        frames: Vec<FrameRecord>,
    },

    /// Terminator: all `frame_batch` messages for this chunk have been
    /// dispatched and `total_sent` records are in flight.
    ChunkReady { chunk_index: u32, total_sent: u32 },

    /// No further chunks will be sent for the current message
    AudioEnd,

    /// Application-level abort signal
    Reset,
}

impl InboundEvent {
    /// Parse a single JSON-encoded event
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Event kind as string for logging
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::AudioChunk { .. } => "audio_chunk",
            InboundEvent::FrameBatch { .. } => "frame_batch",
            InboundEvent::ChunkReady { .. } => "chunk_ready",
            InboundEvent::AudioEnd => "audio_end",
            InboundEvent::Reset => "reset",
        }
    }
}

/// Observer capability registered at engine construction
///
/// Replaces ad-hoc assignable callbacks with one trait the shell implements.
/// All methods have no-op defaults; `on_start_audio` carries the PCM because
/// it is not serializable and therefore does not travel on the event bus.
pub trait EngineListener: Send + Sync {
    /// Conductor mode changed
    fn on_mode(&self, _mode: EngineMode) {}

    /// A non-fatal error was absorbed or a fatal one forced a reset
    fn on_error(&self, _error: &crate::error::Error) {}

    /// Audio playback for a chunk is about to reach the device
    fn on_start_audio(&self, _chunk_index: u32, _pcm: &PcmChunk) {}

    /// Every chunk of the message played and the message is closed
    fn on_all_chunks_complete(&self) {}
}

/// Listener that discards every notification
pub struct NullListener;

impl EngineListener for NullListener {}
