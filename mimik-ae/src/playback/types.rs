//! Core playback data types
//!
//! Overlay frames and sections, base animations, and the frames the conductor
//! emits to the render surface.

use std::sync::Arc;
use std::time::Instant;

use crate::error::DecodeError;
use crate::events::FrameRecord;

/// A decoded RGBA8 image ready for compositing
///
/// Decoupled from the codec layer so the render surface can upload pixels
/// without caring how they arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8, row-major, `width * height * 4` bytes
    pub rgba: Vec<u8>,
}

impl DecodedImage {
    /// Decode from encoded image bytes (PNG/JPEG)
    pub fn from_encoded(key: &str, bytes: &[u8]) -> Result<Self, DecodeError> {
        let dynamic = image::load_from_memory(bytes).map_err(|e| DecodeError::Image {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let rgba = dynamic.to_rgba8();
        Ok(Self {
            width: rgba.width(),
            height: rgba.height(),
            rgba: rgba.into_raw(),
        })
    }

    /// Wrap raw RGBA8 pixels (used by base-animation registration)
    pub fn from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        debug_assert_eq!(rgba.len(), (width * height * 4) as usize);
        Self { width, height, rgba }
    }
}

/// A single overlay sprite record, resolved from the wire format
///
/// `overlay_id` here is always the resolved content-addressed cache key
/// (server id, or the animation/frame/sheet fallback).
#[derive(Debug, Clone)]
pub struct OverlayFrame {
    pub sequence_index: u32,
    pub animation_name: String,
    /// Index into the base-frame array of `animation_name`, authoritative
    /// from the server; reduced mod the base length at render time.
    pub matched_sprite_frame_number: u32,
    pub overlay_id: String,
    pub character: Option<String>,
    pub chunk_index: u32,
    pub section_index: u32,
}

impl OverlayFrame {
    /// Build the metadata record for a wire frame (image bytes go to the
    /// decode pool separately).
    pub fn from_record(record: &FrameRecord) -> Self {
        Self {
            sequence_index: record.sequence_index,
            animation_name: record.animation_name.clone(),
            matched_sprite_frame_number: record.matched_sprite_frame_number,
            overlay_id: record.cache_key(),
            character: record.character.clone(),
            chunk_index: record.chunk_index,
            section_index: record.section_index,
        }
    }
}

/// A contiguous run of overlay frames that plays as a unit
///
/// Frames are immutable after construction; the mutable fields are playback
/// state owned exclusively by the conductor while the section is current.
#[derive(Debug)]
pub struct OverlaySection {
    frames: Vec<OverlayFrame>,
    pub chunk_index: u32,
    pub section_index: u32,
    pub animation_name: String,
    /// Overlay placement on the base frame, in base-frame pixel coordinates
    pub zone_top_left: (i32, i32),

    // Playback state
    pub playing: bool,
    pub current_drawing_frame: u32,
    pub done: bool,
    pub holding_last_frame: bool,
    pub started_at: Option<Instant>,
    pub audio_started: bool,
    pub audio_trigger_at: Option<Instant>,
    pub audio_duration_ms: u64,
}

impl OverlaySection {
    /// Build a section from sorted frames.
    ///
    /// Callers must pass a non-empty run sorted by `sequence_index` with a
    /// single `animation_name`.
    pub fn new(frames: Vec<OverlayFrame>, zone_top_left: (i32, i32)) -> Self {
        debug_assert!(!frames.is_empty());
        debug_assert!(frames.windows(2).all(|w| w[0].sequence_index < w[1].sequence_index));

        let first = &frames[0];
        Self {
            chunk_index: first.chunk_index,
            section_index: first.section_index,
            animation_name: first.animation_name.clone(),
            zone_top_left,
            playing: false,
            current_drawing_frame: 0,
            done: false,
            holding_last_frame: false,
            started_at: None,
            audio_started: false,
            audio_trigger_at: None,
            audio_duration_ms: 0,
            frames,
        }
    }

    pub fn frames(&self) -> &[OverlayFrame] {
        &self.frames
    }

    pub fn len(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The frame at the current drawing position
    pub fn current_frame(&self) -> &OverlayFrame {
        &self.frames[self.current_drawing_frame as usize]
    }

    pub fn at_last_frame(&self) -> bool {
        self.current_drawing_frame + 1 >= self.len()
    }

    /// Overlay cache keys in play order
    pub fn overlay_keys(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(|f| f.overlay_id.as_str())
    }
}

/// A looping base animation, keyed by name, served ahead of time
///
/// Slots may fill in any order while the disk cache streams in; the array
/// length never changes after registration.
#[derive(Debug, Clone)]
pub struct BaseAnimation {
    pub name: String,
    pub manifest_version: u32,
    frames: Vec<Option<Arc<DecodedImage>>>,
    filled: usize,
}

impl BaseAnimation {
    /// Create with every slot empty
    pub fn with_slots(name: impl Into<String>, total_frames: usize, manifest_version: u32) -> Self {
        Self {
            name: name.into(),
            manifest_version,
            frames: vec![None; total_frames],
            filled: 0,
        }
    }

    /// Create fully loaded from an already-decoded frame array
    pub fn complete(
        name: impl Into<String>,
        frames: Vec<Arc<DecodedImage>>,
        manifest_version: u32,
    ) -> Self {
        let filled = frames.len();
        Self {
            name: name.into(),
            manifest_version,
            frames: frames.into_iter().map(Some).collect(),
            filled,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Fill one slot. The array length is fixed; out-of-range is an error.
    pub fn set_frame(&mut self, index: usize, image: Arc<DecodedImage>) -> Result<(), String> {
        match self.frames.get_mut(index) {
            Some(slot) => {
                if slot.is_none() {
                    self.filled += 1;
                }
                *slot = Some(image);
                Ok(())
            }
            None => Err(format!(
                "frame index {} out of range for '{}' ({} slots)",
                index,
                self.name,
                self.frames.len()
            )),
        }
    }

    pub fn frame(&self, index: usize) -> Option<&Arc<DecodedImage>> {
        self.frames.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn is_complete(&self) -> bool {
        !self.frames.is_empty() && self.filled == self.frames.len()
    }
}

/// Registry of base animations, keyed by name
///
/// Arrays are write-once-publish-then-immutable: registration swaps in a new
/// `Arc`, and the conductor reads through a cheap lock without ever blocking
/// on decode.
#[derive(Default)]
pub struct BaseRegistry {
    inner: std::sync::RwLock<std::collections::HashMap<String, Arc<BaseAnimation>>>,
}

impl BaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an animation, replacing any prior version of the same name
    pub fn register(&self, animation: BaseAnimation) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(animation.name.clone(), Arc::new(animation));
    }

    pub fn get(&self, name: &str) -> Option<Arc<BaseAnimation>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.contains_key(name)
    }
}

/// An overlay blit: sprite plus placement
#[derive(Debug, Clone)]
pub struct RenderOverlay {
    pub image: Arc<DecodedImage>,
    pub position: (i32, i32),
}

/// One composited display frame published to the render surface
#[derive(Debug, Clone)]
pub struct RenderFrame {
    pub base: Arc<DecodedImage>,
    pub overlay: Option<RenderOverlay>,
    pub animation_name: String,
    pub base_frame_index: u32,
    pub emitted_at: Instant,
}

/// Result of one render pull
#[derive(Debug, Clone)]
pub enum PullResult {
    /// A freshly composed frame
    Frame(RenderFrame),

    /// Re-present the previous frame unchanged (skip-draw, jitter hold, or
    /// idle throttling)
    Held(RenderFrame),

    /// Nothing to show yet (no frame emitted and no idle animation)
    Empty,
}

impl PullResult {
    /// The frame to rasterize, fresh or held
    pub fn frame(&self) -> Option<&RenderFrame> {
        match self {
            PullResult::Frame(f) | PullResult::Held(f) => Some(f),
            PullResult::Empty => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, PullResult::Frame(_))
    }
}

/// Rasterization seam: the platform surface draws base + feathered overlay.
/// The engine never touches GPU APIs.
pub trait RenderSink {
    fn present(&mut self, frame: &RenderFrame);
}
