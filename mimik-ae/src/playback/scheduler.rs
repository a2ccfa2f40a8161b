//! Section scheduler
//!
//! Stages each chunk's overlay metadata as batches arrive, then builds
//! playable sections when the chunk completes: frames sorted by sequence,
//! split where the animation changes, placed with the chunk-level zone.
//! Sections wait in a queue strictly ordered by (chunk, section); the
//! conductor pops the head only when it is the expected chunk and its
//! buffer-ready prefix has decoded.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::playback::frame_store::FrameStore;
use crate::playback::types::{OverlayFrame, OverlaySection};

/// Per-chunk staging area while batches stream in
#[derive(Default)]
struct StagedChunk {
    zone_top_left: Option<(i32, i32)>,
    frames: Vec<OverlayFrame>,
}

#[derive(Default)]
struct SchedulerState {
    staged: HashMap<u32, StagedChunk>,
    queue: BTreeMap<(u32, u32), OverlaySection>,
}

pub struct SectionScheduler {
    store: Arc<FrameStore>,
    buffer_min: u32,
    inner: Mutex<SchedulerState>,
}

impl SectionScheduler {
    pub fn new(store: Arc<FrameStore>, buffer_min: u32) -> Self {
        Self {
            store,
            buffer_min,
            inner: Mutex::new(SchedulerState::default()),
        }
    }

    /// Record the authoritative overlay placement for a chunk
    pub fn set_chunk_zone(&self, chunk_index: u32, zone_top_left: (i32, i32)) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.staged.entry(chunk_index).or_default().zone_top_left = Some(zone_top_left);
    }

    /// Stage overlay metadata from one frame batch
    pub fn stash_frames(&self, chunk_index: u32, frames: Vec<OverlayFrame>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .staged
            .entry(chunk_index)
            .or_default()
            .frames
            .extend(frames);
    }

    /// All batches for the chunk are in; build and enqueue its sections
    pub fn on_chunk_complete(&self, chunk_index: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let Some(mut staged) = inner.staged.remove(&chunk_index) else {
            warn!("chunk_complete for chunk {} with nothing staged", chunk_index);
            return;
        };

        if staged.frames.is_empty() {
            warn!("Chunk {} completed with zero frames", chunk_index);
            return;
        }

        let zone = staged.zone_top_left.unwrap_or_else(|| {
            warn!("Chunk {} has no zone; overlays placed at origin", chunk_index);
            (0, 0)
        });

        staged.frames.sort_by_key(|f| f.sequence_index);

        // Split into sections where the animation changes
        let mut sections: Vec<Vec<OverlayFrame>> = Vec::new();
        for frame in staged.frames {
            match sections.last_mut() {
                Some(run) if run.last().map(|f| f.animation_name.as_str())
                    == Some(frame.animation_name.as_str()) =>
                {
                    run.push(frame);
                }
                _ => sections.push(vec![frame]),
            }
        }

        let section_count = sections.len();
        for (idx, frames) in sections.into_iter().enumerate() {
            let mut section = OverlaySection::new(frames, zone);
            // The split defines section numbering within the chunk
            section.section_index = idx as u32;
            inner.queue.insert((chunk_index, idx as u32), section);
        }

        debug!(
            "Chunk {} complete: {} section(s) queued (queue depth {})",
            chunk_index,
            section_count,
            inner.queue.len()
        );
    }

    /// Buffer-ready predicate: the first `min(buffer_min, len)` overlays of
    /// the section have decoded. The conductor's per-frame decode-gate covers
    /// the rest.
    pub fn is_buffer_ready(&self, section: &OverlaySection) -> bool {
        let need = (self.buffer_min).min(section.len()) as usize;
        self.store.first_n_ready(section.overlay_keys(), need)
    }

    /// Pop the queue head if it belongs to `expected_chunk` and is
    /// buffer-ready. Chunk order is never violated: a ready section for a
    /// later chunk stays queued while an earlier chunk is expected.
    pub fn try_pop(&self, expected_chunk: u32) -> Option<OverlaySection> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let (&key, head) = inner.queue.iter().next()?;
        if key.0 != expected_chunk {
            return None;
        }
        if !self.is_buffer_ready(head) {
            return None;
        }
        inner.queue.remove(&key)
    }

    /// (chunk, section) of the queue head, if any
    pub fn head(&self) -> Option<(u32, u32)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queue.keys().next().copied()
    }

    /// Whether the queue head is buffer-ready (jitter-hold check)
    pub fn head_buffer_ready(&self) -> Option<bool> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (_, head) = inner.queue.iter().next()?;
        Some(self.is_buffer_ready(head))
    }

    /// True when any section of `chunk_index` is still queued
    pub fn has_queued_sections_for(&self, chunk_index: u32) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queue.keys().any(|(c, _)| *c == chunk_index)
    }

    pub fn queue_len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queue.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue_len() == 0
    }

    /// Drop all staged chunks and queued sections
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.staged.clear();
        inner.queue.clear();
    }
}
