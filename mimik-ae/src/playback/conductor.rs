//! Conductor
//!
//! Owns the render pull loop. One `pull()` per display refresh resolves the
//! mode state machine, advances the current section (audio-paced when the
//! chunk's PCM is draining, wall-clock otherwise), and emits the next
//! `RenderFrame`. Strictly non-blocking: it reads frame-store readiness and
//! runway timing, then either advances or holds.
//!
//! Pacing rules, in priority order:
//! - audio elapsed and duration known: drive the frame target from audio
//!   progress, clamped by the decode-gate (never step past a not-yet-decoded
//!   overlay; stepping onto one is allowed and triggers skip-draw)
//! - duration known but audio not draining yet: hold, so the first overlay
//!   frame and the audio start together
//! - no audio information: accumulate wall-clock time, one frame per tick

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::audio::runway::AudioRunway;
use crate::playback::frame_store::FrameStore;
use crate::playback::scheduler::SectionScheduler;
use crate::playback::types::{
    BaseRegistry, OverlaySection, PullResult, RenderFrame, RenderOverlay,
};
use crate::state::SharedState;
use mimik_common::{EngineConfig, EngineEvent, EngineMode};

pub struct Conductor {
    cfg: EngineConfig,
    state: Arc<SharedState>,
    store: Arc<FrameStore>,
    scheduler: Arc<SectionScheduler>,
    runway: Arc<AudioRunway>,
    bases: Arc<BaseRegistry>,

    /// Section currently playing; exclusively owned while current
    current: Option<OverlaySection>,

    /// Last emitted frame, re-presented on holds
    prev_frame: Option<RenderFrame>,

    /// Chunk order gate for section starts
    next_expected_chunk: u32,

    /// Consecutive skip-draws on `skip_frame`
    skip_draw_count: u32,
    skip_frame: Option<u32>,

    /// Wall-clock accumulator for the no-audio fallback
    wall_accum: Duration,
    last_pull: Option<Instant>,

    /// Whether the current section has shown at least one frame
    emitted_in_section: bool,

    /// (chunk, section, frame) of the last fresh emission; an unchanged
    /// position re-presents instead of re-composing
    last_emitted_pos: Option<(u32, u32, u32)>,

    /// Idle-animation cursor
    idle_frame: u32,
    last_idle_advance: Option<Instant>,
}

impl Conductor {
    pub fn new(
        cfg: EngineConfig,
        state: Arc<SharedState>,
        store: Arc<FrameStore>,
        scheduler: Arc<SectionScheduler>,
        runway: Arc<AudioRunway>,
        bases: Arc<BaseRegistry>,
    ) -> Self {
        Self {
            cfg,
            state,
            store,
            scheduler,
            runway,
            bases,
            current: None,
            prev_frame: None,
            next_expected_chunk: 0,
            skip_draw_count: 0,
            skip_frame: None,
            wall_accum: Duration::ZERO,
            last_pull: None,
            emitted_in_section: false,
            last_emitted_pos: None,
            idle_frame: 0,
            last_idle_advance: None,
        }
    }

    /// One render pull. Never blocks.
    pub fn pull(&mut self, now: Instant) -> PullResult {
        if self.current.is_none() {
            self.try_start_next(now);
        }

        if self.current.is_some() {
            return self.pull_playing(now);
        }

        match self.state.mode() {
            EngineMode::WaitingNext => self.pull_waiting(now),
            _ => self.pull_idle(now),
        }
    }

    /// The chunk the conductor will start next (diagnostics)
    pub fn next_expected_chunk(&self) -> u32 {
        self.next_expected_chunk
    }

    /// (chunk, section) currently playing, if any (diagnostics)
    pub fn current_section(&self) -> Option<(u32, u32)> {
        self.current.as_ref().map(|s| (s.chunk_index, s.section_index))
    }

    /// Consecutive skip-draw count on the current frame (diagnostics)
    pub fn skip_draw_count(&self) -> u32 {
        self.skip_draw_count
    }

    /// Switch the animation looped while idle
    pub fn set_idle_animation(&mut self, name: impl Into<String>) {
        self.cfg.idle_animation = name.into();
        self.idle_frame = 0;
        self.last_idle_advance = None;
    }

    /// Return to a clean slate (force_idle path). The caller already cleared
    /// the shared collections; mode is set by the engine facade.
    pub fn reset(&mut self) {
        self.current = None;
        self.prev_frame = None;
        self.next_expected_chunk = 0;
        self.skip_draw_count = 0;
        self.skip_frame = None;
        self.wall_accum = Duration::ZERO;
        self.last_pull = None;
        self.emitted_in_section = false;
        self.last_emitted_pos = None;
        self.idle_frame = 0;
        self.last_idle_advance = None;
    }

    /// Pop the queue head if it is the expected chunk and buffer-ready
    fn try_start_next(&mut self, now: Instant) -> bool {
        let Some(mut section) = self.scheduler.try_pop(self.next_expected_chunk) else {
            return false;
        };

        debug!(
            "Starting section {}.{} ({} frames, zone {:?})",
            section.chunk_index,
            section.section_index,
            section.len(),
            section.zone_top_left
        );

        section.playing = true;
        section.started_at = Some(now);

        self.skip_draw_count = 0;
        self.skip_frame = None;
        self.wall_accum = Duration::ZERO;
        self.last_pull = Some(now);
        self.emitted_in_section = false;

        self.state.bus.emit_lossy(EngineEvent::SectionStarted {
            chunk_index: section.chunk_index,
            section_index: section.section_index,
            frame_count: section.len(),
            timestamp: chrono::Utc::now(),
        });

        self.current = Some(section);
        self.state.set_mode(EngineMode::Playing);
        true
    }

    fn pull_playing(&mut self, now: Instant) -> PullResult {
        let dt = self
            .last_pull
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::ZERO);
        self.last_pull = Some(now);

        let frame_interval = Duration::from_millis(self.cfg.frame_interval_ms());
        let max_skips = self.cfg.max_consecutive_skip_draws;

        // The conductor exclusively owns the section while it plays; take it
        // out so the section and the other components borrow independently.
        let Some(mut section) = self.current.take() else {
            return self.hold_previous();
        };

        // Audio trigger strictly before advancement: the advancement below
        // must never pass frame 0 before the chunk's audio is asked to start.
        if !section.audio_started {
            section.audio_started = true;
            section.audio_trigger_at = Some(now);
            section.audio_duration_ms = self.runway.duration_for(section.chunk_index);
            self.runway.start(section.chunk_index);
        }

        // Duration may have been 0 at trigger if pre-decode was unfinished
        if section.audio_duration_ms == 0 {
            section.audio_duration_ms = self.runway.duration_for(section.chunk_index);
        }

        let elapsed = self.runway.elapsed_for(section.chunk_index);
        let duration = section.audio_duration_ms;
        let total = section.len();

        if elapsed > 0 && duration > 0 {
            if elapsed >= duration {
                section.current_drawing_frame = total - 1;
                section.done = true;
            } else {
                let ratio = (elapsed as f64 / duration as f64).min(1.0);
                let target = ((ratio * total as f64).floor() as u32).min(total - 1);
                Self::advance_with_gate(&self.store, &mut section, target);
            }
        } else if duration > 0 {
            // Audio queued but the device has not begun draining: hold so the
            // overlay and the audio start together. The first frame is shown
            // once; after that there is nothing new to compose.
            if self.emitted_in_section {
                self.current = Some(section);
                return self.hold_previous();
            }
        } else {
            // Degenerate fallback: no audio information for this chunk.
            // One frame per elapsed tick; while blocked on an undecoded frame
            // the time debt is capped so recovery does not jump frames.
            self.wall_accum += dt;
            if self.wall_accum >= frame_interval {
                if !self.emitted_in_section {
                    // The section's first frame has not been shown yet
                    self.wall_accum = frame_interval;
                } else if section.at_last_frame() {
                    // Jitter hold: keep the last overlay up while the next
                    // section exists but cannot start yet.
                    if self.scheduler.head_buffer_ready() == Some(false) {
                        section.holding_last_frame = true;
                        self.wall_accum = frame_interval;
                    } else {
                        section.done = true;
                    }
                } else {
                    let cur_ready = self.store.is_ready(&section.current_frame().overlay_id);
                    let recovering = self.skip_frame == Some(section.current_drawing_frame);
                    if cur_ready && !recovering {
                        section.current_drawing_frame += 1;
                        self.wall_accum -= frame_interval;
                    } else {
                        // Blocked on (or just recovered from) an undecoded
                        // frame; show it before the cadence resumes
                        self.wall_accum = frame_interval;
                    }
                }
            }
        }

        if section.at_last_frame() && !section.done {
            section.holding_last_frame = self.scheduler.head_buffer_ready() == Some(false);
        }

        // Skip-draw: the resolved frame may have stepped onto an overlay that
        // has not decoded. Re-present the previous frame and count; at the
        // ceiling, drop the frame.
        let current_index = section.current_drawing_frame;
        if !self.store.is_ready(&section.current_frame().overlay_id) {
            let same_frame = self.skip_frame == Some(current_index);
            self.skip_draw_count = if same_frame { self.skip_draw_count + 1 } else { 1 };
            self.skip_frame = Some(current_index);

            if self.skip_draw_count >= max_skips {
                warn!(
                    "Dropping frame {} of section {}.{} after {} skip-draws",
                    current_index, section.chunk_index, section.section_index, self.skip_draw_count
                );
                self.state.bus.emit_lossy(EngineEvent::SkipDrawTimeout {
                    chunk_index: section.chunk_index,
                    section_index: section.section_index,
                    frame_index: current_index,
                    timestamp: chrono::Utc::now(),
                });
                self.skip_draw_count = 0;
                self.skip_frame = None;

                if section.at_last_frame() {
                    section.done = true;
                } else {
                    section.current_drawing_frame += 1;
                }

                if !section.done && !self.store.is_ready(&section.current_frame().overlay_id) {
                    // The next frame is stuck too; its own count starts now.
                    self.skip_draw_count = 1;
                    self.skip_frame = Some(section.current_drawing_frame);
                    self.current = Some(section);
                    return self.hold_previous();
                }
            } else {
                self.current = Some(section);
                return self.hold_previous();
            }
        }

        let result = self.emit_section_frame(&section, now);

        if section.done {
            self.complete_section(section, now);
        } else {
            self.current = Some(section);
        }

        result
    }

    /// Advance toward `target`, stepping onto (but never past) the first
    /// overlay that is not yet decoded.
    fn advance_with_gate(store: &FrameStore, section: &mut OverlaySection, target: u32) {
        let target = target.min(section.len().saturating_sub(1));
        while section.current_drawing_frame < target {
            let cur = section.current_frame();
            if !store.is_ready(&cur.overlay_id) {
                break;
            }
            section.current_drawing_frame += 1;
        }
    }

    /// Compose and emit the frame at the section's current drawing position.
    /// Re-presents the previous output when the position has not moved.
    fn emit_section_frame(&mut self, section: &OverlaySection, now: Instant) -> PullResult {
        let position = (
            section.chunk_index,
            section.section_index,
            section.current_drawing_frame,
        );
        if self.last_emitted_pos == Some(position) && self.prev_frame.is_some() {
            return self.hold_previous();
        }

        let frame = section.current_frame();

        let Some(base_anim) = self.bases.get(&frame.animation_name) else {
            debug!("No base animation '{}' registered; holding", frame.animation_name);
            return self.hold_previous();
        };
        let base_len = base_anim.total_frames();
        if base_len == 0 {
            return self.hold_previous();
        }

        // The server's matched frame number is authoritative; mod base length
        // keeps it valid for any base-animation build.
        let base_index = (frame.matched_sprite_frame_number as usize % base_len) as u32;
        let Some(base) = base_anim.frame(base_index as usize).cloned() else {
            debug!(
                "Base frame {}/{} not populated; holding",
                frame.animation_name, base_index
            );
            return self.hold_previous();
        };

        let Some(overlay_image) = self.store.get(&frame.overlay_id) else {
            // Readiness was checked above; a miss here means a concurrent
            // reset, which the next pull observes.
            return self.hold_previous();
        };

        self.skip_draw_count = 0;
        self.skip_frame = None;
        self.emitted_in_section = true;
        self.last_emitted_pos = Some(position);

        let render = RenderFrame {
            base,
            overlay: Some(RenderOverlay {
                image: overlay_image,
                position: section.zone_top_left,
            }),
            animation_name: frame.animation_name.clone(),
            base_frame_index: base_index,
            emitted_at: now,
        };
        self.prev_frame = Some(render.clone());
        PullResult::Frame(render)
    }

    /// The current section finished; advance the chunk gate and move on
    fn complete_section(&mut self, section: OverlaySection, now: Instant) {
        let chunk = section.chunk_index;
        debug!("Section {}.{} done", chunk, section.section_index);

        if !self.scheduler.has_queued_sections_for(chunk) {
            self.state.bus.emit_lossy(EngineEvent::ChunkPlaybackComplete {
                chunk_index: chunk,
                timestamp: chrono::Utc::now(),
            });
            self.runway.chunk_finished(chunk);
            self.next_expected_chunk = chunk + 1;
        }

        if self.try_start_next(now) {
            return;
        }

        if self.message_finished() {
            self.complete_message();
        } else {
            self.state.set_mode(EngineMode::WaitingNext);
        }
    }

    /// Section done, message still open: hold until the next section is
    /// ready or `audio_end` closes the message.
    fn pull_waiting(&mut self, now: Instant) -> PullResult {
        if self.message_finished() {
            self.complete_message();
            return self.pull_idle(now);
        }
        self.hold_previous()
    }

    fn message_finished(&self) -> bool {
        self.state.audio_end_received() && self.scheduler.is_queue_empty()
    }

    fn complete_message(&mut self) {
        debug!("All chunks complete; returning to idle");
        self.state.bus.emit_lossy(EngineEvent::AllChunksComplete {
            timestamp: chrono::Utc::now(),
        });
        self.state.listener.on_all_chunks_complete();
        self.state.set_message_active(false);
        self.state.set_audio_end_received(false);
        self.state.set_mode(EngineMode::Idle);
    }

    /// Idle loop: successive frames of the designated idle animation,
    /// throttled to `idle_fps` regardless of the pull rate.
    fn pull_idle(&mut self, now: Instant) -> PullResult {
        let Some(anim) = self.bases.get(&self.cfg.idle_animation) else {
            return self.hold_previous();
        };
        let total = anim.total_frames();
        if total == 0 {
            return self.hold_previous();
        }

        let idle_interval = Duration::from_millis(self.cfg.idle_interval_ms());
        let advance_due = match self.last_idle_advance {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= idle_interval,
        };
        if !advance_due {
            return self.hold_previous();
        }

        if self.last_idle_advance.is_some() {
            self.idle_frame = (self.idle_frame + 1) % total as u32;
        } else {
            self.idle_frame = 0;
        }
        self.last_idle_advance = Some(now);

        let Some(base) = anim.frame(self.idle_frame as usize).cloned() else {
            return self.hold_previous();
        };

        let render = RenderFrame {
            base,
            overlay: None,
            animation_name: anim.name.clone(),
            base_frame_index: self.idle_frame,
            emitted_at: now,
        };
        self.prev_frame = Some(render.clone());
        PullResult::Frame(render)
    }

    fn hold_previous(&self) -> PullResult {
        match &self.prev_frame {
            Some(frame) => PullResult::Held(frame.clone()),
            None => PullResult::Empty,
        }
    }
}
