//! Event demultiplexer
//!
//! Routes inbound events to the decode pool, the audio runway, and the
//! section scheduler, and enforces stream sequencing: `chunk_ready` for a
//! chunk is deferred until every announced frame record has been intaken
//! (batches may arrive in any order, including after `chunk_ready`), and
//! chunk completions always reach the scheduler in ascending chunk order.
//!
//! Intake of a batch completes on the submit path (the pool decodes the
//! first record synchronously and queues the rest), so the gate counts
//! records handed over, not records fully decoded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::audio::runway::AudioRunway;
use crate::error::{Error, ProtocolError};
use crate::events::InboundEvent;
use crate::playback::decode_pool::DecodePool;
use crate::playback::scheduler::SectionScheduler;
use crate::playback::types::OverlayFrame;
use crate::state::SharedState;
use mimik_common::EngineEvent;

/// Per-chunk intake accounting
#[derive(Default)]
struct ChunkIntake {
    frames_intaken: u32,
    /// Set by `chunk_ready`; the gate cannot open before it is known
    announced_total: Option<u32>,
    saw_audio: bool,
    saw_frames: bool,
    /// Gate satisfied but parked behind an earlier chunk
    gate_satisfied: bool,
    fired: bool,
}

#[derive(Default)]
struct DemuxState {
    chunks: HashMap<u32, ChunkIntake>,
    /// Next chunk allowed to fire `on_chunk_complete` (strictly ascending)
    next_fire: u32,
}

pub struct EventDemux {
    state: Arc<SharedState>,
    scheduler: Arc<SectionScheduler>,
    pool: Arc<DecodePool>,
    runway: Arc<AudioRunway>,
    inner: Mutex<DemuxState>,
}

impl EventDemux {
    pub fn new(
        state: Arc<SharedState>,
        scheduler: Arc<SectionScheduler>,
        pool: Arc<DecodePool>,
        runway: Arc<AudioRunway>,
    ) -> Self {
        Self {
            state,
            scheduler,
            pool,
            runway,
            inner: Mutex::new(DemuxState::default()),
        }
    }

    /// Route one inbound event. `reset` is handled by the engine facade and
    /// never reaches the demux.
    pub fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::AudioChunk {
                chunk_index,
                data,
                zone_top_left,
            } => self.on_audio_chunk(chunk_index, data, zone_top_left),

            InboundEvent::FrameBatch { chunk_index, frames } => {
                self.on_frame_batch(chunk_index, frames)
            }

            InboundEvent::ChunkReady {
                chunk_index,
                total_sent,
            } => self.on_chunk_ready(chunk_index, total_sent),

            InboundEvent::AudioEnd => self.on_audio_end(),

            InboundEvent::Reset => {
                debug!("reset reached demux; ignoring (handled by engine)");
            }
        }
    }

    fn on_audio_chunk(&self, chunk_index: u32, data: Vec<u8>, zone_top_left: (i32, i32)) {
        debug!(
            "audio_chunk {}: {} bytes, zone {:?}",
            chunk_index,
            data.len(),
            zone_top_left
        );

        self.state.set_message_active(true);
        self.runway.mark_message_active();
        self.scheduler.set_chunk_zone(chunk_index, zone_top_left);
        self.runway.pre_decode(chunk_index, data);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.chunks.entry(chunk_index).or_default().saw_audio = true;
    }

    fn on_frame_batch(&self, chunk_index: u32, frames: Vec<crate::events::FrameRecord>) {
        self.state.set_message_active(true);

        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.chunks.get(&chunk_index).is_some_and(|c| c.fired) {
                self.protocol_violation(ProtocolError::BatchAfterReady { chunk_index });
                return;
            }
        }

        let count = frames.len() as u32;
        debug!("frame_batch for chunk {}: {} records", chunk_index, count);

        // Stage metadata for section assembly. The event's chunk index is
        // authoritative over any per-record value.
        let metadata: Vec<OverlayFrame> = frames
            .iter()
            .map(|record| {
                let mut frame = OverlayFrame::from_record(record);
                frame.chunk_index = chunk_index;
                frame
            })
            .collect();
        self.scheduler.stash_frames(chunk_index, metadata);

        // Intake the payloads (first record decodes on this path)
        let intaken = self.pool.submit_batch(frames) as u32;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let intake = inner.chunks.entry(chunk_index).or_default();
        intake.saw_frames = true;
        intake.frames_intaken += intaken;
        self.refresh_gate(&mut inner, chunk_index);
        self.fire_in_order(&mut inner);
    }

    fn on_chunk_ready(&self, chunk_index: u32, total_sent: u32) {
        if total_sent == 0 {
            self.protocol_violation(ProtocolError::IndexOutOfRange {
                chunk_index,
                field: "total_sent",
                value: 0,
            });
            return;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let known = inner
            .chunks
            .get(&chunk_index)
            .map(|c| c.saw_audio || c.saw_frames)
            .unwrap_or(false);
        if !known {
            drop(inner);
            self.protocol_violation(ProtocolError::ChunkReadyWithoutChunk { chunk_index });
            return;
        }

        let intake = inner.chunks.entry(chunk_index).or_default();
        if intake.fired {
            debug!("duplicate chunk_ready for {}; ignoring", chunk_index);
            return;
        }
        intake.announced_total = Some(total_sent);

        debug!(
            "chunk_ready {}: {} announced, {} intaken",
            chunk_index, total_sent, intake.frames_intaken
        );

        self.refresh_gate(&mut inner, chunk_index);
        self.fire_in_order(&mut inner);
    }

    fn on_audio_end(&self) {
        debug!("audio_end received");
        self.state.set_audio_end_received(true);
        self.runway.mark_message_complete();
    }

    /// Re-evaluate a chunk's completion gate
    fn refresh_gate(&self, inner: &mut DemuxState, chunk_index: u32) {
        if let Some(intake) = inner.chunks.get_mut(&chunk_index) {
            if intake.fired || intake.gate_satisfied {
                return;
            }
            if let Some(total) = intake.announced_total {
                if intake.frames_intaken >= total {
                    intake.gate_satisfied = true;
                } else {
                    debug!(
                        "chunk {} deferred: {}/{} records intaken",
                        chunk_index, intake.frames_intaken, total
                    );
                }
            }
        }
    }

    /// Fire satisfied gates strictly in chunk order; later chunks whose gate
    /// opened early stay parked until their predecessors fire.
    fn fire_in_order(&self, inner: &mut DemuxState) {
        loop {
            let next = inner.next_fire;
            let ready = inner
                .chunks
                .get(&next)
                .map(|c| c.gate_satisfied && !c.fired)
                .unwrap_or(false);
            if !ready {
                break;
            }

            if let Some(intake) = inner.chunks.get_mut(&next) {
                intake.fired = true;
            }
            inner.next_fire = next + 1;

            debug!("chunk {} intake complete; notifying scheduler", next);
            self.scheduler.on_chunk_complete(next);
        }
    }

    fn protocol_violation(&self, violation: ProtocolError) {
        let err = Error::Protocol(violation);
        warn!("{} (event dropped)", err);
        self.state.bus.emit_lossy(EngineEvent::ProtocolViolation {
            detail: err.to_string(),
            timestamp: chrono::Utc::now(),
        });
        self.state.listener.on_error(&err);
    }

    /// Forget all intake accounting (force_idle path)
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.chunks.clear();
        inner.next_fire = 0;
    }
}
