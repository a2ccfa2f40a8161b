//! Engine facade
//!
//! One explicit value owned by the embedding shell; every component is
//! reachable from it and no module-global state exists. The shell drives it
//! from two directions: the transport calls [`Engine::submit_event`], the
//! display surface calls [`Engine::pull_render_frame`] once per refresh.

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};

use crate::audio::decoder::{AudioDecoder, SymphoniaDecoder};
use crate::audio::runway::AudioRunway;
use crate::audio::sink::{AudioSink, CpalSink};
use crate::error::Result;
use crate::events::{EngineListener, InboundEvent};
use crate::playback::conductor::Conductor;
use crate::playback::decode_pool::DecodePool;
use crate::playback::demux::EventDemux;
use crate::playback::frame_store::FrameStore;
use crate::playback::scheduler::SectionScheduler;
use crate::playback::types::{
    BaseAnimation, BaseRegistry, DecodedImage, PullResult, RenderSink,
};
use crate::state::SharedState;
use mimik_common::{EngineConfig, EngineEvent, EngineMode};

/// Point-in-time view of the engine internals (diagnostics)
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub mode: EngineMode,
    pub message_active: bool,
    pub audio_end_received: bool,
    pub queued_sections: usize,
    pub decoded_overlays: usize,
    pub pending_decodes: usize,
    pub current_section: Option<(u32, u32)>,
    pub next_expected_chunk: u32,
    pub skip_draw_count: u32,
}

/// The streaming avatar animation engine
pub struct Engine {
    state: Arc<SharedState>,
    store: Arc<FrameStore>,
    scheduler: Arc<SectionScheduler>,
    pool: Arc<DecodePool>,
    runway: Arc<AudioRunway>,
    bases: Arc<BaseRegistry>,
    demux: EventDemux,
    conductor: Mutex<Conductor>,
}

impl Engine {
    /// Create an engine with the production audio backend (symphonia MP3
    /// decode, cpal output on the default device).
    pub fn new(config: EngineConfig, listener: Arc<dyn EngineListener>) -> Result<Self> {
        Ok(Self::with_audio(
            config,
            listener,
            Arc::new(SymphoniaDecoder),
            Box::new(CpalSink::new(None)),
        ))
    }

    /// Create an engine with an injected audio decoder and sink
    pub fn with_audio(
        config: EngineConfig,
        listener: Arc<dyn EngineListener>,
        decoder: Arc<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        let state = Arc::new(SharedState::new(config.event_bus_capacity, listener));
        let store = Arc::new(FrameStore::new());
        let scheduler = Arc::new(SectionScheduler::new(Arc::clone(&store), config.buffer_min));
        let pool = Arc::new(DecodePool::new(
            Arc::clone(&store),
            Arc::clone(&state),
            config.decode_workers,
            config.decode_batch_yield,
        ));
        let runway = Arc::new(AudioRunway::new(
            Arc::clone(&state),
            decoder,
            sink,
            config.pre_decode_poll_timeout_ms,
        ));
        let bases = Arc::new(BaseRegistry::new());

        let demux = EventDemux::new(
            Arc::clone(&state),
            Arc::clone(&scheduler),
            Arc::clone(&pool),
            Arc::clone(&runway),
        );
        let conductor = Conductor::new(
            config,
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&scheduler),
            Arc::clone(&runway),
            Arc::clone(&bases),
        );

        info!("Engine created");

        Self {
            state,
            store,
            scheduler,
            pool,
            runway,
            bases,
            demux,
            conductor: Mutex::new(conductor),
        }
    }

    /// Feed one inbound event from the transport
    pub fn submit_event(&self, event: InboundEvent) {
        tracing::trace!("submit_event: {}", event.kind());
        match event {
            InboundEvent::Reset => {
                info!("reset event received");
                self.force_idle_now();
            }
            other => self.demux.handle_event(other),
        }
    }

    /// Parse and feed one JSON-encoded event
    pub fn submit_json(&self, text: &str) -> Result<()> {
        let event = InboundEvent::from_json(text)
            .map_err(|e| crate::error::Error::Other(anyhow::anyhow!("bad event: {}", e)))?;
        self.submit_event(event);
        Ok(())
    }

    /// One render pull; call once per display refresh
    pub fn pull_render_frame(&self) -> PullResult {
        self.conductor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pull(Instant::now())
    }

    /// Pull and, when a fresh frame came out, present it to the sink.
    /// Returns true when something was presented.
    pub fn render_into(&self, sink: &mut dyn RenderSink) -> bool {
        match self.pull_render_frame() {
            PullResult::Frame(frame) => {
                sink.present(&frame);
                true
            }
            PullResult::Held(_) | PullResult::Empty => false,
        }
    }

    /// Abort the current message and return every component to a clean
    /// state. Called by the shell before submitting a new message so stale
    /// sections cannot leak into the next response.
    pub fn force_idle_now(&self) {
        let generation = self.state.bump_generation();
        info!("force_idle_now (generation {})", generation);

        self.pool.clear();
        self.runway.clear();
        self.store.clear_all();
        self.scheduler.clear();
        self.demux.clear();
        self.conductor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();

        self.state.set_message_active(false);
        self.state.set_audio_end_received(false);
        self.state.set_mode(EngineMode::Idle);
        self.state.bus.emit_lossy(EngineEvent::EngineReset {
            timestamp: chrono::Utc::now(),
        });
    }

    /// Register a fully-loaded base animation
    pub fn register_base_animation(
        &self,
        name: impl Into<String>,
        frames: Vec<Arc<DecodedImage>>,
        manifest_version: u32,
    ) {
        let name = name.into();
        if frames.is_empty() {
            warn!("Ignoring empty base animation '{}'", name);
            return;
        }
        self.bases
            .register(BaseAnimation::complete(name, frames, manifest_version));
    }

    /// Register a base animation assembled elsewhere (possibly sparse)
    pub fn register_base(&self, animation: BaseAnimation) {
        self.bases.register(animation);
    }

    /// Switch the animation looped while idle
    pub fn set_idle_animation(&self, name: impl Into<String>) {
        self.conductor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_idle_animation(name);
    }

    pub fn mode(&self) -> EngineMode {
        self.state.mode()
    }

    /// Subscribe to engine diagnostics events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.state.bus.subscribe()
    }

    /// Point-in-time diagnostics
    pub fn snapshot(&self) -> EngineSnapshot {
        let conductor = self.conductor.lock().unwrap_or_else(|e| e.into_inner());
        EngineSnapshot {
            mode: self.state.mode(),
            message_active: self.state.message_active(),
            audio_end_received: self.state.audio_end_received(),
            queued_sections: self.scheduler.queue_len(),
            decoded_overlays: self.store.ready_count(),
            pending_decodes: self.pool.queue_len(),
            current_section: conductor.current_section(),
            next_expected_chunk: conductor.next_expected_chunk(),
            skip_draw_count: conductor.skip_draw_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::NullSink;
    use crate::audio::types::PcmChunk;
    use crate::error::DecodeError;
    use crate::events::{FrameRecord, ImagePayload, NullListener};

    struct StubDecoder;

    impl AudioDecoder for StubDecoder {
        fn decode(
            &self,
            _chunk_index: u32,
            _data: &[u8],
        ) -> std::result::Result<PcmChunk, DecodeError> {
            Ok(PcmChunk::new(vec![0.0; 8820], 44_100, 2))
        }
    }

    fn engine() -> Engine {
        Engine::with_audio(
            EngineConfig::default(),
            Arc::new(NullListener),
            Arc::new(StubDecoder),
            Box::new(NullSink),
        )
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::new(1, 1);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn feed_chunk(engine: &Engine, chunk: u32, frames: u32) {
        engine.submit_event(InboundEvent::AudioChunk {
            chunk_index: chunk,
            data: vec![0; 8],
            zone_top_left: (50, 60),
        });
        let records = (0..frames)
            .map(|seq| FrameRecord {
                chunk_index: chunk,
                sequence_index: seq,
                section_index: 0,
                animation_name: "talk".to_string(),
                matched_sprite_frame_number: seq,
                overlay_id: Some(format!("c{}s{}", chunk, seq)),
                sheet_filename: "sheet.png".to_string(),
                character: None,
                image: ImagePayload::Bytes(png_bytes()),
            })
            .collect();
        engine.submit_event(InboundEvent::FrameBatch {
            chunk_index: chunk,
            frames: records,
        });
        engine.submit_event(InboundEvent::ChunkReady {
            chunk_index: chunk,
            total_sent: frames,
        });
    }

    #[test]
    fn starts_idle_and_empty() {
        let engine = engine();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.mode, EngineMode::Idle);
        assert_eq!(snapshot.queued_sections, 0);
        assert_eq!(snapshot.decoded_overlays, 0);
        assert!(matches!(engine.pull_render_frame(), PullResult::Empty));
    }

    #[test]
    fn events_queue_sections() {
        let engine = engine();
        feed_chunk(&engine, 0, 4);

        let snapshot = engine.snapshot();
        assert!(snapshot.message_active);
        assert_eq!(snapshot.queued_sections, 1);
        assert!(snapshot.decoded_overlays >= 1);
    }

    #[test]
    fn force_idle_clears_every_collection() {
        let engine = engine();
        feed_chunk(&engine, 0, 4);
        engine.submit_event(InboundEvent::AudioEnd);

        engine.force_idle_now();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.mode, EngineMode::Idle);
        assert!(!snapshot.message_active);
        assert!(!snapshot.audio_end_received);
        assert_eq!(snapshot.queued_sections, 0);
        assert_eq!(snapshot.decoded_overlays, 0, "no stale overlays may remain");
        assert_eq!(snapshot.next_expected_chunk, 0);
    }

    #[test]
    fn reset_event_is_force_idle() {
        let engine = engine();
        let mut rx = engine.subscribe();
        feed_chunk(&engine, 0, 4);

        engine.submit_event(InboundEvent::Reset);

        assert_eq!(engine.mode(), EngineMode::Idle);
        let saw_reset = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| matches!(e, EngineEvent::EngineReset { .. }));
        assert!(saw_reset);
    }

    #[test]
    fn submit_json_parses_and_routes() {
        let engine = engine();
        engine
            .submit_json(r#"{"type": "audio_chunk", "chunk_index": 0, "data": [1], "zone_top_left": [0, 0]}"#)
            .unwrap();
        assert!(engine.snapshot().message_active);

        assert!(engine.submit_json("not json").is_err());
    }

    #[test]
    fn empty_base_animation_is_rejected() {
        let engine = engine();
        engine.register_base_animation("idle", Vec::new(), 1);
        assert!(matches!(engine.pull_render_frame(), PullResult::Empty));
    }
}
