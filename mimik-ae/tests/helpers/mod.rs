//! Shared fixtures for engine integration tests

// Each integration binary uses a different subset of these helpers
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use mimik_ae::audio::{AudioDecoder, NullSink, PcmChunk};
use mimik_ae::error::DecodeError;
use mimik_ae::{
    DecodedImage, Engine, EngineConfig, EngineListener, EngineMode, FrameRecord, ImagePayload,
    InboundEvent,
};

/// Decoder producing silence with a configurable duration per chunk
pub struct StubAudioDecoder {
    pub duration_ms: u64,
}

impl AudioDecoder for StubAudioDecoder {
    fn decode(&self, _chunk_index: u32, _data: &[u8]) -> Result<PcmChunk, DecodeError> {
        let frames = (44_100 * self.duration_ms / 1000) as usize;
        Ok(PcmChunk::new(vec![0.0; frames * 2], 44_100, 2))
    }
}

/// Listener that records every notification with a timestamp
#[derive(Default)]
pub struct CollectingListener {
    inner: Mutex<Collected>,
}

#[derive(Default)]
pub struct Collected {
    pub modes: Vec<EngineMode>,
    pub audio_starts: Vec<(u32, Instant, u64)>,
    pub errors: Vec<String>,
    pub all_complete: u32,
}

impl CollectingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn modes(&self) -> Vec<EngineMode> {
        self.inner.lock().unwrap().modes.clone()
    }

    pub fn audio_starts(&self) -> Vec<(u32, Instant, u64)> {
        self.inner.lock().unwrap().audio_starts.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.lock().unwrap().errors.clone()
    }

    pub fn all_complete_count(&self) -> u32 {
        self.inner.lock().unwrap().all_complete
    }
}

impl EngineListener for CollectingListener {
    fn on_mode(&self, mode: EngineMode) {
        self.inner.lock().unwrap().modes.push(mode);
    }

    fn on_error(&self, error: &mimik_ae::Error) {
        self.inner.lock().unwrap().errors.push(error.to_string());
    }

    fn on_start_audio(&self, chunk_index: u32, pcm: &PcmChunk) {
        self.inner
            .lock()
            .unwrap()
            .audio_starts
            .push((chunk_index, Instant::now(), pcm.duration_ms()));
    }

    fn on_all_chunks_complete(&self) {
        self.inner.lock().unwrap().all_complete += 1;
    }
}

/// Engine wired with the stub audio backend and test base animations
pub fn test_engine(listener: Arc<CollectingListener>, audio_ms: u64) -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let engine = Engine::with_audio(
        EngineConfig::default(),
        listener,
        Arc::new(StubAudioDecoder { duration_ms: audio_ms }),
        Box::new(NullSink),
    );
    engine.register_base_animation("idle", base_frames(6), 1);
    engine.register_base_animation("talk", base_frames(10), 1);
    engine
}

pub fn base_frames(count: usize) -> Vec<Arc<DecodedImage>> {
    (0..count)
        .map(|_| Arc::new(DecodedImage::from_rgba(2, 2, vec![0u8; 16])))
        .collect()
}

pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbaImage::new(2, 2);
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn audio_chunk(chunk: u32, zone: (i32, i32)) -> InboundEvent {
    InboundEvent::AudioChunk {
        chunk_index: chunk,
        data: vec![0u8; 32],
        zone_top_left: zone,
    }
}

pub fn record(chunk: u32, seq: u32, payload: ImagePayload) -> FrameRecord {
    FrameRecord {
        chunk_index: chunk,
        sequence_index: seq,
        section_index: 0,
        animation_name: "talk".to_string(),
        matched_sprite_frame_number: seq,
        overlay_id: Some(format!("c{}s{}", chunk, seq)),
        sheet_filename: "sheet.png".to_string(),
        character: None,
        image: payload,
    }
}

pub fn frame_batch(chunk: u32, range: std::ops::Range<u32>) -> InboundEvent {
    InboundEvent::FrameBatch {
        chunk_index: chunk,
        frames: range.map(|seq| record(chunk, seq, ImagePayload::Bytes(png_bytes()))).collect(),
    }
}

/// Feed a complete well-formed chunk (audio, one batch, chunk_ready)
pub fn feed_chunk(engine: &Engine, chunk: u32, frames: u32, zone: (i32, i32)) {
    engine.submit_event(audio_chunk(chunk, zone));
    engine.submit_event(frame_batch(chunk, 0..frames));
    engine.submit_event(InboundEvent::ChunkReady {
        chunk_index: chunk,
        total_sent: frames,
    });
}
