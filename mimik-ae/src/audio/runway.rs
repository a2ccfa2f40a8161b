//! Audio runway
//!
//! Pre-decodes each chunk's MP3 on a single serial worker (kept off the four
//! image-decode workers so the two pipelines never contend), then plays queued
//! PCM on one dedicated audio thread. The conductor reads elapsed/duration
//! through cheap accessors; nothing here ever blocks the render thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::decoder::AudioDecoder;
use crate::audio::sink::AudioSink;
use crate::audio::types::PcmChunk;
use crate::error::{AudioError, Error};
use crate::state::SharedState;

/// Poll step while the playback thread waits on pre-decode
const PRE_DECODE_POLL_STEP: Duration = Duration::from_millis(10);

/// Samples handed to the sink per write; bounds how long a cancel can lag
const PLAYBACK_SLICE: usize = 2048;

/// Pre-decode request queued for the serial worker
struct PreDecodeRequest {
    chunk_index: u32,
    data: Vec<u8>,
    generation: u64,
}

/// Playback request queued for the audio thread
struct PlayRequest {
    chunk_index: u32,
    generation: u64,
}

/// Per-chunk audio runtime state
#[derive(Default)]
struct ChunkAudio {
    /// Decoded PCM; dropped again once the chunk finished playing
    pcm: Option<Arc<PcmChunk>>,

    /// PCM-derived duration; 0 until pre-decode completes
    duration_ms: u64,

    /// Set when the audio thread begins draining this chunk's PCM
    play_start: Option<Instant>,

    /// Pre-decode failed; playback will not wait for this chunk
    failed: bool,
}

struct RunwayShared {
    state: Arc<SharedState>,
    decoder: Arc<dyn AudioDecoder>,

    decode_queue: Mutex<VecDeque<PreDecodeRequest>>,
    decode_condvar: Condvar,

    play_queue: Mutex<VecDeque<PlayRequest>>,
    play_condvar: Condvar,

    chunks: Mutex<HashMap<u32, ChunkAudio>>,

    /// Chunks already triggered this message; start() is exactly-once
    triggered: Mutex<HashSet<u32>>,

    message_active: AtomicBool,
    stop_flag: AtomicBool,
    poll_timeout_ms: u64,
}

/// Pre-decode and playback coordinator for chunk audio
pub struct AudioRunway {
    shared: Arc<RunwayShared>,
    decode_thread: Option<JoinHandle<()>>,
    play_thread: Option<JoinHandle<()>>,
}

impl AudioRunway {
    pub fn new(
        state: Arc<SharedState>,
        decoder: Arc<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
        poll_timeout_ms: u64,
    ) -> Self {
        let shared = Arc::new(RunwayShared {
            state,
            decoder,
            decode_queue: Mutex::new(VecDeque::new()),
            decode_condvar: Condvar::new(),
            play_queue: Mutex::new(VecDeque::new()),
            play_condvar: Condvar::new(),
            chunks: Mutex::new(HashMap::new()),
            triggered: Mutex::new(HashSet::new()),
            message_active: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
            poll_timeout_ms,
        });

        let decode_shared = Arc::clone(&shared);
        let decode_thread = thread::Builder::new()
            .name("mimik-audio-decode".to_string())
            .spawn(move || Self::decode_loop(decode_shared))
            .expect("failed to spawn audio decode thread");

        let play_shared = Arc::clone(&shared);
        let play_thread = thread::Builder::new()
            .name("mimik-audio-play".to_string())
            .spawn(move || Self::play_loop(play_shared, sink))
            .expect("failed to spawn audio playback thread");

        info!("Audio runway started (1 decode worker, 1 playback thread)");

        Self {
            shared,
            decode_thread: Some(decode_thread),
            play_thread: Some(play_thread),
        }
    }

    /// Queue a chunk's MP3 for pre-decode. Idempotent per chunk.
    pub fn pre_decode(&self, chunk_index: u32, data: Vec<u8>) {
        {
            let mut chunks = self.shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
            if chunks.contains_key(&chunk_index) {
                debug!("Chunk {} already queued for pre-decode; ignoring", chunk_index);
                return;
            }
            chunks.insert(chunk_index, ChunkAudio::default());
        }

        let generation = self.shared.state.generation();
        {
            let mut queue = self.shared.decode_queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(PreDecodeRequest {
                chunk_index,
                data,
                generation,
            });
        }
        self.shared.decode_condvar.notify_one();
    }

    /// Trigger playback of a chunk. Exactly-once per (chunk, message).
    ///
    /// Non-blocking: the audio thread does any waiting on pre-decode, bounded
    /// by `pre_decode_poll_timeout_ms`.
    pub fn start(&self, chunk_index: u32) {
        {
            let mut triggered = self.shared.triggered.lock().unwrap_or_else(|e| e.into_inner());
            if !triggered.insert(chunk_index) {
                return;
            }
        }

        debug!("Audio start triggered for chunk {}", chunk_index);
        let generation = self.shared.state.generation();
        {
            let mut queue = self.shared.play_queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(PlayRequest {
                chunk_index,
                generation,
            });
        }
        self.shared.play_condvar.notify_one();
    }

    /// Wall-clock ms since the audio device began consuming this chunk's PCM.
    /// Returns 0 until then.
    pub fn elapsed_for(&self, chunk_index: u32) -> u64 {
        let chunks = self.shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks
            .get(&chunk_index)
            .and_then(|c| c.play_start)
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// PCM-derived duration, or 0 while pre-decode is incomplete
    pub fn duration_for(&self, chunk_index: u32) -> u64 {
        let chunks = self.shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks.get(&chunk_index).map(|c| c.duration_ms).unwrap_or(0)
    }

    /// True once pre-decode failed for the chunk (playback will not wait)
    pub fn is_failed(&self, chunk_index: u32) -> bool {
        let chunks = self.shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks.get(&chunk_index).map(|c| c.failed).unwrap_or(false)
    }

    /// Keep the playback thread primed across inter-chunk gaps
    pub fn mark_message_active(&self) {
        self.shared.message_active.store(true, Ordering::Release);
    }

    /// The message closed; no more chunks are expected
    pub fn mark_message_complete(&self) {
        self.shared.message_active.store(false, Ordering::Release);
    }

    /// Release a finished chunk's PCM; duration and timing stay queryable
    pub fn chunk_finished(&self, chunk_index: u32) {
        let mut chunks = self.shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(chunk) = chunks.get_mut(&chunk_index) {
            chunk.pcm = None;
        }
    }

    /// Cancel all pre-decode, drain playback, reset per-message state.
    ///
    /// The caller bumps the shared generation first, so in-flight decode and
    /// playback observe a stale generation and abandon their work.
    pub fn clear(&self) {
        self.shared.decode_queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.shared.play_queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.shared.chunks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.shared.triggered.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.shared.message_active.store(false, Ordering::Release);
        self.shared.play_condvar.notify_all();
        self.shared.decode_condvar.notify_all();
        debug!("Audio runway cleared");
    }

    /// Serial pre-decode worker
    fn decode_loop(shared: Arc<RunwayShared>) {
        debug!("Audio decode worker started");

        loop {
            let request = {
                let mut queue = shared.decode_queue.lock().unwrap_or_else(|e| e.into_inner());
                while queue.is_empty() && !shared.stop_flag.load(Ordering::Acquire) {
                    queue = shared
                        .decode_condvar
                        .wait(queue)
                        .unwrap_or_else(|e| e.into_inner());
                }
                if shared.stop_flag.load(Ordering::Acquire) {
                    break;
                }
                queue.pop_front()
            };

            let Some(request) = request else { continue };

            if !shared.state.generation_is_current(request.generation) {
                debug!(
                    "Dropping stale pre-decode for chunk {} (generation changed)",
                    request.chunk_index
                );
                continue;
            }

            match shared.decoder.decode(request.chunk_index, &request.data) {
                Ok(pcm) => {
                    let duration_ms = pcm.duration_ms();
                    let mut chunks = shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
                    if !shared.state.generation_is_current(request.generation) {
                        continue;
                    }
                    if let Some(chunk) = chunks.get_mut(&request.chunk_index) {
                        chunk.pcm = Some(Arc::new(pcm));
                        chunk.duration_ms = duration_ms;
                        debug!(
                            "Chunk {} pre-decoded ({}ms)",
                            request.chunk_index, duration_ms
                        );
                    }
                }
                Err(e) => {
                    error!("Pre-decode failed for chunk {}: {}", request.chunk_index, e);
                    let err = Error::Decode(e);
                    shared.state.listener.on_error(&err);
                    let mut chunks = shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(chunk) = chunks.get_mut(&request.chunk_index) {
                        chunk.failed = true;
                    }
                }
            }
        }

        debug!("Audio decode worker exiting");
    }

    /// Dedicated playback thread
    fn play_loop(shared: Arc<RunwayShared>, mut sink: Box<dyn AudioSink>) {
        debug!("Audio playback thread started");

        loop {
            let request = {
                let mut queue = shared.play_queue.lock().unwrap_or_else(|e| e.into_inner());
                while queue.is_empty() && !shared.stop_flag.load(Ordering::Acquire) {
                    queue = shared
                        .play_condvar
                        .wait(queue)
                        .unwrap_or_else(|e| e.into_inner());
                }
                if shared.stop_flag.load(Ordering::Acquire) {
                    break;
                }
                queue.pop_front()
            };

            let Some(request) = request else {
                if !shared.message_active.load(Ordering::Acquire) {
                    debug!("Playback queue drained with no message active");
                }
                continue;
            };

            if !shared.state.generation_is_current(request.generation) {
                continue;
            }

            match Self::wait_for_pcm(&shared, &request) {
                Some(pcm) => Self::play_chunk(&shared, &request, pcm, sink.as_mut()),
                None => continue,
            }
        }

        sink.flush();
        debug!("Audio playback thread exiting");
    }

    /// Poll the pre-decode map until PCM is available, bounded by the
    /// configured ceiling. Returns None on timeout, failure, or cancel.
    fn wait_for_pcm(shared: &RunwayShared, request: &PlayRequest) -> Option<Arc<PcmChunk>> {
        let deadline = Instant::now() + Duration::from_millis(shared.poll_timeout_ms);

        loop {
            if shared.stop_flag.load(Ordering::Acquire)
                || !shared.state.generation_is_current(request.generation)
            {
                return None;
            }

            {
                let chunks = shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
                match chunks.get(&request.chunk_index) {
                    Some(chunk) if chunk.failed => return None,
                    Some(chunk) => {
                        if let Some(pcm) = chunk.pcm.clone() {
                            return Some(pcm);
                        }
                    }
                    // Cleared mid-wait
                    None => return None,
                }
            }

            if Instant::now() >= deadline {
                let err = Error::Audio(AudioError::PreDecodeTimeout {
                    chunk_index: request.chunk_index,
                    waited_ms: shared.poll_timeout_ms,
                });
                warn!("{}", err);
                shared.state.listener.on_error(&err);
                return None;
            }

            thread::sleep(PRE_DECODE_POLL_STEP);
        }
    }

    fn play_chunk(
        shared: &RunwayShared,
        request: &PlayRequest,
        pcm: Arc<PcmChunk>,
        sink: &mut dyn AudioSink,
    ) {
        // Stamp the drain start before the first write; the sink's internal
        // buffering bounds the error to tens of milliseconds.
        {
            let mut chunks = shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
            match chunks.get_mut(&request.chunk_index) {
                Some(chunk) => chunk.play_start = Some(Instant::now()),
                None => return,
            }
        }

        shared.state.listener.on_start_audio(request.chunk_index, &pcm);
        debug!(
            "Playing chunk {} ({}ms of PCM)",
            request.chunk_index,
            pcm.duration_ms()
        );

        for slice in pcm.samples.chunks(PLAYBACK_SLICE) {
            if shared.stop_flag.load(Ordering::Acquire)
                || !shared.state.generation_is_current(request.generation)
            {
                sink.flush();
                return;
            }
            if let Err(e) = sink.write(slice, pcm.sample_rate, pcm.channel_count) {
                let err = Error::Audio(e);
                error!("Audio sink rejected chunk {}: {}", request.chunk_index, err);
                shared.state.listener.on_error(&err);
                return;
            }
        }

        let mut chunks = shared.chunks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(chunk) = chunks.get_mut(&request.chunk_index) {
            chunk.pcm = None;
        }
    }

    /// Signal both threads to stop and join them
    pub fn shutdown(&mut self) {
        self.shared.stop_flag.store(true, Ordering::Release);
        self.shared.decode_condvar.notify_all();
        self.shared.play_condvar.notify_all();

        for handle in [self.decode_thread.take(), self.play_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("Audio runway worker panicked during shutdown");
            }
        }
    }
}

impl Drop for AudioRunway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
