//! Decode pool
//!
//! Bounded-parallelism decoder for overlay sprite payloads. The first record
//! of every batch is decoded synchronously on the caller path so section
//! buffer-readiness can observe progress before the caller yields; the
//! remainder is fanned out to the worker threads. Workers yield to the OS
//! scheduler every few records so they never starve the render pull.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::events::{FrameRecord, ImagePayload};
use crate::playback::frame_store::FrameStore;
use crate::playback::types::DecodedImage;
use crate::state::SharedState;

/// One sprite decode job
struct DecodeJob {
    key: String,
    payload: ImagePayload,
    generation: u64,
}

/// Shared state for the decode pool
struct SharedPoolState {
    /// FIFO of pending jobs; batches arrive roughly in play order
    queue: Mutex<VecDeque<DecodeJob>>,

    /// Condition variable for notifying workers
    condvar: Condvar,

    /// Stop flag for shutdown
    stop_flag: AtomicBool,

    store: Arc<FrameStore>,
    engine: Arc<SharedState>,

    /// Workers yield to the scheduler every this many records
    batch_yield: usize,
}

/// Multi-threaded sprite decoder
pub struct DecodePool {
    state: Arc<SharedPoolState>,
    threads: Vec<JoinHandle<()>>,
}

impl DecodePool {
    pub fn new(
        store: Arc<FrameStore>,
        engine: Arc<SharedState>,
        workers: usize,
        batch_yield: usize,
    ) -> Self {
        let state = Arc::new(SharedPoolState {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop_flag: AtomicBool::new(false),
            store,
            engine,
            batch_yield: batch_yield.max(1),
        });

        let mut threads = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let state_clone = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name(format!("mimik-decode-{}", worker_id))
                .spawn(move || Self::worker_loop(worker_id, state_clone))
                .expect("failed to spawn decode worker");
            threads.push(handle);
        }

        info!("Decode pool started with {} worker threads", workers);

        Self { state, threads }
    }

    /// Intake one frame batch.
    ///
    /// Decodes the first not-yet-ready record synchronously, queues the rest,
    /// and returns the number of records intaken. Intake is complete when
    /// this returns; decode completion is observed through the frame store.
    pub fn submit_batch(&self, records: Vec<FrameRecord>) -> usize {
        let generation = self.state.engine.generation();
        let count = records.len();

        let mut jobs: Vec<DecodeJob> = records
            .into_iter()
            .filter_map(|record| {
                let key = record.cache_key();
                // Content-addressed: an already-decoded key needs no work
                if self.state.store.is_ready(&key) {
                    None
                } else {
                    Some(DecodeJob {
                        key,
                        payload: record.image,
                        generation,
                    })
                }
            })
            .collect();

        if let Some(first) = jobs.first() {
            debug!(
                "Intaking batch of {} records ({} to decode), first key {}",
                count,
                jobs.len(),
                first.key
            );
        }

        // First record on the caller path
        if !jobs.is_empty() {
            let first = jobs.remove(0);
            Self::decode_job(&self.state, first);
        }

        if !jobs.is_empty() {
            let mut queue = self.state.queue.lock().unwrap_or_else(|e| e.into_inner());
            for job in jobs {
                queue.push_back(job);
            }
            drop(queue);
            self.state.condvar.notify_all();
        }

        count
    }

    /// Worker thread main loop
    fn worker_loop(worker_id: usize, state: Arc<SharedPoolState>) {
        debug!("Decode worker {} started", worker_id);
        let mut since_yield = 0usize;

        loop {
            let job = {
                let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
                while queue.is_empty() && !state.stop_flag.load(Ordering::Acquire) {
                    queue = state.condvar.wait(queue).unwrap_or_else(|e| e.into_inner());
                }
                if state.stop_flag.load(Ordering::Acquire) {
                    break;
                }
                queue.pop_front()
            };

            if let Some(job) = job {
                Self::decode_job(&state, job);

                since_yield += 1;
                if since_yield >= state.batch_yield {
                    since_yield = 0;
                    thread::yield_now();
                }
            }
        }

        debug!("Decode worker {} exiting", worker_id);
    }

    /// Decode one sprite and publish it, dropping stale-generation results.
    ///
    /// A failed decode logs and continues; the key stays permanently
    /// not-ready and the conductor's skip-draw timeout walks past it.
    fn decode_job(state: &SharedPoolState, job: DecodeJob) {
        if !state.engine.generation_is_current(job.generation) {
            debug!("Dropping stale decode for {}", job.key);
            return;
        }
        if state.store.is_ready(&job.key) {
            return;
        }

        let bytes = match job.payload.into_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = Error::Decode(e);
                warn!("Bad payload for {}: {}", job.key, err);
                state.engine.listener.on_error(&err);
                return;
            }
        };

        match DecodedImage::from_encoded(&job.key, &bytes) {
            Ok(image) => {
                if state.engine.generation_is_current(job.generation) {
                    state.store.put(job.key, Arc::new(image));
                }
            }
            Err(e) => {
                let err = Error::Decode(e);
                error!("Sprite decode failed: {}", err);
                state.engine.listener.on_error(&err);
            }
        }
    }

    /// Drop every queued job (force_idle path; the generation bump already
    /// invalidated them)
    pub fn clear(&self) {
        self.state.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Get queue length (diagnostics)
    pub fn queue_len(&self) -> usize {
        self.state.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Signal workers to stop and join them
    pub fn shutdown(&mut self) {
        self.state.stop_flag.store(true, Ordering::Release);
        self.state.condvar.notify_all();

        for (idx, handle) in self.threads.drain(..).enumerate() {
            if handle.join().is_err() {
                error!("Decode worker {} panicked during shutdown", idx);
            }
        }
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullListener;
    use std::time::{Duration, Instant};

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::new(2, 2);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn record(seq: u32, key: &str, payload: ImagePayload) -> FrameRecord {
        FrameRecord {
            chunk_index: 0,
            sequence_index: seq,
            section_index: 0,
            animation_name: "talk".to_string(),
            matched_sprite_frame_number: seq,
            overlay_id: Some(key.to_string()),
            sheet_filename: "sheet.png".to_string(),
            character: None,
            image: payload,
        }
    }

    fn pool() -> (DecodePool, Arc<FrameStore>) {
        let store = Arc::new(FrameStore::new());
        let engine = Arc::new(SharedState::new(16, Arc::new(NullListener)));
        let pool = DecodePool::new(Arc::clone(&store), engine, 2, 15);
        (pool, store)
    }

    fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn first_record_is_ready_synchronously() {
        let (pool, store) = pool();
        let records = vec![
            record(0, "first", ImagePayload::Bytes(png_bytes())),
            record(1, "second", ImagePayload::Bytes(png_bytes())),
        ];

        let intaken = pool.submit_batch(records);
        assert_eq!(intaken, 2);

        // No waiting: the caller path decoded record 0
        assert!(store.is_ready("first"));

        assert!(wait_until(|| store.is_ready("second"), Duration::from_secs(2)));
    }

    #[test]
    fn corrupt_record_stays_not_ready() {
        let (pool, store) = pool();
        let records = vec![
            record(0, "good", ImagePayload::Bytes(png_bytes())),
            record(1, "bad", ImagePayload::Bytes(vec![0u8; 8])),
            record(2, "also-good", ImagePayload::Bytes(png_bytes())),
        ];

        pool.submit_batch(records);
        assert!(wait_until(|| store.is_ready("also-good"), Duration::from_secs(2)));
        assert!(store.is_ready("good"));
        assert!(!store.is_ready("bad"));
    }

    #[test]
    fn duplicate_keys_decode_once() {
        let (pool, store) = pool();
        pool.submit_batch(vec![record(0, "dup", ImagePayload::Bytes(png_bytes()))]);
        assert!(store.is_ready("dup"));

        // Second batch with the same content-addressed key is a no-op intake
        let intaken = pool.submit_batch(vec![record(1, "dup", ImagePayload::Bytes(png_bytes()))]);
        assert_eq!(intaken, 1);
        assert_eq!(store.ready_count(), 1);
    }

    #[test]
    fn base64_payloads_decode() {
        use base64::Engine as _;
        let (pool, store) = pool();
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes());

        pool.submit_batch(vec![record(0, "b64", ImagePayload::Base64(encoded))]);
        assert!(store.is_ready("b64"));
    }

    #[test]
    fn empty_batch_is_harmless() {
        let (pool, _store) = pool();
        assert_eq!(pool.submit_batch(Vec::new()), 0);
        assert_eq!(pool.queue_len(), 0);
    }
}
