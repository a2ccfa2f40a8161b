//! End-to-end engine scenarios: a complete event stream in, rendered frames
//! and audio triggers out.
//!
//! These run against the real decode pool and audio runway with a stub MP3
//! decoder and a discarding audio sink; pacing is wall time, so assertions
//! use deadlines and generous margins rather than exact tick counts.

mod helpers;

use std::time::{Duration, Instant};

use helpers::*;
use mimik_ae::{EngineMode, ImagePayload, InboundEvent, PullResult};

/// Pull until the engine reaches `mode` or the deadline passes, collecting
/// every fresh frame along the way. Waiting for `Idle` only completes after
/// the engine has actually left idle once (playback happened).
fn pull_until_mode(
    engine: &mimik_ae::Engine,
    mode: EngineMode,
    timeout: Duration,
) -> Vec<mimik_ae::RenderFrame> {
    let mut fresh = Vec::new();
    let mut left_idle = false;
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let PullResult::Frame(frame) = engine.pull_render_frame() {
            fresh.push(frame);
        }
        let current = engine.mode();
        if current != EngineMode::Idle {
            left_idle = true;
        }
        if current == mode && (mode != EngineMode::Idle || left_idle) {
            return fresh;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    fresh
}

/// Happy path: one chunk, every image decodes, audio plays once, the engine
/// returns to idle after the last frame.
#[test]
fn one_chunk_plays_through_and_returns_to_idle() {
    let listener = CollectingListener::new();
    let engine = test_engine(listener.clone(), 300);

    feed_chunk(&engine, 0, 9, (100, 200));
    engine.submit_event(InboundEvent::AudioEnd);

    let first_emit = Instant::now();
    let frames = pull_until_mode(&engine, EngineMode::Idle, Duration::from_secs(5));

    assert_eq!(engine.mode(), EngineMode::Idle);
    assert_eq!(listener.all_complete_count(), 1);
    assert!(listener.modes().contains(&EngineMode::Playing));

    // Audio for chunk 0 played exactly once
    let starts = listener.audio_starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].0, 0);
    assert_eq!(starts[0].2, 300);

    // Every overlay frame carries the chunk-level zone and a base frame
    // resolved from the server's matched number
    let overlay_frames: Vec<_> = frames.iter().filter(|f| f.overlay.is_some()).collect();
    assert!(
        overlay_frames.len() >= 5,
        "expected most of the 9 overlay frames, got {}",
        overlay_frames.len()
    );
    for frame in &overlay_frames {
        assert_eq!(frame.overlay.as_ref().unwrap().position, (100, 200));
        assert_eq!(frame.animation_name, "talk");
        assert!(frame.base_frame_index < 10);
    }

    // Audio-video alignment: the trigger lands with the first overlay frame
    let audio_start = starts[0].1;
    assert!(
        audio_start >= first_emit - Duration::from_millis(10),
        "audio must not start before the first overlay frame"
    );
    assert!(
        audio_start <= first_emit + Duration::from_millis(500),
        "audio start lagged the first overlay frame too far"
    );
}

/// Split batches with a late arrival: chunk_ready is deferred, playback is
/// identical to the single-batch case.
#[test]
fn split_batches_with_late_batch_play_identically() {
    let listener = CollectingListener::new();
    let engine = test_engine(listener.clone(), 200);

    engine.submit_event(audio_chunk(0, (10, 10)));
    engine.submit_event(frame_batch(0, 0..4));
    engine.submit_event(InboundEvent::ChunkReady {
        chunk_index: 0,
        total_sent: 12,
    });

    // chunk_ready announced 12 records; only 4 intaken, so nothing queued
    assert_eq!(engine.snapshot().queued_sections, 0);

    engine.submit_event(frame_batch(0, 4..12));
    assert_eq!(engine.snapshot().queued_sections, 1);

    engine.submit_event(InboundEvent::AudioEnd);
    pull_until_mode(&engine, EngineMode::Idle, Duration::from_secs(5));

    assert_eq!(engine.mode(), EngineMode::Idle);
    assert_eq!(listener.audio_starts().len(), 1);
}

/// Gap between chunks: the last frame of chunk 0 holds until chunk 1 becomes
/// buffer-ready, and chunk order is preserved.
#[test]
fn gap_between_chunks_holds_last_frame() {
    let listener = CollectingListener::new();
    let engine = test_engine(listener.clone(), 150);

    feed_chunk(&engine, 0, 5, (0, 0));

    // Chunk 1's audio and frames arrive but chunk_ready is delayed
    engine.submit_event(audio_chunk(1, (0, 0)));
    engine.submit_event(frame_batch(1, 0..5));

    // Play chunk 0 out; without chunk 1 ready the engine must keep showing
    // the last overlay (WaitingNext), never a blank frame
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.mode() != EngineMode::WaitingNext && Instant::now() < deadline {
        let result = engine.pull_render_frame();
        if engine.snapshot().message_active {
            assert!(
                result.frame().is_some(),
                "no blank frames while a message is active"
            );
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.mode(), EngineMode::WaitingNext);
    assert_eq!(engine.snapshot().next_expected_chunk, 1);

    // The held output is still the last overlay of chunk 0
    let held = engine.pull_render_frame();
    assert!(held.frame().unwrap().overlay.is_some());

    // Late chunk_ready releases chunk 1
    engine.submit_event(InboundEvent::ChunkReady {
        chunk_index: 1,
        total_sent: 5,
    });
    engine.submit_event(InboundEvent::AudioEnd);

    pull_until_mode(&engine, EngineMode::Idle, Duration::from_secs(5));
    let starts = listener.audio_starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].0, 0);
    assert_eq!(starts[1].0, 1);
}

/// force_idle_now mid-stream: one pull later the engine is idle with no
/// stale state anywhere.
#[test]
fn force_idle_mid_stream_scrubs_everything() {
    let listener = CollectingListener::new();
    let engine = test_engine(listener.clone(), 400);

    for chunk in 0..3 {
        feed_chunk(&engine, chunk, 6, (0, 0));
    }

    // Let playback begin
    let deadline = Instant::now() + Duration::from_secs(2);
    while listener.audio_starts().is_empty() && Instant::now() < deadline {
        engine.pull_render_frame();
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!listener.audio_starts().is_empty());

    engine.force_idle_now();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.mode, EngineMode::Idle);
    assert_eq!(snapshot.queued_sections, 0);
    assert_eq!(snapshot.decoded_overlays, 0);
    assert_eq!(snapshot.current_section, None);
    assert_eq!(snapshot.next_expected_chunk, 0);

    // The next pull renders the idle animation, not a stale overlay
    let result = engine.pull_render_frame();
    if let Some(frame) = result.frame() {
        assert!(frame.overlay.is_none());
    }

    // A fresh message afterwards starts from chunk 0 and plays
    let starts_before = listener.audio_starts().len();
    feed_chunk(&engine, 0, 4, (5, 5));
    engine.submit_event(InboundEvent::AudioEnd);

    let deadline = Instant::now() + Duration::from_secs(5);
    while listener.audio_starts().len() == starts_before && Instant::now() < deadline {
        engine.pull_render_frame();
        std::thread::sleep(Duration::from_millis(10));
    }
    let starts = listener.audio_starts();
    assert!(starts.len() > starts_before);
    assert_eq!(starts.last().map(|s| s.0), Some(0));
}

/// A permanently corrupt frame is dropped after exactly the configured
/// number of consecutive skip-draws; the rest of the section plays.
#[test]
fn stuck_frame_is_dropped_after_skip_draw_ceiling() {
    let listener = CollectingListener::new();
    let engine = test_engine(listener.clone(), 0);
    let mut events = engine.subscribe();

    // No audio for this chunk: wall-clock pacing. Frame 5 of 12 is corrupt.
    let frames: Vec<_> = (0..12)
        .map(|seq| {
            let payload = if seq == 5 {
                ImagePayload::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF])
            } else {
                ImagePayload::Bytes(png_bytes())
            };
            record(0, seq, payload)
        })
        .collect();
    engine.submit_event(InboundEvent::FrameBatch {
        chunk_index: 0,
        frames,
    });
    engine.submit_event(InboundEvent::ChunkReady {
        chunk_index: 0,
        total_sent: 12,
    });
    engine.submit_event(InboundEvent::AudioEnd);

    // Wait until the 11 decodable overlays are in and the section started,
    // so neither idle-throttle holds nor decode races pollute the skip-draw
    // measurement below
    let deadline = Instant::now() + Duration::from_secs(2);
    while (engine.snapshot().decoded_overlays < 11 || engine.snapshot().current_section.is_none())
        && Instant::now() < deadline
    {
        engine.pull_render_frame();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(engine.snapshot().decoded_overlays, 11);
    assert!(engine.snapshot().current_section.is_some());

    // Pull slower than the frame interval so every pull is a full tick
    let mut emitted = Vec::new();
    let mut holds_since_last_fresh = 0u32;
    let mut holds_before_frame_6 = None;
    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.mode() != EngineMode::Idle && Instant::now() < deadline {
        match engine.pull_render_frame() {
            PullResult::Frame(frame) => {
                if frame.overlay.is_some() {
                    if frame.base_frame_index == 6 && holds_before_frame_6.is_none() {
                        holds_before_frame_6 = Some(holds_since_last_fresh);
                    }
                    emitted.push(frame.base_frame_index);
                }
                holds_since_last_fresh = 0;
            }
            PullResult::Held(_) => holds_since_last_fresh += 1,
            PullResult::Empty => {}
        }
        std::thread::sleep(Duration::from_millis(36));
    }

    assert_eq!(engine.mode(), EngineMode::Idle);

    // Frame 5 never appeared; its neighbours and the tail of the section
    // did (the base index is the matched number mod the 10-frame base, so
    // overlay frames 10 and 11 land on base indices 0 and 1 again)
    assert!(emitted.contains(&4));
    assert!(emitted.contains(&6));
    assert!(emitted.contains(&9));
    assert!(!emitted.contains(&5));

    // Exactly 15 pulls were consumed by the stuck frame: 14 holds, then the
    // drop-and-advance pull emits frame 6
    assert_eq!(holds_before_frame_6, Some(14));

    // The decode failure surfaced to the listener and the drop to the bus
    assert!(!listener.errors().is_empty());
    let saw_timeout = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, mimik_ae::EngineEvent::SkipDrawTimeout { frame_index: 5, .. }));
    assert!(saw_timeout);
}

/// Sections split when the animation changes mid-chunk; both play in order.
#[test]
fn animation_change_splits_sections() {
    let listener = CollectingListener::new();
    let engine = test_engine(listener.clone(), 0);
    engine.register_base_animation("smile", base_frames(4), 1);

    let mut frames = Vec::new();
    for seq in 0..4 {
        frames.push(record(0, seq, ImagePayload::Bytes(png_bytes())));
    }
    for seq in 4..8 {
        let mut r = record(0, seq, ImagePayload::Bytes(png_bytes()));
        r.animation_name = "smile".to_string();
        frames.push(r);
    }

    engine.submit_event(audio_chunk(0, (0, 0)));
    engine.submit_event(InboundEvent::FrameBatch {
        chunk_index: 0,
        frames,
    });
    engine.submit_event(InboundEvent::ChunkReady {
        chunk_index: 0,
        total_sent: 8,
    });
    assert_eq!(engine.snapshot().queued_sections, 2);

    engine.submit_event(InboundEvent::AudioEnd);
    let frames = pull_until_mode(&engine, EngineMode::Idle, Duration::from_secs(10));

    let animations: Vec<_> = frames
        .iter()
        .filter(|f| f.overlay.is_some())
        .map(|f| f.animation_name.clone())
        .collect();
    assert!(animations.contains(&"talk".to_string()));
    assert!(animations.contains(&"smile".to_string()));
    // talk strictly precedes smile
    let first_smile = animations.iter().position(|a| a == "smile").unwrap();
    assert!(animations[..first_smile].iter().all(|a| a == "talk"));
}
