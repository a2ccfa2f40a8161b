//! Shared engine state
//!
//! Thread-safe state shared between the demux (transport thread), the decode
//! workers, and the conductor (render thread). Uses `std::sync` primitives
//! because the render pull path is synchronous and must never await.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::events::EngineListener;
use mimik_common::{EngineEvent, EngineMode, EventBus};

/// State accessible by all engine components
pub struct SharedState {
    /// Conductor mode; written by the conductor, read everywhere
    mode: RwLock<EngineMode>,

    /// True from the first event of a message until force_idle/reset
    message_active: AtomicBool,

    /// True once `audio_end` has been observed for the current message
    audio_end_received: AtomicBool,

    /// Message generation; bumped by force_idle_now. Decode workers stamp
    /// their work with the generation current at submit time and drop
    /// results from stale generations before publishing.
    generation: AtomicU64,

    /// Diagnostics broadcast for the embedding shell
    pub bus: EventBus,

    /// Observer capability registered at construction
    pub listener: Arc<dyn EngineListener>,
}

impl SharedState {
    pub fn new(bus_capacity: usize, listener: Arc<dyn EngineListener>) -> Self {
        Self {
            mode: RwLock::new(EngineMode::Idle),
            message_active: AtomicBool::new(false),
            audio_end_received: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            bus: EventBus::new(bus_capacity),
            listener,
        }
    }

    /// Current conductor mode
    pub fn mode(&self) -> EngineMode {
        *self.mode.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Transition the mode, notifying the bus and listener on change
    pub fn set_mode(&self, new_mode: EngineMode) {
        let old_mode = {
            let mut guard = self.mode.write().unwrap_or_else(|e| e.into_inner());
            let old = *guard;
            *guard = new_mode;
            old
        };

        if old_mode != new_mode {
            tracing::debug!("Engine mode {} -> {}", old_mode, new_mode);
            self.bus.emit_lossy(EngineEvent::ModeChanged {
                old_mode,
                new_mode,
                timestamp: chrono::Utc::now(),
            });
            self.listener.on_mode(new_mode);
        }
    }

    pub fn message_active(&self) -> bool {
        self.message_active.load(Ordering::Acquire)
    }

    pub fn set_message_active(&self, active: bool) {
        self.message_active.store(active, Ordering::Release);
    }

    pub fn audio_end_received(&self) -> bool {
        self.audio_end_received.load(Ordering::Acquire)
    }

    pub fn set_audio_end_received(&self, received: bool) {
        self.audio_end_received.store(received, Ordering::Release);
    }

    /// Generation current right now
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate all in-flight decode work; returns the new generation
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True when `generation` is still the live one
    pub fn generation_is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullListener;

    fn state() -> SharedState {
        SharedState::new(16, Arc::new(NullListener))
    }

    #[test]
    fn mode_transitions_emit_events() {
        let state = state();
        let mut rx = state.bus.subscribe();

        assert_eq!(state.mode(), EngineMode::Idle);
        state.set_mode(EngineMode::Playing);
        assert_eq!(state.mode(), EngineMode::Playing);

        match rx.try_recv().unwrap() {
            EngineEvent::ModeChanged { old_mode, new_mode, .. } => {
                assert_eq!(old_mode, EngineMode::Idle);
                assert_eq!(new_mode, EngineMode::Playing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn same_mode_does_not_reemit() {
        let state = state();
        let mut rx = state.bus.subscribe();

        state.set_mode(EngineMode::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn generation_invalidates_prior_work() {
        let state = state();
        let stamped = state.generation();
        assert!(state.generation_is_current(stamped));

        state.bump_generation();
        assert!(!state.generation_is_current(stamped));
        assert!(state.generation_is_current(stamped + 1));
    }

    #[test]
    fn message_flags() {
        let state = state();
        assert!(!state.message_active());
        assert!(!state.audio_end_received());

        state.set_message_active(true);
        state.set_audio_end_received(true);
        assert!(state.message_active());
        assert!(state.audio_end_received());
    }
}
