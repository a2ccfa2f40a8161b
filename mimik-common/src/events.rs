//! Event types for the Mimik engine
//!
//! Provides the shared `EngineEvent` definitions and the broadcast `EventBus`
//! the engine emits diagnostics on. Events are serializable so an embedding
//! shell can forward them over whatever channel it exposes to its UI.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Engine playback mode
///
/// The conductor's top-level state machine. `WaitingNext` is entered when the
/// current section finished but the message is still open (more chunks may
/// arrive before `audio_end`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Idle,
    Playing,
    WaitingNext,
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineMode::Idle => write!(f, "idle"),
            EngineMode::Playing => write!(f, "playing"),
            EngineMode::WaitingNext => write!(f, "waiting_next"),
        }
    }
}

/// Engine event types
///
/// Broadcast via `EventBus`; all variants carry a UTC timestamp so a shell
/// can order events from multiple subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Conductor mode changed
    ModeChanged {
        old_mode: EngineMode,
        new_mode: EngineMode,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An overlay section graduated from the queue and began playing
    SectionStarted {
        chunk_index: u32,
        section_index: u32,
        frame_count: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// All sections of a chunk finished playing
    ChunkPlaybackComplete {
        chunk_index: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Every chunk of the message played and `audio_end` was observed
    AllChunksComplete {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A frame was dropped after the skip-draw ceiling was reached
    SkipDrawTimeout {
        chunk_index: u32,
        section_index: u32,
        frame_index: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An inbound event violated the stream protocol and was dropped
    ProtocolViolation {
        detail: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The engine was forced back to a clean idle state
    EngineReset {
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl EngineEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            EngineEvent::ModeChanged { .. } => "ModeChanged",
            EngineEvent::SectionStarted { .. } => "SectionStarted",
            EngineEvent::ChunkPlaybackComplete { .. } => "ChunkPlaybackComplete",
            EngineEvent::AllChunksComplete { .. } => "AllChunksComplete",
            EngineEvent::SkipDrawTimeout { .. } => "SkipDrawTimeout",
            EngineEvent::ProtocolViolation { .. } => "ProtocolViolation",
            EngineEvent::EngineReset { .. } => "EngineReset",
        }
    }
}

/// One-to-many event broadcasting for engine diagnostics
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` when at least one subscriber exists.
    pub fn emit(&self, event: EngineEvent) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    ///
    /// Diagnostics are best-effort; a shell that has not subscribed loses
    /// nothing it asked for.
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Channel capacity this bus was created with
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventbus_new() {
        let bus = EventBus::new(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn eventbus_subscribe() {
        let bus = EventBus::new(100);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn eventbus_emit_with_subscriber() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();

        let event = EngineEvent::ModeChanged {
            old_mode: EngineMode::Idle,
            new_mode: EngineMode::Playing,
            timestamp: chrono::Utc::now(),
        };
        assert!(bus.emit(event).is_ok());

        let received = rx.recv().await.unwrap();
        match received {
            EngineEvent::ModeChanged { old_mode, new_mode, .. } => {
                assert_eq!(old_mode, EngineMode::Idle);
                assert_eq!(new_mode, EngineMode::Playing);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[test]
    fn eventbus_emit_lossy_without_subscribers() {
        let bus = EventBus::new(100);
        bus.emit_lossy(EngineEvent::EngineReset {
            timestamp: chrono::Utc::now(),
        });
    }

    #[test]
    fn engine_event_serializes_with_type_tag() {
        let event = EngineEvent::ChunkPlaybackComplete {
            chunk_index: 3,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ChunkPlaybackComplete\""));
        assert!(json.contains("\"chunk_index\":3"));
    }

    #[test]
    fn mode_display() {
        assert_eq!(EngineMode::Idle.to_string(), "idle");
        assert_eq!(EngineMode::WaitingNext.to_string(), "waiting_next");
    }
}
