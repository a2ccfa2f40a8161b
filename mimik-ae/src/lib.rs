//! # Mimik Animation Engine (mimik-ae)
//!
//! Core runtime for a streaming avatar: consumes a server-pushed stream of
//! audio chunks and overlay image batches, and drives a 30 Hz display surface
//! that composites a looping base animation with per-frame mouth/face overlay
//! sprites time-locked to the audio.
//!
//! **Architecture:** event demux → { image decode pool ; audio pre-decode ;
//! section scheduler } → conductor pull loop → render sink + audio sink.
//!
//! The transport, GPU surface, and application shell are external; the engine
//! is driven through [`Engine::submit_event`] and [`Engine::pull_render_frame`].

pub mod audio;
pub mod error;
pub mod events;
pub mod playback;
pub mod state;

pub use error::{Error, Result};
pub use events::{EngineListener, FrameRecord, ImagePayload, InboundEvent};
pub use mimik_common::{EngineConfig, EngineEvent, EngineMode, EventBus};
pub use playback::engine::{Engine, EngineSnapshot};
pub use playback::types::{
    BaseAnimation, DecodedImage, OverlayFrame, OverlaySection, PullResult, RenderFrame,
    RenderOverlay, RenderSink,
};
