//! Playback subsystem: demux, frame store, decode pool, scheduler, conductor,
//! and the engine facade that wires them together

pub mod conductor;
pub mod decode_pool;
pub mod demux;
pub mod engine;
pub mod frame_store;
pub mod scheduler;
pub mod types;

pub use conductor::Conductor;
pub use decode_pool::DecodePool;
pub use demux::EventDemux;
pub use engine::{Engine, EngineSnapshot};
pub use frame_store::FrameStore;
pub use scheduler::SectionScheduler;
