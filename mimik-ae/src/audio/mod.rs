//! Audio subsystem: MP3 pre-decode, playback thread, and output sinks

pub mod decoder;
pub mod runway;
pub mod sink;
pub mod types;

pub use decoder::{AudioDecoder, SymphoniaDecoder};
pub use runway::AudioRunway;
pub use sink::{AudioSink, CpalSink, NullSink};
pub use types::PcmChunk;
