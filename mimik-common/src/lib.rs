//! # Mimik Common Library
//!
//! Shared code for the Mimik avatar animation engine:
//! - Engine event types (`EngineEvent` enum) and the broadcast `EventBus`
//! - Engine configuration loading (`EngineConfig`)
//! - Shared error type

pub mod config;
pub mod error;
pub mod events;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{EngineEvent, EngineMode, EventBus};
