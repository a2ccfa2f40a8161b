//! Engine configuration loading
//!
//! Tunables for the animation engine, resolved in priority order:
//! 1. Explicit path handed in by the embedding shell (highest priority)
//! 2. `MIMIK_CONFIG` environment variable
//! 3. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Environment variable naming the config file path
pub const CONFIG_ENV_VAR: &str = "MIMIK_CONFIG";

/// Minimum and maximum permitted values for `buffer_min`
pub const BUFFER_MIN_RANGE: (u32, u32) = (2, 30);

/// Engine tunables with compiled defaults
///
/// All fields are optional in the TOML file; missing fields fall back to the
/// defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Render pull rate driven by the display surface (Hz)
    pub target_fps: u32,

    /// Idle-animation advance rate (Hz); the engine throttles internally
    pub idle_fps: u32,

    /// Minimum consecutive decoded overlay frames before a section may start
    pub buffer_min: u32,

    /// Consecutive skip-draws on one frame before it is dropped
    pub max_consecutive_skip_draws: u32,

    /// Parallel image-decode workers
    pub decode_workers: usize,

    /// A decode worker yields to the OS scheduler every N records
    pub decode_batch_yield: usize,

    /// Ceiling on waiting for audio pre-decode when playback is triggered (ms)
    pub pre_decode_poll_timeout_ms: u64,

    /// Name of the base animation looped while no message is playing
    pub idle_animation: String,

    /// Broadcast channel capacity for engine events
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            idle_fps: 10,
            buffer_min: 2,
            max_consecutive_skip_draws: 15,
            decode_workers: 4,
            decode_batch_yield: 15,
            pre_decode_poll_timeout_ms: 10_000,
            idle_animation: "idle".to_string(),
            event_bus_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Resolve configuration following the priority order in the module docs.
    ///
    /// A missing file at the explicit path is an error; a missing file at the
    /// env-var path falls through to defaults with a warning.
    pub fn resolve(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            if path.exists() {
                return Self::load(path);
            }
            tracing::warn!(
                "{} points at {} which does not exist; using defaults",
                CONFIG_ENV_VAR,
                env_path
            );
        }

        Ok(Self::default())
    }

    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validated()
    }

    /// Validate field ranges, clamping where a clamp is the documented policy
    pub fn validated(mut self) -> Result<Self> {
        if self.target_fps == 0 {
            return Err(Error::Config("target_fps must be greater than zero".to_string()));
        }
        if self.idle_fps == 0 || self.idle_fps > self.target_fps {
            return Err(Error::Config(format!(
                "idle_fps ({}) must be in 1..={}",
                self.idle_fps, self.target_fps
            )));
        }
        if self.decode_workers == 0 {
            return Err(Error::Config("decode_workers must be greater than zero".to_string()));
        }
        if self.decode_batch_yield == 0 {
            return Err(Error::Config("decode_batch_yield must be greater than zero".to_string()));
        }
        if self.max_consecutive_skip_draws == 0 {
            return Err(Error::Config(
                "max_consecutive_skip_draws must be greater than zero".to_string(),
            ));
        }

        let (lo, hi) = BUFFER_MIN_RANGE;
        if self.buffer_min < lo || self.buffer_min > hi {
            let clamped = self.buffer_min.clamp(lo, hi);
            tracing::warn!(
                "buffer_min {} outside [{}, {}]; clamping to {}",
                self.buffer_min,
                lo,
                hi,
                clamped
            );
            self.buffer_min = clamped;
        }

        Ok(self)
    }

    /// Render tick interval in milliseconds
    pub fn frame_interval_ms(&self) -> u64 {
        1000 / self.target_fps as u64
    }

    /// Idle-animation advance interval in milliseconds
    pub fn idle_interval_ms(&self) -> u64 {
        1000 / self.idle_fps as u64
    }
}
