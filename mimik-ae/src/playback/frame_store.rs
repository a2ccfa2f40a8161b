//! Frame store
//!
//! Content-addressed cache of decoded overlay images plus the decode-state
//! set. The set membership is the authoritative "is this usable" predicate:
//! writers publish the image mapping first and only then insert the key, so a
//! reader that observes a ready key is guaranteed to find the image.
//!
//! Many writers (decode workers), one reader (the conductor). No eviction
//! during an active message; the content-addressed scheme deduplicates and
//! the footprint is bounded by the message.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::playback::types::DecodedImage;

pub struct FrameStore {
    images: RwLock<HashMap<String, Arc<DecodedImage>>>,
    decoded_keys: RwLock<HashSet<String>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            images: RwLock::new(HashMap::new()),
            decoded_keys: RwLock::new(HashSet::new()),
        }
    }

    /// Publish a decoded image.
    ///
    /// Insert order matters: mapping before readiness, so `is_ready(k)` true
    /// implies `get(k)` is `Some`.
    pub fn put(&self, key: impl Into<String>, image: Arc<DecodedImage>) {
        let key = key.into();
        self.images
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), image);
        self.decoded_keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
    }

    pub fn get(&self, key: &str) -> Option<Arc<DecodedImage>> {
        self.images
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// True iff the key has fully decoded. Stable-true until `clear_all`.
    pub fn is_ready(&self, key: &str) -> bool {
        self.decoded_keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// True iff `keys[0..n)` are all ready. Short-circuits on the first gap;
    /// readiness beyond a gap does not count.
    pub fn first_n_ready<'a>(&self, keys: impl IntoIterator<Item = &'a str>, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        let decoded = self.decoded_keys.read().unwrap_or_else(|e| e.into_inner());
        let mut seen = 0;
        for key in keys.into_iter().take(n) {
            if !decoded.contains(key) {
                return false;
            }
            seen += 1;
        }
        seen == n
    }

    /// Drop both the mapping and the readiness set.
    ///
    /// Readiness is cleared first so no reader can observe a ready key whose
    /// image is already gone.
    pub fn clear_all(&self) {
        self.decoded_keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.images
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of decoded keys (diagnostics)
    pub fn ready_count(&self) -> usize {
        self.decoded_keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}
