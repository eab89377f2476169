//! Content-address result cache.
//!
//! Keys are derived from a bounded pixel sample of the image plus the
//! serialized request options. Eviction is opportunistic: the queue worker
//! sweeps stale entries after an insert once the cache grows past a soft cap.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use image::RgbaImage;

use crate::types::{DetectionOptions, DetectionResult};

/// Width and height cap of the sampled region.
pub const SAMPLE_SIZE: u32 = 100;

/// Entry count above which an insert triggers a sweep.
pub const CACHE_SOFT_CAP: usize = 100;

/// Maximum age of an entry once a sweep runs.
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Rolling 32-bit checksum over the top-left sample region.
///
/// Only the red, green and blue channels contribute; alpha is ignored.
pub fn sample_checksum(image: &RgbaImage) -> u32 {
    let width = image.width().min(SAMPLE_SIZE);
    let height = image.height().min(SAMPLE_SIZE);

    let mut hash: u32 = 0;
    for y in 0..height {
        for x in 0..width {
            let [r, g, b, _] = image.get_pixel(x, y).0;
            let sum = r as u32 + g as u32 + b as u32;
            hash = (hash << 5).wrapping_sub(hash).wrapping_add(sum);
        }
    }
    hash
}

/// Builds the cache key for an image and its request options.
pub fn fingerprint(image: &RgbaImage, options: &DetectionOptions) -> String {
    // Serializing a plain struct of bools and a float cannot fail.
    let options_json = serde_json::to_string(options).unwrap_or_default();
    format!("{:08x}_{}", sample_checksum(image), options_json)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: DetectionResult,
    inserted_at: Instant,
}

/// Fingerprint to result map.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: HashMap<String, CacheEntry>,
}

impl ResultCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the cached result for `key`.
    pub fn lookup(&self, key: &str) -> Option<DetectionResult> {
        self.entries.get(key).map(|entry| entry.result.clone())
    }

    /// Stores `result`, replacing any previous entry for `key`.
    pub fn insert(&mut self, key: String, result: DetectionResult) {
        self.insert_at(key, result, Instant::now());
    }

    fn insert_at(&mut self, key: String, result: DetectionResult, inserted_at: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                result,
                inserted_at,
            },
        );
    }

    /// Removes entries older than `max_age`. Returns the number removed.
    pub fn evict_expired(&mut self, max_age: Duration) -> usize {
        self.evict_expired_at(Instant::now(), max_age)
    }

    fn evict_expired_at(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) <= max_age);
        before - self.entries.len()
    }

    /// Runs the post-insert sweep when the cache is over its soft cap.
    pub fn sweep_if_full(&mut self) -> usize {
        self.sweep_if_full_at(Instant::now())
    }

    fn sweep_if_full_at(&mut self, now: Instant) -> usize {
        if self.entries.len() > CACHE_SOFT_CAP {
            let removed = self.evict_expired_at(now, CACHE_MAX_AGE);
            if removed > 0 {
                tracing::info!(removed, remaining = self.entries.len(), "Evicted stale cache entries");
            }
            removed
        } else {
            0
        }
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
