//! Duplicate suppression: message id -> first-seen time, evicted by age.

use std::collections::HashMap;

/// Remembers which message ids have been sent or received recently.
/// Eviction is lossy: an id replayed after its entry is evicted counts as new.
#[derive(Debug, Default)]
pub struct DuplicateCache {
    seen: HashMap<String, u64>,
}

impl DuplicateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `id` is presented (and records it at `now`), false after.
    pub fn should_process(&mut self, id: &str, now: u64) -> bool {
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Drop entries first seen strictly before `cutoff`. Returns how many were removed.
    pub fn evict_older_than(&mut self, cutoff: u64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, &mut first_seen| first_seen >= cutoff);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
