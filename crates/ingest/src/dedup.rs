use crate::clock::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_THRESHOLD: usize = 500;

/// Recently seen provider message ids.
///
/// Advisory only: a restart forgets everything, and the message table's
/// primary key catches whatever slips through.
pub struct DedupCache {
    seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
    sweep_threshold: usize,
    clock: Arc<dyn Clock>,
}

impl DedupCache {
    pub fn new(window: Duration, sweep_threshold: usize) -> Self {
        Self::with_clock(window, sweep_threshold, Arc::new(SystemClock))
    }

    pub fn with_clock(window: Duration, sweep_threshold: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
            sweep_threshold,
            clock,
        }
    }

    /// `true` the first time `id` shows up inside the window, `false` after.
    pub fn admit(&self, id: &str) -> bool {
        let now = self.clock.now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(first_seen) = seen.get(id) {
            if now.saturating_duration_since(*first_seen) <= self.window {
                return false;
            }
        }

        seen.insert(id.to_string(), now);

        // Sweep only under pressure; no background timer.
        if seen.len() > self.sweep_threshold {
            let before = seen.len();
            let window = self.window;
            seen.retain(|_, first_seen| now.saturating_duration_since(*first_seen) <= window);
            debug!(before, after = seen.len(), "dedup cache swept");
        }

        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_SWEEP_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache_with_clock(threshold: usize) -> (DedupCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = DedupCache::with_clock(DEFAULT_WINDOW, threshold, clock.clone());
        (cache, clock)
    }

    #[test]
    fn second_sighting_inside_window_is_rejected() {
        let (cache, clock) = cache_with_clock(DEFAULT_SWEEP_THRESHOLD);
        assert!(cache.admit("wamid.1"));
        clock.advance(Duration::from_secs(29));
        assert!(!cache.admit("wamid.1"));
        assert!(cache.admit("wamid.2"));
    }

    #[test]
    fn window_is_measured_from_first_sighting() {
        let (cache, clock) = cache_with_clock(DEFAULT_SWEEP_THRESHOLD);
        assert!(cache.admit("wamid.1"));
        clock.advance(Duration::from_secs(20));
        assert!(!cache.admit("wamid.1"));
        clock.advance(Duration::from_secs(11));
        assert!(cache.admit("wamid.1"));
    }

    #[test]
    fn sweep_runs_only_past_threshold() {
        let (cache, clock) = cache_with_clock(3);
        for id in ["a", "b", "c"] {
            assert!(cache.admit(id));
        }
        clock.advance(Duration::from_secs(31));
        // At the threshold nothing is evicted yet.
        assert_eq!(cache.len(), 3);

        assert!(cache.admit("d"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_keeps_entries_still_inside_window() {
        let (cache, clock) = cache_with_clock(2);
        assert!(cache.admit("old"));
        clock.advance(Duration::from_secs(31));
        assert!(cache.admit("fresh"));
        assert!(cache.admit("newest"));

        assert_eq!(cache.len(), 2);
        assert!(!cache.admit("fresh"));
    }
}
