//! Duplicate suppression for inbound packet ids.
//!
//! Each connection remembers the ids it has recently handled. A resent packet whose
//! ack was lost is recognised and dropped instead of reaching the application twice.
//!
//! The window is bounded: once full, the oldest id is evicted. Entries also expire after
//! a TTL. Ids are `u16` and wrap, so an entry more than [`MAX_ID_DISTANCE`] behind the
//! newest id seen no longer counts: an id that far back is a new packet after the wrap.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// How far behind the newest id an entry still identifies a duplicate.
pub const MAX_ID_DISTANCE: u16 = 16 * 1024;

/// Bounded FIFO set of recently handled packet ids.
#[derive(Debug)]
pub struct ReplayWindow {
    /// id -> time it was handled
    entries: HashMap<u16, Instant>,
    /// Insertion order for O(1) eviction of the oldest entry
    insertion_order: VecDeque<u16>,
    ttl: Duration,
    max_entries: usize,
    newest: Option<u16>,
}

impl ReplayWindow {
    /// Window with default settings: 1024 ids, 30 second TTL.
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(30), 1024)
    }

    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_entries.min(4096)),
            insertion_order: VecDeque::with_capacity(max_entries.min(4096)),
            ttl,
            max_entries: max_entries.max(1),
            newest: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records `id` as handled.
    ///
    /// Returns `true` if it was already in the window (a duplicate), `false` if new.
    #[instrument(level = "trace", skip(self))]
    pub fn check_and_insert(&mut self, id: u16, now: Instant) -> bool {
        self.cleanup_expired(now);

        let behind = self.newest.map(|newest| newest.wrapping_sub(id));
        if self.entries.contains_key(&id) {
            if matches!(behind, Some(distance) if distance <= MAX_ID_DISTANCE) {
                debug!(id, "Duplicate packet id");
                return true;
            }
            // same id, previous lap
            self.entries.remove(&id);
            self.insertion_order.retain(|&entry| entry != id);
        }

        // ahead of the newest id by less than half the id space
        if behind.map_or(true, |distance| distance > u16::MAX / 2) {
            self.newest = Some(id);
        }

        while self.entries.len() >= self.max_entries {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.entries.insert(id, now);
        self.insertion_order.push_back(id);
        false
    }

    /// Whether `id` is in the window, without recording it.
    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    fn cleanup_expired(&mut self, now: Instant) {
        // insertion order is also time order, so expired ids sit at the front
        while let Some(&oldest) = self.insertion_order.front() {
            match self.entries.get(&oldest) {
                Some(&added) if now.saturating_duration_since(added) < self.ttl => break,
                _ => {
                    self.insertion_order.pop_front();
                    self.entries.remove(&oldest);
                }
            }
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detected() {
        let mut window = ReplayWindow::new();
        let now = Instant::now();
        assert!(!window.check_and_insert(5, now));
        assert!(window.check_and_insert(5, now));
        assert!(!window.check_and_insert(6, now));
    }

    #[test]
    fn test_oldest_evicted_when_full() {
        let mut window = ReplayWindow::with_settings(Duration::from_secs(60), 3);
        let now = Instant::now();
        for id in 0..4 {
            assert!(!window.check_and_insert(id, now));
        }
        assert_eq!(window.len(), 3);
        assert!(!window.contains(0));
        assert!(window.contains(3));
    }

    #[test]
    fn test_entries_expire() {
        let mut window = ReplayWindow::with_settings(Duration::from_millis(100), 16);
        let start = Instant::now();
        window.check_and_insert(1, start);
        assert!(!window.check_and_insert(1, start + Duration::from_millis(150)));
    }

    #[test]
    fn test_sparse_ids_through_full_wrap_not_duplicates() {
        let mut window = ReplayWindow::with_settings(Duration::from_secs(60), 1024);
        let now = Instant::now();
        assert!(!window.check_and_insert(100, now));

        // every 10_000th id, as seen by one peer among many
        let mut id = 100u16;
        for _ in 0..9 {
            id = id.wrapping_add(10_000);
            assert!(!window.check_and_insert(id, now));
        }
        assert_eq!(id, 24_564);

        // the counter came round again: 100 is a new packet now
        assert!(!window.check_and_insert(100, now));
        // recent ids are still caught
        assert!(window.check_and_insert(24_564, now));
        assert!(window.check_and_insert(14_564, now));
    }

    #[test]
    fn test_late_duplicate_within_distance_caught() {
        let mut window = ReplayWindow::new();
        let now = Instant::now();
        assert!(!window.check_and_insert(65_530, now));
        assert!(!window.check_and_insert(10, now));
        // the older id does not move the newest mark back
        assert!(window.check_and_insert(65_530, now));
        assert!(window.check_and_insert(10, now));
    }

    #[test]
    fn test_wraparound_ids() {
        let mut window = ReplayWindow::with_settings(Duration::from_secs(60), 8);
        let now = Instant::now();
        assert!(!window.check_and_insert(u16::MAX, now));
        assert!(!window.check_and_insert(0, now));
        assert!(window.check_and_insert(u16::MAX, now));
    }
}
