//! Per-node health marker.
//!
//! A marker records consecutive dial failures and the time of the most
//! recent one. It is shared by every session targeting the node; both
//! fields sit behind one lock so readers never see a count without its
//! timestamp. Only dial outcomes touch it: `mark()` after a failed dial,
//! `reset()` after a successful one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Health state derived from a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No failure recorded since the last reset.
    Alive,
    /// At least one failure recorded since the last reset.
    Dead,
}

/// A consistent view of a marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerState {
    /// Consecutive failures since the last reset.
    pub count: u32,
    /// Milliseconds since the unix epoch; zero when never marked.
    pub marked_at_ms: u64,
}

impl MarkerState {
    /// Time elapsed between the most recent failure and `now_ms`.
    pub fn since_marked(&self, now_ms: u64) -> Option<Duration> {
        match self.marked_at_ms {
            0 => None,
            at => Some(Duration::from_millis(now_ms.saturating_sub(at))),
        }
    }
}

/// Failure counter with last-failure timestamp.
#[derive(Debug, Default)]
pub struct Marker {
    state: Mutex<MarkerState>,
}

impl Marker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed dial.
    pub fn mark(&self) {
        let now = now_ms();
        let mut state = self.state.lock();
        state.count = state.count.saturating_add(1);
        state.marked_at_ms = now;
    }

    /// Record a successful dial, clearing all failure state.
    pub fn reset(&self) {
        *self.state.lock() = MarkerState::default();
    }

    pub fn snapshot(&self) -> MarkerState {
        *self.state.lock()
    }

    /// Consecutive failures since the last reset.
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Time of the most recent failure as milliseconds since the unix epoch.
    pub fn marked_at_ms(&self) -> Option<u64> {
        match self.state.lock().marked_at_ms {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Time elapsed between the most recent failure and `now_ms`.
    pub fn since_marked(&self, now_ms: u64) -> Option<Duration> {
        self.snapshot().since_marked(now_ms)
    }

    pub fn health(&self) -> Health {
        if self.count() == 0 {
            Health::Alive
        } else {
            Health::Dead
        }
    }
}

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mark_and_reset() {
        let marker = Marker::new();
        assert_eq!(marker.health(), Health::Alive);
        assert!(marker.marked_at_ms().is_none());

        marker.mark();
        marker.mark();
        assert_eq!(marker.health(), Health::Dead);
        assert_eq!(marker.count(), 2);
        assert!(marker.marked_at_ms().is_some());

        marker.reset();
        assert_eq!(marker.health(), Health::Alive);
        assert_eq!(marker.count(), 0);
        assert!(marker.marked_at_ms().is_none());
    }

    #[test]
    fn test_since_marked() {
        let marker = Marker::new();
        assert!(marker.since_marked(now_ms()).is_none());

        marker.mark();
        let at = marker.marked_at_ms().unwrap();
        assert_eq!(
            marker.since_marked(at + 1500),
            Some(Duration::from_millis(1500))
        );
        // Clock skew never underflows.
        assert_eq!(marker.since_marked(at - 1), Some(Duration::ZERO));
    }

    #[test]
    fn test_concurrent_marks() {
        let marker = Arc::new(Marker::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let marker = Arc::clone(&marker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        marker.mark();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(marker.count(), 800);
    }

    #[test]
    fn test_snapshot_consistent_under_reset() {
        let marker = Arc::new(Marker::new());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let marker = Arc::clone(&marker);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if i % 2 == 0 {
                            marker.mark();
                        } else {
                            marker.reset();
                        }
                    }
                })
            })
            .collect();

        for _ in 0..2000 {
            let state = marker.snapshot();
            assert_eq!(state.count == 0, state.marked_at_ms == 0, "{:?}", state);
        }
        for writer in writers {
            writer.join().unwrap();
        }
        let state = marker.snapshot();
        assert_eq!(state.count == 0, state.marked_at_ms == 0);
    }
}
