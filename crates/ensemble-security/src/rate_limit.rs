use ensemble_core::WorkerId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Sliding-window spawn counter, keyed by the requesting parent.
///
/// Root requests (no parent) share a single window. Not synchronized on its
/// own; the owning [`SafetyManager`](crate::SafetyManager) serializes access.
#[derive(Debug)]
pub struct SpawnRateLimiter {
    window: Duration,
    max_per_window: u32,
    windows: HashMap<Option<WorkerId>, VecDeque<Instant>>,
}

impl SpawnRateLimiter {
    /// - `window`: length of the sliding window
    /// - `max_per_window`: spawns a single parent may perform inside one window
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            window,
            max_per_window,
            windows: HashMap::new(),
        }
    }

    /// Whether `parent` may spawn once more at `now`. Does not record anything.
    pub fn would_allow(&mut self, parent: Option<WorkerId>, now: Instant) -> bool {
        self.recent(parent, now) < self.max_per_window as usize
    }

    /// Record a spawn performed by `parent` at `now`.
    pub fn record(&mut self, parent: Option<WorkerId>, now: Instant) {
        self.windows.entry(parent).or_default().push_back(now);
    }

    /// Number of spawns by `parent` still inside the window at `now`.
    pub fn recent(&mut self, parent: Option<WorkerId>, now: Instant) -> usize {
        let window = self.window;
        match self.windows.get_mut(&parent) {
            Some(stamps) => {
                while let Some(front) = stamps.front() {
                    if now.duration_since(*front) >= window {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }
                stamps.len()
            }
            None => 0,
        }
    }

    /// Drop windows that have been idle for a full window length.
    pub fn cleanup(&mut self, now: Instant) {
        let window = self.window;
        self.windows.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|last| now.duration_since(*last) < window)
        });
    }

    /// Number of parents with a window on record.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Forget the window of a parent that no longer exists.
    pub fn forget(&mut self, parent: WorkerId) {
        self.windows.remove(&Some(parent));
    }
}
