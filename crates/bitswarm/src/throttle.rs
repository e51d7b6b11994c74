//! Sliding window byte budget.
use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Sums the bytes transferred over a trailing window and reports when the
/// budget of that window is spent.
#[derive(Debug, Clone)]
pub struct Throttle {
    max_size: u64,
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl Throttle {
    pub fn new(max_size: u64, window: Duration) -> Self {
        Self { max_size, window, samples: VecDeque::new() }
    }

    pub fn add(&mut self, size: u64) {
        self.samples.push_back((Instant::now(), size));
    }

    /// Prune samples older than the window and compare what is left with
    /// the budget.
    pub fn is_throttled(&mut self) -> bool {
        let now = Instant::now();
        while let Some((time, _)) = self.samples.front() {
            if now.duration_since(*time) <= self.window {
                break;
            }
            self.samples.pop_front();
        }
        self.total() >= self.max_size
    }

    /// Bytes inside the window at the last prune.
    pub fn total(&self) -> u64 {
        self.samples.iter().map(|(_, size)| size).sum()
    }
}
