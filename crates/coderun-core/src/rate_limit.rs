//! Sliding-window rate limiter for run requests

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Tracks request timestamps over the last minute
#[derive(Debug)]
pub(crate) struct RateLimiter {
    timestamps: VecDeque<Instant>,
    max_per_minute: u32,
}

impl RateLimiter {
    /// `0` disables limiting
    pub(crate) fn new(max_per_minute: u32) -> Self {
        Self {
            timestamps: VecDeque::new(),
            max_per_minute,
        }
    }

    /// Record a request; `Err(retry_after_secs)` when over the limit
    pub(crate) fn check(&mut self) -> Result<(), u64> {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> Result<(), u64> {
        if self.max_per_minute == 0 {
            return Ok(());
        }
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) >= WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.timestamps.len() >= self.max_per_minute as usize {
            let retry_after = self
                .timestamps
                .front()
                .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)).as_secs() + 1)
                .unwrap_or(1);
            return Err(retry_after);
        }
        self.timestamps.push_back(now);
        Ok(())
    }
}
