// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token-bucket limiter for compaction write throughput
///
/// Shared by all compaction workers; caps the bytes per second that
/// background merges may write so foreground I/O is not starved.
pub struct RateLimiter {
    bytes_per_sec: u64,
    state: Mutex<State>,
}

struct State {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a new rate limiter; 0 means unlimited.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(State {
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns `true` if the limiter is a no-op.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    /// Takes `bytes` out of the budget, blocking until enough budget is
    /// available.
    #[allow(clippy::expect_used)]
    #[allow(clippy::cast_precision_loss)]
    pub fn take(&self, bytes: u64) {
        if self.is_unlimited() {
            return;
        }

        let rate = self.bytes_per_sec as f64;
        let wanted = bytes as f64;

        loop {
            let wait = {
                let mut state = self.state.lock().expect("lock is poisoned");

                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.last_refill = Instant::now();

                // Burst capacity is capped at one second worth of budget
                state.available = rate.min(state.available + elapsed * rate);

                if state.available >= wanted {
                    state.available -= wanted;
                    return;
                }

                (wanted - state.available) / rate
            };

            std::thread::sleep(Duration::from_secs_f64(wait.min(1.0)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RateLimiter;
    use test_log::test;

    #[test]
    fn rate_limiter_unlimited() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.is_unlimited());

        // Must not block
        limiter.take(u64::MAX);
    }

    #[test]
    fn rate_limiter_throttles() {
        let limiter = RateLimiter::new(1_000_000);

        let start = std::time::Instant::now();

        // First MB is burst, the second needs to wait ~1s
        limiter.take(1_000_000);
        limiter.take(500_000);

        assert!(start.elapsed() >= std::time::Duration::from_millis(400));
    }
}
