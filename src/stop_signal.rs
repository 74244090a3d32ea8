// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{atomic::AtomicBool, Arc};
use std::time::Duration;

/// Cooperative shutdown signal for compaction workers.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Signals all workers to stop.
    pub fn send(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Returns `true` if the signal was sent.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Sleeps for up to `duration`, waking up early when the signal is sent.
    pub fn sleep(&self, duration: Duration) {
        let tick = Duration::from_millis(50);
        let mut remaining = duration;

        while !self.is_stopped() && !remaining.is_zero() {
            let step = remaining.min(tick);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}
