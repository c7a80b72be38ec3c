//! Sliding-window admission control for upstream actions.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Allows at most `max_actions` acquisitions per rolling `window`.
///
/// The whole acquire body runs under one mutex, so contenders are served in
/// FIFO order and a successful `acquire` returns within the age of the oldest
/// occupied slot.
pub struct SlidingWindowLimiter {
    max_actions: usize,
    window: Duration,
    slots: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter; `max_actions` is clamped to ≥ 1 and `window` to ≥ 1 s.
    pub fn new(max_actions: usize, window: Duration) -> Self {
        Self {
            max_actions: max_actions.max(1),
            window: window.max(Duration::from_secs(1)),
            slots: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits until an action slot is free, then claims it.
    pub async fn acquire(&self) {
        let mut slots = self.slots.lock().await;
        loop {
            let now = Instant::now();
            while slots
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.window)
            {
                slots.pop_front();
            }
            if slots.len() < self.max_actions {
                slots.push_back(now);
                return;
            }
            // Oldest slot frees up first; sleep until it leaves the window.
            let wake_at = slots[0] + self.window;
            tokio::time::sleep_until(wake_at).await;
            slots.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_max_is_immediate() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_waits_for_oldest_slot() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn slots_free_up_as_the_window_slides() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(5));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_max_per_window() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));
        let mut grants: Vec<Instant> = Vec::new();
        for _ in 0..6 {
            limiter.acquire().await;
            grants.push(Instant::now());
        }
        for pair in grants.windows(3) {
            // Any three consecutive grants must span at least one full window.
            assert!(pair[2].duration_since(pair[0]) >= Duration::from_secs(10));
        }
    }

    #[test]
    fn constructor_clamps_degenerate_config() {
        let limiter = SlidingWindowLimiter::new(0, Duration::ZERO);
        assert_eq!(limiter.max_actions, 1);
        assert_eq!(limiter.window, Duration::from_secs(1));
    }
}
