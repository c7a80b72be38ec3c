//! Global cooldown gate for upstream-signalled wait conditions.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// A gate that stalls all upstream-bound callers until a deadline passes.
///
/// Openings only ever extend the deadline; reopening never shortens an
/// existing cooldown.
pub struct CircuitBreaker {
    until: Mutex<Instant>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new() -> Self {
        Self {
            until: Mutex::new(Instant::now()),
        }
    }

    /// Sleeps out the remaining cooldown, if any.
    pub async fn wait_if_open(&self) {
        let until = *self.until.lock().await;
        if until > Instant::now() {
            tokio::time::sleep_until(until).await;
        }
    }

    /// Opens (or extends) the breaker for `cooldown` from now.
    pub async fn open_for(&self, cooldown: Duration) {
        let mut until = self.until.lock().await;
        let candidate = Instant::now() + cooldown;
        if candidate > *until {
            *until = candidate;
        }
    }

    /// Remaining cooldown; zero when the breaker is closed.
    pub async fn remaining(&self) -> Duration {
        let until = *self.until.lock().await;
        until.saturating_duration_since(Instant::now())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn closed_breaker_does_not_wait() {
        let breaker = CircuitBreaker::new();
        let start = Instant::now();
        breaker.wait_if_open().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_stalls_callers() {
        let breaker = CircuitBreaker::new();
        breaker.open_for(Duration::from_secs(7)).await;

        let start = Instant::now();
        breaker.wait_if_open().await;
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_never_shortens_the_cooldown() {
        let breaker = CircuitBreaker::new();
        breaker.open_for(Duration::from_secs(60)).await;
        breaker.open_for(Duration::from_secs(5)).await;
        assert!(breaker.remaining().await >= Duration::from_secs(59));

        breaker.open_for(Duration::from_secs(120)).await;
        assert!(breaker.remaining().await >= Duration::from_secs(119));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expires() {
        let breaker = CircuitBreaker::new();
        breaker.open_for(Duration::from_secs(3)).await;
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(breaker.remaining().await, Duration::ZERO);

        let start = Instant::now();
        breaker.wait_if_open().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
