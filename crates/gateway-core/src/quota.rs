//! Per-user sliding-window admission at the ingress.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(3600);

/// At most `per_hour` admissions per user per rolling hour.
pub struct PerUserQuota {
    per_hour: usize,
    hits: Mutex<HashMap<i64, VecDeque<Instant>>>,
}

impl PerUserQuota {
    /// Creates a quota; `per_hour` is clamped to ≥ 1.
    pub fn new(per_hour: usize) -> Self {
        Self {
            per_hour: per_hour.max(1),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `(true, 0)` and charges the user, or `(false, retry_after)`.
    ///
    /// `retry_after` is the time until the user's oldest hit leaves the
    /// window, clamped to at least one second.
    pub async fn allow(&self, user_id: i64) -> (bool, Duration) {
        let mut hits = self.hits.lock().await;
        let now = Instant::now();
        let q = hits.entry(user_id).or_default();

        while q
            .front()
            .is_some_and(|t| now.duration_since(*t) > WINDOW)
        {
            q.pop_front();
        }

        if q.len() >= self.per_hour {
            let retry_after = WINDOW.saturating_sub(now.duration_since(q[0]));
            return (false, retry_after.max(Duration::from_secs(1)));
        }

        q.push_back(now);
        (true, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_quota() {
        let quota = PerUserQuota::new(3);
        for _ in 0..3 {
            let (ok, retry) = quota.allow(7).await;
            assert!(ok);
            assert_eq!(retry, Duration::ZERO);
        }
        let (ok, retry) = quota.allow(7).await;
        assert!(!ok);
        assert!(retry >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn users_are_independent() {
        let quota = PerUserQuota::new(1);
        assert!(quota.allow(1).await.0);
        assert!(!quota.allow(1).await.0);
        assert!(quota.allow(2).await.0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let quota = PerUserQuota::new(1);
        assert!(quota.allow(1).await.0);

        tokio::time::advance(Duration::from_secs(1800)).await;
        let (ok, retry) = quota.allow(1).await;
        assert!(!ok);
        assert_eq!(retry, Duration::from_secs(1800));

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert!(quota.allow(1).await.0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_is_clamped_to_a_second() {
        let quota = PerUserQuota::new(1);
        assert!(quota.allow(1).await.0);
        tokio::time::advance(WINDOW - Duration::from_millis(10)).await;
        let (ok, retry) = quota.allow(1).await;
        assert!(!ok);
        assert_eq!(retry, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_config_still_admits_one() {
        let quota = PerUserQuota::new(0);
        assert!(quota.allow(1).await.0);
        assert!(!quota.allow(1).await.0);
    }
}
