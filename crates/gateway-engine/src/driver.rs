use std::sync::Arc;
use std::time::Duration;

use inngate_core::breaker::CircuitBreaker;
use inngate_core::limiter::SlidingWindowLimiter;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{GatewayConfig, GatewayEvent, UpstreamError, UpstreamEvent, UpstreamMessage, UpstreamTransport};
use crate::engine::GatewayInner;

#[derive(Debug, Clone)]
pub(crate) struct DriverConfig {
    pub(crate) default_timeout: Duration,
    pub(crate) send_delay_min: Duration,
    pub(crate) send_delay_max: Duration,
    pub(crate) floodwait_buffer: Duration,
    pub(crate) peerflood_cooldown: Duration,
    pub(crate) min_buttons: usize,
    pub(crate) edit_timeout: Duration,
    pub(crate) edit_quiet_timeout: Duration,
    pub(crate) collect_timeout: Duration,
    pub(crate) collect_idle_timeout: Duration,
    pub(crate) max_collect_events: usize,
}

impl DriverConfig {
    pub(crate) fn from_gateway(cfg: &GatewayConfig) -> Self {
        Self {
            default_timeout: cfg.default_timeout,
            send_delay_min: cfg.send_delay_min,
            send_delay_max: cfg.send_delay_max,
            floodwait_buffer: cfg.floodwait_buffer,
            peerflood_cooldown: cfg.peerflood_cooldown,
            min_buttons: cfg.min_buttons.max(1),
            edit_timeout: cfg.edit_timeout,
            edit_quiet_timeout: cfg.edit_quiet_timeout,
            collect_timeout: cfg.collect_timeout,
            collect_idle_timeout: cfg.collect_idle_timeout,
            max_collect_events: cfg.max_collect_events.max(1),
        }
    }
}

/// Drives the upstream's edit-until-buttons / click-and-collect protocol.
///
/// Only the single worker holds a driver, which is what keeps upstream
/// actions serialized; the limiter and breaker gates are shared state.
pub(crate) struct UpstreamDriver {
    transport: Arc<dyn UpstreamTransport>,
    limiter: Arc<SlidingWindowLimiter>,
    breaker: Arc<CircuitBreaker>,
    cfg: DriverConfig,
    inner: Arc<GatewayInner>,
}

impl UpstreamDriver {
    pub(crate) fn new(
        transport: Arc<dyn UpstreamTransport>,
        limiter: Arc<SlidingWindowLimiter>,
        breaker: Arc<CircuitBreaker>,
        cfg: DriverConfig,
        inner: Arc<GatewayInner>,
    ) -> Self {
        Self {
            transport,
            limiter,
            breaker,
            cfg,
            inner,
        }
    }

    /// Breaker, then limiter, then jitter. The gate state may advance during
    /// each blocking step, so this runs in full before every upstream call.
    async fn gate(&self) {
        self.breaker.wait_if_open().await;
        self.limiter.acquire().await;
        self.jitter_sleep().await;
    }

    async fn jitter_sleep(&self) {
        let max = self.cfg.send_delay_max;
        if max.is_zero() {
            return;
        }
        let min = self.cfg.send_delay_min.min(max);
        let secs = rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64());
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    /// Opens the breaker for upstream wait signals; other errors pass through
    /// untouched.
    async fn trip_breaker_on(&self, err: &UpstreamError) {
        let cooldown = match err {
            UpstreamError::FloodWait { seconds } | UpstreamError::SlowMode { seconds } => {
                Duration::from_secs(*seconds) + self.cfg.floodwait_buffer
            }
            UpstreamError::PeerFlood => self.cfg.peerflood_cooldown,
            _ => return,
        };
        self.breaker.open_for(cooldown).await;
        warn!(cooldown_secs = cooldown.as_secs(), %err, "breaker opened");
        let _ = self.inner.event_tx.send(GatewayEvent::BreakerOpened {
            seconds: cooldown.as_secs(),
        });
    }

    /// Sends `text` and awaits the first reply.
    pub(crate) async fn send_query(&self, text: &str) -> Result<UpstreamMessage, UpstreamError> {
        self.gate().await;
        debug!(%text, "-> upstream");
        match self
            .transport
            .send_and_wait(text, self.cfg.default_timeout)
            .await
        {
            Ok(msg) => {
                debug!(reply = %msg.text.replace('\n', "\\n"), "<- upstream");
                Ok(msg)
            }
            Err(err) => {
                self.trip_breaker_on(&err).await;
                Err(err)
            }
        }
    }

    /// Watches edits of `first` until it carries at least `min_buttons`
    /// controls, the quiet timeout fires, or the overall deadline passes.
    /// Always returns the best version captured so far.
    pub(crate) async fn await_buttons(&self, first: &UpstreamMessage) -> UpstreamMessage {
        let mut events = self.transport.subscribe().await;
        let target_id = first.id;
        let mut best = first.clone();
        if best.buttons_count() >= self.cfg.min_buttons {
            return best;
        }

        let deadline = Instant::now() + self.cfg.edit_timeout;
        while Instant::now() < deadline {
            let next_edit = async {
                while let Some(ev) = events.recv().await {
                    if let UpstreamEvent::Edited(msg) = ev {
                        if msg.id == target_id {
                            return Some(msg);
                        }
                    }
                }
                None
            };
            match tokio::time::timeout(self.cfg.edit_quiet_timeout, next_edit).await {
                Ok(Some(msg)) => {
                    best = msg;
                    if best.buttons_count() >= self.cfg.min_buttons {
                        break;
                    }
                }
                // Quiet timeout or stream end: settle for what we have.
                Ok(None) | Err(_) => break,
            }
        }
        best
    }

    /// Presses `(row, col)` on `target` and collects the burst of new/edited
    /// messages that follows.
    pub(crate) async fn click_and_collect(
        &self,
        target: &UpstreamMessage,
        row: usize,
        col: usize,
    ) -> Result<Vec<String>, UpstreamError> {
        let mut events = self.transport.subscribe().await;
        self.gate().await;
        debug!(message_id = target.id, row, col, "click");
        if let Err(err) = self.transport.click(target.id, row, col).await {
            self.trip_breaker_on(&err).await;
            return Err(err);
        }

        let deadline = Instant::now() + self.cfg.collect_timeout;
        let mut collected = Vec::new();
        while Instant::now() < deadline && collected.len() < self.cfg.max_collect_events {
            match tokio::time::timeout(self.cfg.collect_idle_timeout, events.recv()).await {
                Ok(Some(ev)) => collected.push(ev.into_message().text),
                Ok(None) | Err(_) => break,
            }
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GatewayInner;
    use crate::testing::ScriptedUpstream;

    fn driver_with(
        upstream: Arc<ScriptedUpstream>,
        tune: impl FnOnce(&mut GatewayConfig),
    ) -> (UpstreamDriver, Arc<CircuitBreaker>) {
        let mut cfg = GatewayConfig::default();
        tune(&mut cfg);
        let breaker = Arc::new(CircuitBreaker::new());
        let limiter = Arc::new(SlidingWindowLimiter::new(
            cfg.rate_max_actions,
            cfg.rate_window,
        ));
        let driver = UpstreamDriver::new(
            upstream,
            limiter,
            breaker.clone(),
            DriverConfig::from_gateway(&cfg),
            GatewayInner::new_for_tests(),
        );
        (driver, breaker)
    }

    fn plain(id: i64, text: &str) -> UpstreamMessage {
        UpstreamMessage {
            id,
            text: text.to_string(),
            buttons: Vec::new(),
        }
    }

    fn with_buttons(id: i64, labels: &[&str]) -> UpstreamMessage {
        UpstreamMessage {
            id,
            text: String::new(),
            buttons: vec![labels.iter().map(|l| l.to_string()).collect()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_reply_with_buttons_skips_the_edit_watch() {
        let upstream = ScriptedUpstream::new();
        let (driver, _) = driver_with(upstream.clone(), |_| {});
        let first = with_buttons(5, &["Маркова Ольга Викторовна"]);

        let start = Instant::now();
        let best = driver.await_buttons(&first).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(best, first);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_watch_returns_the_edited_version() {
        let upstream = ScriptedUpstream::new();
        upstream.queue_subscription_batch(vec![
            UpstreamEvent::Edited(plain(5, "ищу…")),
            UpstreamEvent::Edited(with_buttons(5, &["Иванов И.И."])),
        ]);
        let (driver, _) = driver_with(upstream.clone(), |_| {});

        let best = driver.await_buttons(&plain(5, "ищу…")).await;
        assert_eq!(best.buttons_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edits_of_other_messages_are_ignored() {
        let upstream = ScriptedUpstream::new();
        upstream.queue_subscription_batch(vec![
            UpstreamEvent::Edited(with_buttons(99, &["чужая кнопка"])),
        ]);
        let (driver, _) = driver_with(upstream.clone(), |cfg| {
            cfg.edit_quiet_timeout = Duration::from_secs(2);
        });

        let start = Instant::now();
        let best = driver.await_buttons(&plain(5, "ищу…")).await;
        // Falls through to the quiet timeout with nothing captured.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(best.buttons_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_timeout_fires_before_the_overall_deadline() {
        let upstream = ScriptedUpstream::new();
        let (driver, _) = driver_with(upstream.clone(), |cfg| {
            cfg.edit_timeout = Duration::from_secs(18);
            cfg.edit_quiet_timeout = Duration::from_millis(2500);
        });

        let start = Instant::now();
        let best = driver.await_buttons(&plain(5, "ищу…")).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(2500));
        assert!(waited < Duration::from_secs(18));
        assert_eq!(best.buttons_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_bounds_a_chatty_editor() {
        let upstream = ScriptedUpstream::new();
        let (driver, _) = driver_with(upstream.clone(), |cfg| {
            cfg.edit_timeout = Duration::from_secs(10);
            cfg.edit_quiet_timeout = Duration::from_secs(3);
        });

        // Keep edits (without buttons) flowing more often than the quiet
        // timeout so only the overall deadline can end the watch.
        let feeder = upstream.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                feeder.emit(UpstreamEvent::Edited(plain(5, "всё ещё ищу…")));
            }
        });

        let start = Instant::now();
        let best = driver.await_buttons(&plain(5, "ищу…")).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(10));
        assert!(waited < Duration::from_secs(13));
        assert_eq!(best.buttons_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_stops_at_the_event_cap() {
        let upstream = ScriptedUpstream::new();
        upstream.queue_subscription_batch(
            (0..10)
                .map(|i| UpstreamEvent::New(plain(100 + i, &format!("msg {i}"))))
                .collect(),
        );
        let (driver, _) = driver_with(upstream.clone(), |cfg| {
            cfg.max_collect_events = 5;
        });

        let collected = driver
            .click_and_collect(&with_buttons(5, &["x"]), 0, 0)
            .await
            .unwrap();
        assert_eq!(collected.len(), 5);
        assert_eq!(upstream.clicks(), vec![(5, 0, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_stops_on_idle_timeout() {
        let upstream = ScriptedUpstream::new();
        upstream.queue_subscription_batch(vec![UpstreamEvent::New(plain(
            100,
            "📄 Краткая сводка\nФИО: Иванов",
        ))]);
        let (driver, _) = driver_with(upstream.clone(), |_| {});

        let collected = driver
            .click_and_collect(&with_buttons(5, &["x"]), 0, 0)
            .await
            .unwrap();
        assert_eq!(collected.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_opens_the_breaker_with_buffer() {
        let upstream = ScriptedUpstream::new();
        upstream.queue_reply(Err(UpstreamError::FloodWait { seconds: 7 }));
        let (driver, breaker) = driver_with(upstream.clone(), |cfg| {
            cfg.floodwait_buffer = Duration::from_secs(5);
        });

        let err = driver.send_query("/inn 1").await.unwrap_err();
        assert_eq!(err, UpstreamError::FloodWait { seconds: 7 });
        let remaining = breaker.remaining().await;
        assert!(remaining >= Duration::from_secs(11));
        assert!(remaining <= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn peer_flood_opens_the_long_cooldown() {
        let upstream = ScriptedUpstream::new();
        upstream.queue_reply(Err(UpstreamError::PeerFlood));
        let (driver, breaker) = driver_with(upstream.clone(), |cfg| {
            cfg.peerflood_cooldown = Duration::from_secs(21_600);
        });

        driver.send_query("/inn 1").await.unwrap_err();
        assert!(breaker.remaining().await >= Duration::from_secs(21_599));
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_errors_leave_the_breaker_alone() {
        let upstream = ScriptedUpstream::new();
        upstream.queue_reply(Err(UpstreamError::WriteForbidden));
        let (driver, breaker) = driver_with(upstream.clone(), |_| {});

        driver.send_query("/inn 1").await.unwrap_err();
        assert_eq!(breaker.remaining().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_delays_the_next_send() {
        let upstream = ScriptedUpstream::new();
        upstream.queue_reply(Ok(plain(1, "ок")));
        let (driver, breaker) = driver_with(upstream.clone(), |_| {});
        breaker.open_for(Duration::from_secs(7)).await;

        let start = Instant::now();
        driver.send_query("/inn 1").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_torn_down_on_every_exit() {
        let upstream = ScriptedUpstream::new();
        let (driver, _) = driver_with(upstream.clone(), |cfg| {
            cfg.edit_quiet_timeout = Duration::from_millis(100);
        });

        driver.await_buttons(&plain(5, "…")).await;
        upstream.queue_click_result(Err(UpstreamError::Rpc("CLICK_FAILED".into())));
        let _ = driver.click_and_collect(&with_buttons(5, &["x"]), 0, 0).await;

        assert_eq!(upstream.live_subscribers(), 0);
    }
}
