use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use inngate_core::breaker::CircuitBreaker;
use inngate_core::limiter::SlidingWindowLimiter;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::api::{GatewayConfig, GatewayDeps, GatewayEvent, GatewayHandle};
use crate::driver::{DriverConfig, UpstreamDriver};
use crate::ingress::IngressRouter;
use crate::worker::{WorkerContext, run_worker};

pub(crate) struct GatewayInner {
    pub(crate) event_tx: broadcast::Sender<GatewayEvent>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl GatewayInner {
    fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel::<GatewayEvent>(1024);
        Arc::new(Self {
            event_tx,
            stop_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        })
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(GatewayEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub(crate) async fn stopped(&self) {
        let mut notified = std::pin::pin!(self.notify.notified());
        notified.as_mut().enable();
        if self.should_stop() {
            return;
        }
        notified.await;
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Arc<Self> {
        Self::new()
    }
}

pub(crate) fn start_gateway(cfg: GatewayConfig, deps: GatewayDeps) -> GatewayHandle {
    let inner = GatewayInner::new();

    let limiter = Arc::new(SlidingWindowLimiter::new(
        cfg.rate_max_actions,
        cfg.rate_window,
    ));
    let breaker = Arc::new(CircuitBreaker::new());
    let (jobs_tx, jobs_rx) = mpsc::channel(cfg.queue_maxsize.max(1));

    let driver = UpstreamDriver::new(
        deps.upstream,
        limiter,
        breaker,
        DriverConfig::from_gateway(&cfg),
        inner.clone(),
    );
    let join = tokio::spawn(run_worker(
        jobs_rx,
        WorkerContext {
            driver,
            cache: deps.cache.clone(),
            mask: deps.mask,
            inner: inner.clone(),
        },
    ));

    let router = Arc::new(IngressRouter::new(
        cfg,
        deps.cache,
        deps.ingress,
        jobs_tx,
        inner.clone(),
    ));

    info!("gateway started");
    let _ = inner.event_tx.send(GatewayEvent::Started);
    GatewayHandle {
        inner,
        router,
        join,
    }
}
