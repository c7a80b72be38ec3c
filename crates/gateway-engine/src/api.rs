//! Public API types for the in-process `inngate` gateway.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use inngate_core::cache::SqliteTtlCache;
use inngate_core::classify::MaskPolicy;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Configuration for the gateway pipeline.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Overall timeout per upstream action.
    pub default_timeout: Duration,

    /// Lower bound of the jitter sleep before each upstream action.
    pub send_delay_min: Duration,
    /// Upper bound of the jitter sleep; zero disables the jitter entirely.
    pub send_delay_max: Duration,

    /// Max upstream actions per sliding `rate_window`.
    pub rate_max_actions: usize,
    /// Sliding window of the upstream rate limiter.
    pub rate_window: Duration,

    /// Safety margin added to every upstream-supplied wait before opening
    /// the breaker.
    pub floodwait_buffer: Duration,
    /// Breaker cooldown for account-level flood signals.
    pub peerflood_cooldown: Duration,

    /// Per-user admissions per rolling hour.
    pub user_quota_per_hour: usize,
    /// Job queue capacity; admission beyond it is rejected, not blocked.
    pub queue_maxsize: usize,
    /// When set, updates from non-private chats are silently ignored.
    pub private_only: bool,

    /// Controls required on the first reply before the edit watch is skipped.
    pub min_buttons: usize,
    /// Overall deadline of the edit watch.
    pub edit_timeout: Duration,
    /// Give up on the edit watch after this long without a matching edit.
    pub edit_quiet_timeout: Duration,
    /// Overall deadline of click-and-collect.
    pub collect_timeout: Duration,
    /// Give up collecting after this long without a new event.
    pub collect_idle_timeout: Duration,
    /// Stop collecting once this many events have been captured.
    pub max_collect_events: usize,
}

impl GatewayConfig {
    /// Default overall timeout per upstream action.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Default controls threshold for the edit watch.
    pub const DEFAULT_MIN_BUTTONS: usize = 1;

    /// Default overall edit-watch deadline.
    pub const DEFAULT_EDIT_TIMEOUT: Duration = Duration::from_secs(18);

    /// Default edit-watch quiet timeout.
    pub const DEFAULT_EDIT_QUIET_TIMEOUT: Duration = Duration::from_millis(2500);

    /// Default click-and-collect deadline (empirically tuned, not an
    /// invariant).
    pub const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(4);

    /// Default collect idle timeout.
    pub const DEFAULT_COLLECT_IDLE_TIMEOUT: Duration = Duration::from_millis(800);

    /// Default collect event cap.
    pub const DEFAULT_MAX_COLLECT_EVENTS: usize = 5;

    /// Default cooldown after an account-level flood signal (6 hours).
    pub const DEFAULT_PEERFLOOD_COOLDOWN: Duration = Duration::from_secs(6 * 3600);
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout: Self::DEFAULT_TIMEOUT,
            send_delay_min: Duration::ZERO,
            send_delay_max: Duration::ZERO,
            rate_max_actions: 10,
            rate_window: Duration::from_secs(60),
            floodwait_buffer: Duration::from_secs(5),
            peerflood_cooldown: Self::DEFAULT_PEERFLOOD_COOLDOWN,
            user_quota_per_hour: 10,
            queue_maxsize: 100,
            private_only: true,
            min_buttons: Self::DEFAULT_MIN_BUTTONS,
            edit_timeout: Self::DEFAULT_EDIT_TIMEOUT,
            edit_quiet_timeout: Self::DEFAULT_EDIT_QUIET_TIMEOUT,
            collect_timeout: Self::DEFAULT_COLLECT_TIMEOUT,
            collect_idle_timeout: Self::DEFAULT_COLLECT_IDLE_TIMEOUT,
            max_collect_events: Self::DEFAULT_MAX_COLLECT_EVENTS,
        }
    }
}

/// External collaborators the gateway is wired to.
pub struct GatewayDeps {
    /// Persistent result cache.
    pub cache: Arc<SqliteTtlCache>,
    /// The upstream conversation transport.
    pub upstream: Arc<dyn UpstreamTransport>,
    /// Delivery side of the ingress front-end.
    pub ingress: Arc<dyn Ingress>,
    /// Masking applied to phone/email before projection.
    pub mask: Arc<dyn MaskPolicy>,
}

/// One message as observed from the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    /// Upstream message identifier; stable across edits of the same message.
    pub id: i64,
    /// Message text, possibly empty.
    pub text: String,
    /// Interactive control labels, row-major.
    pub buttons: Vec<Vec<String>>,
}

impl UpstreamMessage {
    /// Total number of controls across all rows.
    pub fn buttons_count(&self) -> usize {
        self.buttons.iter().map(Vec::len).sum()
    }

    /// Non-empty control labels, flattened row-major.
    pub fn buttons_flat(&self) -> Vec<String> {
        self.buttons
            .iter()
            .flatten()
            .filter(|label| !label.is_empty())
            .cloned()
            .collect()
    }

    /// Locates a control by label: exact normalized equality first, then
    /// substring containment; earliest row-major match wins.
    pub fn find_button(&self, label: &str) -> Option<(usize, usize)> {
        let want = inngate_core::classify::normalize_label(label);

        for (i, row) in self.buttons.iter().enumerate() {
            for (j, text) in row.iter().enumerate() {
                if !text.is_empty() && inngate_core::classify::normalize_label(text) == want {
                    return Some((i, j));
                }
            }
        }
        for (i, row) in self.buttons.iter().enumerate() {
            for (j, text) in row.iter().enumerate() {
                if !text.is_empty()
                    && inngate_core::classify::normalize_label(text).contains(&want)
                {
                    return Some((i, j));
                }
            }
        }
        None
    }
}

/// A new or edited message observed on the upstream event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A message the upstream just sent.
    New(UpstreamMessage),
    /// A fresh version of a message the upstream edited.
    Edited(UpstreamMessage),
}

impl UpstreamEvent {
    /// The message carried by the event.
    pub fn into_message(self) -> UpstreamMessage {
        match self {
            UpstreamEvent::New(msg) | UpstreamEvent::Edited(msg) => msg,
        }
    }
}

/// Upstream failure taxonomy; wait signals carry the requested pause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Transient wait requested by the upstream.
    #[error("upstream asked to wait ~{seconds}s")]
    FloodWait {
        /// Requested pause in seconds.
        seconds: u64,
    },
    /// Slow-mode wait in the upstream chat.
    #[error("slow mode, wait ~{seconds}s")]
    SlowMode {
        /// Requested pause in seconds.
        seconds: u64,
    },
    /// Account-level anti-spam restriction.
    #[error("account is peer-flood restricted")]
    PeerFlood,
    /// Writing to the upstream chat is forbidden.
    #[error("writing to the upstream chat is forbidden")]
    WriteForbidden,
    /// The upstream blocked this account.
    #[error("the upstream blocked this account")]
    Blocked,
    /// No reply within the deadline.
    #[error("timed out waiting for the upstream")]
    Timeout,
    /// Any other transport error.
    #[error("upstream rpc error: {0}")]
    Rpc(String),
}

/// Single-writer adapter to the upstream conversation.
///
/// Implementations are expected to filter events to the configured upstream
/// identity. Dropping a subscription receiver tears the subscription down.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Sends `text` to the upstream and awaits exactly one reply message.
    async fn send_and_wait(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<UpstreamMessage, UpstreamError>;

    /// Subscribes to the merged stream of new/edited upstream messages.
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<UpstreamEvent>;

    /// Presses the control at `(row, col)` of message `message_id`.
    async fn click(&self, message_id: i64, row: usize, col: usize) -> Result<(), UpstreamError>;
}

/// Handle to a file uploaded through the ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// Transport-specific file identifier.
    pub id: String,
    /// Original filename as presented by the user.
    pub filename: String,
}

/// Reference to a message previously sent through the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    /// Destination chat.
    pub chat_id: i64,
    /// Message identifier within the chat.
    pub message_id: i64,
}

/// Delivery side of the ingress front-end (best-effort; failures are logged
/// by the caller, never surfaced to jobs).
#[async_trait]
pub trait Ingress: Send + Sync {
    /// Materializes an uploaded file.
    async fn fetch_bytes(&self, file: &FileHandle) -> anyhow::Result<Vec<u8>>;

    /// Sends a text message, returning a reference usable with `edit_text`.
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<MessageRef>;

    /// Replaces the text of a previously sent message.
    async fn edit_text(&self, message: &MessageRef, text: &str) -> anyhow::Result<()>;

    /// Sends a local file under the given filename.
    async fn send_file(&self, chat_id: i64, path: &Path, filename: &str) -> anyhow::Result<()>;
}

/// One inbound user interaction delivered by the ingress front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressUpdate {
    /// Identity the quota is charged to.
    pub user_id: i64,
    /// Chat replies go back to.
    pub chat_id: i64,
    /// Whether the originating chat is private.
    pub private_chat: bool,
    /// What the user sent.
    pub payload: IngressPayload,
}

/// Payload of an inbound interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressPayload {
    /// A plain text message.
    Text(String),
    /// An uploaded document.
    Document(FileHandle),
}

/// Terminal status of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Summary parsed, cached, returned.
    Ok,
    /// The upstream found nothing, or the requested label was absent.
    NotFound,
    /// Daily cap signalled; do not retry today.
    Limit,
    /// The conversation is refused; operator action required.
    Forbidden,
    /// A wait/flood signal; the breaker is open.
    Flood,
    /// Transport/timeout/unexpected failure; retry later.
    Error,
}

impl Status {
    /// Canonical name, as written to the batch status column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "NOT_FOUND",
            Status::Limit => "LIMIT",
            Status::Forbidden => "FORBIDDEN",
            Status::Flood => "FLOOD",
            Status::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admitted lookup, produced exactly once per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Queried tax number.
    pub inn: String,
    /// Queried full name.
    pub fio: String,
    /// Masked phone, empty unless the lookup succeeded.
    pub phone: String,
    /// Masked email, empty unless the lookup succeeded.
    pub email: String,
    /// Terminal status.
    pub status: Status,
    /// Human-presentable reply; never raw upstream output beyond the three
    /// whitelisted fields.
    pub safe_text: String,
}

/// Gateway event stream payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    /// Gateway started.
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// The worker picked up a job.
    JobStarted {
        /// Queried tax number.
        inn: String,
        /// Queried full name.
        fio: String,
    },
    /// A job completed (any status).
    JobFinished {
        /// The job's result.
        result: JobResult,
    },
    /// A batch file was admitted.
    BatchStarted {
        /// Number of extracted input rows.
        rows: usize,
    },
    /// Periodic batch progress (every 10 rows and at completion).
    BatchProgress {
        /// Rows processed so far.
        done: usize,
        /// Total rows in the batch.
        total: usize,
    },
    /// A batch finished, possibly short-circuited by a day limit.
    BatchFinished {
        /// Rows that produced a result.
        processed: usize,
        /// Rows carried over for later retry.
        pending: usize,
    },
    /// The circuit breaker was opened or extended.
    BreakerOpened {
        /// Cooldown length in seconds.
        seconds: u64,
    },
    /// A non-fatal warning.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error.
    Error {
        /// Error message.
        message: String,
    },
    /// Gateway stopped.
    Stopped,
}

/// Handle to a running gateway instance.
pub struct GatewayHandle {
    pub(crate) inner: Arc<crate::engine::GatewayInner>,
    pub(crate) router: Arc<crate::ingress::IngressRouter>,
    pub(crate) join: tokio::task::JoinHandle<()>,
}

/// Start a new in-process gateway instance.
pub fn start_gateway(config: GatewayConfig, deps: GatewayDeps) -> GatewayHandle {
    crate::engine::start_gateway(config, deps)
}

impl GatewayHandle {
    /// Subscribe to the gateway event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GatewayEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Routes one inbound user interaction through the pipeline.
    ///
    /// Ingress adapters call this once per delivered update; replies go out
    /// through the [`Ingress`] the gateway was started with.
    pub async fn handle_update(&self, update: IngressUpdate) {
        self.router.handle_update(update).await;
    }

    /// Request a graceful shutdown: stop admitting, finish the in-flight
    /// job, fail whatever is still queued.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the gateway to stop.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.join
            .await
            .map_err(|err| anyhow::anyhow!("gateway task join error: {err}"))
    }
}
