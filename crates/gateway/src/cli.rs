use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use inngate_engine::GatewayConfig;

/// Accepts the documented truthy spellings; anything else is off.
fn parse_truthy(raw: &str) -> Result<bool, String> {
    Ok(matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes"
    ))
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("not a number of seconds: {raw:?}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("seconds must be finite and non-negative: {raw:?}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "inngate", version, about = "Lookup gateway guarding a rate-limited upstream bot")]
pub struct Cli {
    /// Upstream account API id.
    #[arg(long, env = "TG_API_ID", required_unless_present = "demo")]
    pub tg_api_id: Option<i64>,

    /// Upstream account API hash.
    #[arg(long, env = "TG_API_HASH", required_unless_present = "demo")]
    pub tg_api_hash: Option<String>,

    /// Local session identifier for the upstream account.
    #[arg(long, env = "TG_SESSION_NAME", default_value = "me")]
    pub tg_session_name: String,

    /// Username of the upstream bot; a missing `@` prefix is added.
    #[arg(long, env = "BOT_USERNAME", required_unless_present = "demo")]
    pub bot_username: Option<String>,

    /// Overall timeout per upstream action, in seconds.
    #[arg(long, env = "DEFAULT_TIMEOUT", default_value = "20", value_parser = parse_seconds)]
    pub default_timeout: Duration,

    /// Diagnostic verbosity (tracing filter).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Lower jitter bound before each upstream action, in seconds.
    #[arg(long, env = "SEND_DELAY_MIN", default_value = "0", value_parser = parse_seconds)]
    pub send_delay_min: Duration,

    /// Upper jitter bound before each upstream action, in seconds.
    #[arg(long, env = "SEND_DELAY_MAX", default_value = "0", value_parser = parse_seconds)]
    pub send_delay_max: Duration,

    /// Max upstream actions per rate window.
    #[arg(long, env = "RATE_MAX_ACTIONS", default_value_t = 10)]
    pub rate_max_actions: usize,

    /// Upstream rate window, in seconds.
    #[arg(long, env = "RATE_WINDOW_SECONDS", default_value = "60", value_parser = parse_seconds)]
    pub rate_window: Duration,

    /// Margin added to upstream-requested waits before opening the breaker.
    #[arg(long, env = "FLOODWAIT_BUFFER_SECONDS", default_value = "5", value_parser = parse_seconds)]
    pub floodwait_buffer: Duration,

    /// Breaker cooldown after an account-level flood signal.
    #[arg(long, env = "PEERFLOOD_COOLDOWN_SECONDS", default_value = "21600", value_parser = parse_seconds)]
    pub peerflood_cooldown: Duration,

    /// Cache database location.
    #[arg(long, env = "CACHE_DB_PATH", default_value = "cache.db")]
    pub cache_db_path: PathBuf,

    /// Cache entry lifetime in seconds; zero or less disables expiry.
    #[arg(long, env = "CACHE_TTL_SECONDS", default_value_t = 86_400)]
    pub cache_ttl_seconds: i64,

    /// Per-user admissions per rolling hour.
    #[arg(long, env = "USER_QUOTA_PER_HOUR", default_value_t = 10)]
    pub user_quota_per_hour: usize,

    /// Job queue capacity.
    #[arg(long, env = "QUEUE_MAXSIZE", default_value_t = 100)]
    pub queue_maxsize: usize,

    /// Ingress bot credential.
    #[arg(long, env = "CONTROL_BOT_TOKEN", required_unless_present = "demo")]
    pub control_bot_token: Option<String>,

    /// Serve private chats only (truthy: 1/true/yes, case-insensitive).
    #[arg(long, env = "CONTROL_PRIVATE_ONLY", default_value = "1", value_parser = parse_truthy)]
    pub control_private_only: bool,

    /// Run the pipeline against the built-in simulated upstream, with an
    /// operator console on stdin instead of the ingress bot.
    #[arg(long)]
    pub demo: bool,
}

impl Cli {
    /// Bot username with the `@` prefix ensured.
    pub fn normalized_bot_username(&self) -> Option<String> {
        self.bot_username.as_deref().map(ensure_at_prefix)
    }

    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        if self.default_timeout.is_zero() {
            anyhow::bail!("DEFAULT_TIMEOUT must be positive");
        }
        if self.send_delay_min > self.send_delay_max && !self.send_delay_max.is_zero() {
            anyhow::bail!("SEND_DELAY_MIN must not exceed SEND_DELAY_MAX");
        }
        Ok(GatewayConfig {
            default_timeout: self.default_timeout,
            send_delay_min: self.send_delay_min,
            send_delay_max: self.send_delay_max,
            rate_max_actions: self.rate_max_actions,
            rate_window: self.rate_window,
            floodwait_buffer: self.floodwait_buffer,
            peerflood_cooldown: self.peerflood_cooldown,
            user_quota_per_hour: self.user_quota_per_hour,
            queue_maxsize: self.queue_maxsize,
            private_only: self.control_private_only,
            ..GatewayConfig::default()
        })
    }
}

fn ensure_at_prefix(username: &str) -> String {
    let username = username.trim();
    if username.starts_with('@') {
        username.to_string()
    } else {
        format!("@{username}")
    }
}
