mod cli;
mod console;
mod shutdown;
mod sim;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info, warn};

use inngate_core::cache::SqliteTtlCache;
use inngate_core::classify::IdentityMask;
use inngate_engine::{GatewayDeps, GatewayEvent, start_gateway};

use crate::cli::Cli;
use crate::console::ConsoleIngress;
use crate::shutdown::{ShutdownEvent, spawn_ctrl_c_handler};
use crate::sim::SimulatedUpstream;

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let cfg = cli.gateway_config()?;
    if !cli.demo {
        if cli.tg_api_id.is_some_and(|id| id <= 0) {
            anyhow::bail!("TG_API_ID must be a positive integer");
        }
        for (name, value) in [
            ("TG_API_HASH", &cli.tg_api_hash),
            ("BOT_USERNAME", &cli.bot_username),
            ("CONTROL_BOT_TOKEN", &cli.control_bot_token),
        ] {
            if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                anyhow::bail!("{name} is empty");
            }
        }
        // The MTProto/Bot API transport adapters are deployment concerns and
        // are not part of this workspace.
        anyhow::bail!(
            "no upstream transport is configured in this build (session {:?}); \
             run with --demo to drive the pipeline against the built-in simulated upstream",
            cli.tg_session_name
        );
    }

    let cache = Arc::new(
        SqliteTtlCache::open(&cli.cache_db_path, cli.cache_ttl_seconds)
            .with_context(|| format!("open cache at {}", cli.cache_db_path.display()))?,
    );
    match cache.purge_expired().await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "dropped expired cache entries"),
        Err(err) => warn!(%err, "cache purge failed"),
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bot = %cli
            .normalized_bot_username()
            .unwrap_or_else(|| "@demo".to_string()),
        "inngate starting (demo mode)"
    );

    let console = ConsoleIngress::new();
    let gateway = start_gateway(
        cfg,
        GatewayDeps {
            cache: cache.clone(),
            upstream: SimulatedUpstream::new(),
            ingress: console,
            mask: Arc::new(IdentityMask),
        },
    );
    let mut events = gateway.subscribe();

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    spawn_ctrl_c_handler(shutdown_tx);
    let mut lines = console::spawn_stdin_reader();

    println!("Демо-консоль. Введите `ИНН; ФИО`, `/file путь.xlsx` для пакета, /exit для выхода.");

    let mut immediate_exit = false;
    let mut stdin_closed = false;
    loop {
        tokio::select! {
            ev = shutdown_rx.recv() => match ev {
                Some(ShutdownEvent::Graceful) => {
                    eprintln!("Stop requested — finishing current work (press CTRL+C again to exit immediately).");
                    gateway.request_stop();
                }
                Some(ShutdownEvent::Immediate) => {
                    immediate_exit = true;
                    break;
                }
                None => {}
            },
            line = lines.recv(), if !stdin_closed => match line.as_deref().map(str::trim) {
                Some("/exit") | Some("/quit") => {
                    stdin_closed = true;
                    gateway.request_stop();
                }
                None => {
                    stdin_closed = true;
                    gateway.request_stop();
                }
                Some(line) => {
                    if let Some(update) = console::update_from_line(line) {
                        gateway.handle_update(update).await;
                    }
                }
            },
            evt = events.recv() => {
                let evt = match evt {
                    Ok(evt) => evt,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match evt {
                    GatewayEvent::JobFinished { result } => {
                        info!(inn = %result.inn, status = %result.status, "job finished");
                    }
                    GatewayEvent::BreakerOpened { seconds } => {
                        warn!(seconds, "upstream cooldown: breaker opened");
                    }
                    GatewayEvent::BatchFinished { processed, pending } => {
                        info!(processed, pending, "batch finished");
                    }
                    GatewayEvent::Warning { message } => warn!("{message}"),
                    GatewayEvent::Error { message } => error!("{message}"),
                    GatewayEvent::Stopped => break,
                    _ => {}
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    gateway.wait().await?;
    cache.close().await?;
    info!("inngate stopped");
    Ok(())
}
