//! statuswatch daemon.
//!
//! Polls every configured provider on an interval and serves the results
//! over a local Unix socket (JSON-RPC 2.0). Configuration comes from
//! `STATUSWATCH_*` environment variables.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use statuswatch::config::Config;
use statuswatch::fetcher::{poller, StatusFetcher};
use statuswatch::http::ReqwestClient;
use statuswatch::limiter::{ClientLimits, PersistentLimiter, RateLimiter, SlidingWindowLimiter};
use statuswatch::server::Server;

fn init_tracing() {
    let json = std::env::var("STATUSWATCH_LOG_JSON")
        .map(|v| matches!(v.trim(), "1" | "true"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "statuswatch=info".into()))
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("📡 statuswatch v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    // ── Providers ───────────────────────────────────────────────────
    let providers = config.providers()?;
    let enabled = providers.iter().filter(|p| p.enabled).count();
    match &config.providers_file {
        Some(path) => info!(file = %path.display(), total = providers.len(), enabled = enabled, "Loaded provider list"),
        None => info!(total = providers.len(), "Using built-in provider list"),
    }

    // ── Rate Limiting ───────────────────────────────────────────────
    let limiter: Arc<dyn RateLimiter> = if config.shared_limiter {
        let shared = PersistentLimiter::open(&config.db_path).context("Failed to open shared rate limiter")?;
        info!(db = %config.db_path.display(), "Using shared SQLite rate limiter");
        Arc::new(shared)
    } else {
        Arc::new(SlidingWindowLimiter::new())
    };

    let limits = config
        .client_rules
        .iter()
        .fold(ClientLimits::new(Arc::clone(&limiter)), |limits, (class, rule)| {
            limits.with_rule(*class, *rule)
        });
    let limits = Arc::new(limits);

    // ── Fetcher ─────────────────────────────────────────────────────
    let fetcher = Arc::new(StatusFetcher::new(
        providers,
        Arc::new(ReqwestClient::new()),
        limiter,
        config.fetcher.clone(),
    ));

    // ── Poller ──────────────────────────────────────────────────────
    tokio::spawn(poller::run_poller(
        Arc::clone(&fetcher),
        Some(Arc::clone(&limits)),
        config.poll_interval,
    ));

    // ── JSON-RPC Server ─────────────────────────────────────────────
    let srv = Server::new(config.socket_path.clone(), fetcher, limits);

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("statuswatch ready, polling every {}s", config.poll_interval.as_secs());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    srv.run().await?;

    Ok(())
}
