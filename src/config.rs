//! Daemon configuration from `STATUSWATCH_*` environment variables, plus
//! the provider list.
//!
//! A malformed value never stops the daemon: it is logged and the default
//! is used instead.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::breaker::BreakerConfig;
use crate::fetcher::FetcherConfig;
use crate::interpret::probe;
use crate::limiter::{EndpointClass, RateLimitRule};
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::types::{ProviderDescriptor, ResponseFormat};

const PREFIX: &str = "STATUSWATCH_";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub db_path: PathBuf,
    pub providers_file: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Back client quotas with the SQLite limiter shared across instances.
    pub shared_limiter: bool,
    pub fetcher: FetcherConfig,
    pub client_rules: Vec<(EndpointClass, RateLimitRule)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{}{}", PREFIX, name)).filter(|v| !v.trim().is_empty());
        let num = |name: &str, default: u64| parse_or(name, var(name), default);

        let data_dir = match var("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .context("Cannot determine home directory; set STATUSWATCH_DATA_DIR")?
                .join(".statuswatch"),
        };

        let rate_window = Duration::from_secs(num("RATE_WINDOW_SECS", 60).max(1));
        let rule = |name: &str, default: u64| RateLimitRule {
            limit: num(name, default).min(u32::MAX as u64) as u32,
            window: rate_window,
        };

        let fetcher = FetcherConfig {
            cache_ttl: Duration::from_secs(num("CACHE_TTL_SECS", 60)),
            cache_capacity: num("CACHE_CAPACITY", 256) as usize,
            breaker: BreakerConfig {
                failure_threshold: num("BREAKER_THRESHOLD", 5).max(1) as u32,
                reset_timeout: Duration::from_secs(num("BREAKER_RESET_SECS", 60)),
            },
            retry: RetryPolicy {
                max_retries: num("RETRY_MAX", 3) as u32,
                base_delay: Duration::from_millis(num("RETRY_BASE_MS", 1000)),
                max_jitter: Duration::from_millis(num("RETRY_JITTER_MS", 1000)),
            },
            probe_timeout: Duration::from_millis(
                num("PROBE_TIMEOUT_MS", probe::DEFAULT_PROBE_TIMEOUT.as_millis() as u64),
            ),
            provider_rate: rule("RATE_OUTBOUND", 30),
            scheduler: SchedulerConfig {
                concurrency: num("SCHEDULER_CONCURRENCY", 20).max(1) as usize,
                batch_size: num("SCHEDULER_BATCH_SIZE", 50).max(1) as usize,
                item_timeout: Duration::from_secs(num("SCHEDULER_ITEM_TIMEOUT_SECS", 30)),
                ..SchedulerConfig::default()
            },
        };

        Ok(Self {
            socket_path: var("SOCKET_PATH").map_or_else(|| data_dir.join("statuswatch.sock"), PathBuf::from),
            db_path: var("DB_PATH").map_or_else(|| data_dir.join("ratelimit.db"), PathBuf::from),
            providers_file: var("PROVIDERS_FILE").map(PathBuf::from),
            poll_interval: Duration::from_secs(num("POLL_INTERVAL_SECS", 60).max(1)),
            shared_limiter: flag(var("SHARED_LIMITER")),
            client_rules: vec![
                (EndpointClass::Status, rule("RATE_STATUS", 60)),
                (EndpointClass::Health, rule("RATE_HEALTH", 120)),
                (EndpointClass::Provider, rule("RATE_PROVIDER", 30)),
            ],
            fetcher,
            data_dir,
        })
    }

    /// Providers from `providers_file`, or the built-in list.
    pub fn providers(&self) -> Result<Vec<ProviderDescriptor>> {
        match &self.providers_file {
            Some(path) => load_providers(path),
            None => Ok(default_providers()),
        }
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = %format!("{}{}", PREFIX, name), value = %raw, default = %default, "Malformed setting, using default");
                default
            }
        },
    }
}

fn flag(raw: Option<String>) -> bool {
    matches!(
        raw.as_deref().map(str::trim).map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// Read a provider list. `.json` files are parsed as JSON, anything else
/// as YAML.
pub fn load_providers(path: &Path) -> Result<Vec<ProviderDescriptor>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read provider list {}", path.display()))?;
    let is_json = path.extension().map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
    let providers: Vec<ProviderDescriptor> = if is_json {
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))?
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("Invalid YAML in {}", path.display()))?
    };
    validate(&providers)?;
    Ok(providers)
}

fn validate(providers: &[ProviderDescriptor]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for p in providers {
        if p.id.trim().is_empty() {
            bail!("Provider with empty id (name: {:?})", p.name);
        }
        if !seen.insert(p.id.as_str()) {
            bail!("Duplicate provider id: {}", p.id);
        }
        if p.status_url.trim().is_empty() && p.fallback_urls.is_empty() {
            bail!("Provider {} has neither a status URL nor fallback URLs", p.id);
        }
    }
    Ok(())
}

/// Built-in provider list used when no file is configured.
pub fn default_providers() -> Vec<ProviderDescriptor> {
    let statuspage = |id: &str, name: &str, host: &str, priority: i32| {
        let mut p = ProviderDescriptor::new(
            id,
            name,
            &format!("https://{}/api/v2/status.json", host),
            ResponseFormat::StatuspageV2,
        )
        .with_priority(priority);
        p.category = "llm".into();
        p.status_page_url = format!("https://{}", host);
        p
    };

    let mut google = ProviderDescriptor::new(
        "google-cloud",
        "Google Cloud AI",
        "https://status.cloud.google.com/incidents.json",
        ResponseFormat::GoogleCloud,
    )
    .with_priority(80);
    google.category = "cloud".into();
    google.status_page_url = "https://status.cloud.google.com".into();

    let mut mistral = ProviderDescriptor::new(
        "mistral",
        "Mistral AI",
        "https://status.mistral.ai",
        ResponseFormat::HtmlParsing,
    )
    .with_fallback_urls(&["https://api.mistral.ai/v1/models", "https://console.mistral.ai"])
    .with_priority(40);
    mistral.category = "llm".into();
    mistral.status_page_url = "https://status.mistral.ai".into();

    let mut perplexity = ProviderDescriptor::new(
        "perplexity",
        "Perplexity",
        "https://status.perplexity.com",
        ResponseFormat::ConnectivityCheck,
    )
    .with_fallback_urls(&["https://api.perplexity.ai", "https://www.perplexity.ai"])
    .with_priority(30);
    perplexity.category = "search".into();
    perplexity.status_page_url = "https://status.perplexity.com".into();

    vec![
        statuspage("openai", "OpenAI", "status.openai.com", 100),
        statuspage("anthropic", "Anthropic", "status.anthropic.com", 100),
        google,
        statuspage("groq", "Groq", "groqstatus.com", 60),
        statuspage("deepseek", "DeepSeek", "status.deepseek.com", 50),
        statuspage("cohere", "Cohere", "status.cohere.com", 50),
        mistral,
        perplexity,
    ]
}
