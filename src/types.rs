//! Core types shared by every stage of the polling pipeline.
//!
//! A `ProviderDescriptor` goes in, a `StatusResult` comes out. Both are
//! immutable once built; a newer check supersedes an older result rather
//! than mutating it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

// ── Provider Configuration ──────────────────────────────────────────

/// How a provider publishes its health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Atlassian Statuspage `/api/v2/status.json`.
    StatuspageV2,
    /// Google Cloud `incidents.json` array.
    GoogleCloud,
    /// No feed at all; reachability of service endpoints is the signal.
    ConnectivityCheck,
    /// Human-only HTML status page.
    HtmlParsing,
    /// RSS incident feed.
    RssFeed,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::StatuspageV2 => "statuspage_v2",
            ResponseFormat::GoogleCloud => "google_cloud",
            ResponseFormat::ConnectivityCheck => "connectivity_check",
            ResponseFormat::HtmlParsing => "html_parsing",
            ResponseFormat::RssFeed => "rss_feed",
        }
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static per-provider configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    /// Machine-readable endpoint polled for status.
    pub status_url: String,
    /// Public page linked from the dashboard.
    #[serde(default)]
    pub status_page_url: String,
    pub format: ResponseFormat,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Service endpoints probed when the provider has no usable feed.
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher is served first by the batch scheduler.
    #[serde(default)]
    pub priority: i32,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_enabled() -> bool {
    true
}

impl ProviderDescriptor {
    /// Minimal descriptor; the remaining fields take their config defaults.
    pub fn new(id: &str, name: &str, status_url: &str, format: ResponseFormat) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            category: String::new(),
            status_url: status_url.to_string(),
            status_page_url: String::new(),
            format,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            fallback_urls: Vec::new(),
            enabled: true,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fallback_urls(mut self, urls: &[&str]) -> Self {
        self.fallback_urls = urls.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Endpoints for alternative detection. Falls back to the status URL
    /// when no dedicated probe targets are configured.
    pub fn probe_urls(&self) -> Vec<&str> {
        if self.fallback_urls.is_empty() {
            vec![self.status_url.as_str()]
        } else {
            self.fallback_urls.iter().map(String::as_str).collect()
        }
    }
}

// ── Check Results ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Operational,
    Degraded,
    Down,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Operational => "operational",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Down => "down",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one health check for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub provider_id: String,
    pub provider_name: String,
    pub status: ServiceStatus,
    pub response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResult {
    pub fn checked(
        provider: &ProviderDescriptor,
        status: ServiceStatus,
        response_time_ms: u64,
        details: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider.id.clone(),
            provider_name: provider.name.clone(),
            status,
            response_time_ms,
            checked_at: Utc::now(),
            details,
            error: None,
        }
    }

    /// A failed check with nothing better to fall back on.
    pub fn failed(provider: &ProviderDescriptor, error: String, response_time_ms: u64) -> Self {
        Self {
            provider_id: provider.id.clone(),
            provider_name: provider.name.clone(),
            status: ServiceStatus::Unknown,
            response_time_ms,
            checked_at: Utc::now(),
            details: None,
            error: Some(error),
        }
    }

    /// Degrade a last-known-good result: status forced to `unknown`,
    /// annotated with the current error.
    pub fn stale_from(last_good: &StatusResult, error: String, response_time_ms: u64) -> Self {
        Self {
            provider_id: last_good.provider_id.clone(),
            provider_name: last_good.provider_name.clone(),
            status: ServiceStatus::Unknown,
            response_time_ms,
            checked_at: Utc::now(),
            details: Some(format!(
                "Last known status: {} at {}",
                last_good.status,
                last_good.checked_at.to_rfc3339()
            )),
            error: Some(error),
        }
    }

    /// Only successful results may enter the last-known-good slot.
    pub fn is_successful(&self) -> bool {
        self.error.is_none() && self.status != ServiceStatus::Unknown
    }
}
