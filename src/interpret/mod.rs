//! Status interpreters, one strategy per `ResponseFormat`.
//!
//! The fetcher resolves a strategy once per provider through the
//! `InterpreterTable` instead of branching on provider ids. A strategy
//! returns `Err` for transport failures (timeouts, non-2xx) and for bodies
//! it cannot parse (`FetchError::Malformed`). It never panics. A parsed
//! body with an indicator it does not recognise is `unknown` without error.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::FetchError;
use crate::http::HttpClient;
use crate::types::{ProviderDescriptor, ResponseFormat, ServiceStatus};

pub mod google_cloud;
pub mod probe;
pub mod statuspage;

/// What a strategy concluded about a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpretation {
    pub status: ServiceStatus,
    pub details: Option<String>,
}

impl Interpretation {
    pub fn new(status: ServiceStatus, details: Option<String>) -> Self {
        Self { status, details }
    }
}

#[async_trait]
pub trait StatusInterpreter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run one check for `provider`.
    async fn check(
        &self,
        provider: &ProviderDescriptor,
        http: &dyn HttpClient,
    ) -> Result<Interpretation, FetchError>;
}

/// GET the provider's status URL and hand back the body, treating non-2xx
/// answers as failures.
pub(crate) async fn fetch_body(
    provider: &ProviderDescriptor,
    http: &dyn HttpClient,
) -> Result<String, FetchError> {
    let resp = http.get(&provider.status_url, provider.timeout()).await?;
    if !resp.is_success() {
        return Err(FetchError::HttpStatus(resp.status));
    }
    Ok(resp.body)
}

// ── Strategy Table ──────────────────────────────────────────────────

pub struct InterpreterTable {
    strategies: HashMap<ResponseFormat, Arc<dyn StatusInterpreter>>,
}

impl InterpreterTable {
    pub fn empty() -> Self {
        Self { strategies: HashMap::new() }
    }

    /// Standard table: feed formats get their parsers, feedless formats
    /// share the alternative-detection prober.
    pub fn standard(probe_timeout: Duration) -> Self {
        let mut table = Self::empty();
        table.register(ResponseFormat::StatuspageV2, Arc::new(statuspage::StatuspageInterpreter));
        table.register(ResponseFormat::GoogleCloud, Arc::new(google_cloud::GoogleCloudInterpreter));

        let prober: Arc<dyn StatusInterpreter> = Arc::new(probe::ProbeInterpreter::new(probe_timeout));
        table.register(ResponseFormat::ConnectivityCheck, Arc::clone(&prober));
        table.register(ResponseFormat::HtmlParsing, Arc::clone(&prober));
        table.register(ResponseFormat::RssFeed, prober);
        table
    }

    pub fn register(&mut self, format: ResponseFormat, strategy: Arc<dyn StatusInterpreter>) {
        self.strategies.insert(format, strategy);
    }

    pub fn for_format(&self, format: ResponseFormat) -> Option<&Arc<dyn StatusInterpreter>> {
        self.strategies.get(&format)
    }
}

impl Default for InterpreterTable {
    fn default() -> Self {
        Self::standard(probe::DEFAULT_PROBE_TIMEOUT)
    }
}
