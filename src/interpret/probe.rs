//! Alternative detection for providers without a machine-readable feed.
//!
//! Probes 2–3 known service endpoints in parallel with a short timeout and
//! grades the provider by how many answered: all → operational, some →
//! degraded, none → down.

use async_trait::async_trait;
use futures::future::join_all;
use std::time::Duration;
use tracing::debug;

use super::{Interpretation, StatusInterpreter};
use crate::error::FetchError;
use crate::http::HttpClient;
use crate::types::{ProviderDescriptor, ServiceStatus};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// At most this many endpoints are probed per provider.
const MAX_PROBES: usize = 3;

pub struct ProbeInterpreter {
    timeout: Duration,
}

impl ProbeInterpreter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn probe(&self, http: &dyn HttpClient, url: &str) -> bool {
        let status = match http.head(url, self.timeout).await {
            // Some origins refuse HEAD outright.
            Ok(405) => http.get(url, self.timeout).await.map(|r| r.status),
            other => other,
        };
        match status {
            Ok(code) => is_reachable(code),
            Err(e) => {
                debug!(url = url, "Probe failed: {}", e);
                false
            }
        }
    }
}

/// Anything short of a server error means the service answered. API roots
/// commonly reply 401/404 to anonymous requests while perfectly healthy.
fn is_reachable(status: u16) -> bool {
    status < 500
}

pub fn classify(reachable: usize, total: usize) -> ServiceStatus {
    if total == 0 {
        ServiceStatus::Unknown
    } else if reachable == total {
        ServiceStatus::Operational
    } else if reachable > 0 {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Down
    }
}

#[async_trait]
impl StatusInterpreter for ProbeInterpreter {
    fn name(&self) -> &str {
        "probe"
    }

    async fn check(
        &self,
        provider: &ProviderDescriptor,
        http: &dyn HttpClient,
    ) -> Result<Interpretation, FetchError> {
        let urls: Vec<&str> = provider.probe_urls().into_iter().take(MAX_PROBES).collect();
        let outcomes = join_all(urls.iter().map(|url| self.probe(http, url))).await;

        let reachable = outcomes.iter().filter(|ok| **ok).count();
        let status = classify(reachable, urls.len());
        Ok(Interpretation::new(
            status,
            Some(format!("{}/{} endpoints reachable", reachable, urls.len())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::{MockHttp, Scripted};
    use crate::types::ResponseFormat;

    fn provider() -> ProviderDescriptor {
        ProviderDescriptor::new("p", "P", "https://status.p.test", ResponseFormat::ConnectivityCheck)
            .with_fallback_urls(&["https://a.p.test", "https://b.p.test", "https://c.p.test"])
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(3, 3), ServiceStatus::Operational);
        assert_eq!(classify(1, 3), ServiceStatus::Degraded);
        assert_eq!(classify(0, 3), ServiceStatus::Down);
        assert_eq!(classify(0, 0), ServiceStatus::Unknown);
    }

    #[tokio::test]
    async fn test_all_reachable_is_operational() {
        let http = MockHttp::new();
        http.respond("https://a.p.test", 200, "");
        http.respond("https://b.p.test", 401, "");
        http.respond("https://c.p.test", 404, "");

        let i = ProbeInterpreter::new(DEFAULT_PROBE_TIMEOUT).check(&provider(), &http).await.unwrap();
        assert_eq!(i.status, ServiceStatus::Operational);
        assert_eq!(i.details.as_deref(), Some("3/3 endpoints reachable"));
    }

    #[tokio::test]
    async fn test_partial_and_total_failure() {
        let http = MockHttp::new();
        http.respond("https://a.p.test", 200, "");
        http.respond("https://b.p.test", 502, "");
        http.script("https://c.p.test", vec![Scripted::Fail(FetchError::Timeout(DEFAULT_PROBE_TIMEOUT))]);
        let prober = ProbeInterpreter::new(DEFAULT_PROBE_TIMEOUT);
        assert_eq!(prober.check(&provider(), &http).await.unwrap().status, ServiceStatus::Degraded);

        let dead = MockHttp::new();
        assert_eq!(prober.check(&provider(), &dead).await.unwrap().status, ServiceStatus::Down);
    }

    #[tokio::test]
    async fn test_head_405_retries_with_get() {
        let http = MockHttp::new();
        http.script(
            "https://status.p.test",
            vec![Scripted::Respond(405, String::new()), Scripted::Respond(200, String::new())],
        );
        let p = ProviderDescriptor::new("p", "P", "https://status.p.test", ResponseFormat::HtmlParsing);

        let i = ProbeInterpreter::new(DEFAULT_PROBE_TIMEOUT).check(&p, &http).await.unwrap();
        assert_eq!(i.status, ServiceStatus::Operational);
        assert_eq!(http.calls(), 2);
    }
}
