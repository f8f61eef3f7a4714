//! Background poller: one polling cycle on startup, then one per interval.
//!
//! Scheduled cycles bypass the primary cache. An entry written between
//! ticks (by a dashboard request, say) would otherwise still be fresh at
//! the next tick and the provider would skip a whole interval.
//!
//! Each cycle is followed by a cleanup pass over the primary cache and the
//! limiters, so neither grows with identifiers that went quiet.

use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info};

use super::StatusFetcher;
use crate::limiter::ClientLimits;

/// Run the polling loop until the task is dropped.
pub async fn run_poller(fetcher: Arc<StatusFetcher>, clients: Option<Arc<ClientLimits>>, interval: Duration) {
    info!(
        providers = fetcher.providers().len(),
        interval_secs = interval.as_secs(),
        "📡 Status poller starting, initial cycle..."
    );

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // The first tick completes immediately.
        ticker.tick().await;
        run_cycle(&fetcher, clients.as_deref()).await;
    }
}

/// One polling cycle plus cleanup.
pub async fn run_cycle(fetcher: &Arc<StatusFetcher>, clients: Option<&ClientLimits>) {
    fetcher.refresh_all().await;

    let (swept, reclaimed) = fetcher.cleanup().await;
    let client_keys = match clients {
        Some(limits) => limits.cleanup().await,
        None => 0,
    };
    if swept + reclaimed + client_keys > 0 {
        debug!(
            cache_entries = swept,
            provider_windows = reclaimed,
            client_windows = client_keys,
            "Cleanup reclaimed idle state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetcherConfig;
    use crate::http::mock::MockHttp;
    use crate::http::HttpClient;
    use crate::limiter::{EndpointClass, RateLimitRule, SlidingWindowLimiter};
    use crate::retry::RetryPolicy;
    use crate::types::{ProviderDescriptor, ResponseFormat};

    const URL: &str = "https://status.anthropic.test/api/v2/status.json";

    fn fetcher(http: &Arc<MockHttp>) -> Arc<StatusFetcher> {
        Arc::new(StatusFetcher::new(
            vec![ProviderDescriptor::new("anthropic", "Anthropic", URL, ResponseFormat::StatuspageV2)],
            Arc::clone(http) as Arc<dyn HttpClient>,
            Arc::new(SlidingWindowLimiter::new()),
            FetcherConfig {
                retry: RetryPolicy::none(),
                ..FetcherConfig::default()
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_runs_immediately_then_every_interval() {
        let http = Arc::new(MockHttp::new());
        http.respond(URL, 200, r#"{"status":{"indicator":"minor"}}"#);
        let f = fetcher(&http);

        let task = tokio::spawn(run_poller(Arc::clone(&f), None, Duration::from_secs(60)));
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(http.calls(), 1);
        assert_eq!(f.last_results().len(), 1);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(http.calls(), 2);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_polls_even_when_cache_is_fresh() {
        let http = Arc::new(MockHttp::new());
        http.respond(URL, 200, r#"{"status":{"indicator":"none"}}"#);
        let f = fetcher(&http);

        let task = tokio::spawn(run_poller(Arc::clone(&f), None, Duration::from_secs(60)));
        time::sleep(Duration::from_secs(30)).await;
        assert!(f.invalidate("anthropic"));
        f.provider("anthropic").await;
        assert_eq!(http.calls(), 2);

        // The entry from t=30s is fresh until t=90s; the t=60s tick polls anyway.
        time::sleep(Duration::from_secs(31)).await;
        assert_eq!(http.calls(), 3);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_cleans_client_windows() {
        let http = Arc::new(MockHttp::new());
        http.respond(URL, 200, r#"{"status":{"indicator":"none"}}"#);
        let f = fetcher(&http);
        let clients = ClientLimits::new(Arc::new(SlidingWindowLimiter::new()))
            .with_rule(EndpointClass::Status, RateLimitRule::per_minute(5));

        clients.check(EndpointClass::Status, "dashboard").await;
        time::advance(Duration::from_secs(61)).await;
        run_cycle(&f, Some(&clients)).await;

        assert_eq!(clients.cleanup().await, 0, "idle window already reclaimed by the cycle");
    }
}
