//! Atlassian Statuspage v2: `{"status": {"indicator": "...", "description": "..."}}`.

use async_trait::async_trait;
use serde_json::Value;

use super::{fetch_body, Interpretation, StatusInterpreter};
use crate::error::FetchError;
use crate::http::HttpClient;
use crate::types::{ProviderDescriptor, ServiceStatus};

pub struct StatuspageInterpreter;

#[async_trait]
impl StatusInterpreter for StatuspageInterpreter {
    fn name(&self) -> &str {
        "statuspage_v2"
    }

    async fn check(
        &self,
        provider: &ProviderDescriptor,
        http: &dyn HttpClient,
    ) -> Result<Interpretation, FetchError> {
        let body = fetch_body(provider, http).await?;
        interpret_body(&body)
    }
}

pub fn map_indicator(indicator: &str) -> ServiceStatus {
    match indicator {
        "none" => ServiceStatus::Operational,
        "minor" => ServiceStatus::Degraded,
        "major" | "critical" => ServiceStatus::Down,
        _ => ServiceStatus::Unknown,
    }
}

pub fn interpret_body(body: &str) -> Result<Interpretation, FetchError> {
    let json: Value = serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let Some(indicator) = json["status"]["indicator"].as_str() else {
        return Err(FetchError::Malformed("missing status.indicator".into()));
    };

    let details = json["status"]["description"].as_str().map(String::from);
    Ok(Interpretation::new(map_indicator(indicator), details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::MockHttp;
    use crate::types::ResponseFormat;

    fn body(indicator: &str) -> String {
        format!(r#"{{"page":{{"id":"x"}},"status":{{"indicator":"{}","description":"All Systems Operational"}}}}"#, indicator)
    }

    #[test]
    fn test_indicator_mapping() {
        let status = |indicator| interpret_body(&body(indicator)).unwrap().status;
        assert_eq!(status("none"), ServiceStatus::Operational);
        assert_eq!(status("minor"), ServiceStatus::Degraded);
        assert_eq!(status("major"), ServiceStatus::Down);
        assert_eq!(status("critical"), ServiceStatus::Down);
        assert_eq!(status("maintenance"), ServiceStatus::Unknown);
    }

    #[test]
    fn test_description_becomes_details() {
        let i = interpret_body(&body("none")).unwrap();
        assert_eq!(i.details.as_deref(), Some("All Systems Operational"));
    }

    #[test]
    fn test_unparsable_payloads_are_malformed() {
        for payload in ["", "<html>oops</html>", "{\"status\":{}}", "[1,2,3]", "{\"status\":{\"indicator\":7}}"] {
            let err = interpret_body(payload).unwrap_err();
            assert!(matches!(err, FetchError::Malformed(_)), "payload {:?} gave {:?}", payload, err);
        }
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_transport_failure() {
        let http = MockHttp::new();
        http.respond("https://s.test/api/v2/status.json", 503, "unavailable");
        let p = ProviderDescriptor::new("s", "S", "https://s.test/api/v2/status.json", ResponseFormat::StatuspageV2);

        let err = StatuspageInterpreter.check(&p, &http).await.unwrap_err();
        assert_eq!(err, FetchError::HttpStatus(503));
    }

    #[tokio::test]
    async fn test_check_reads_live_body() {
        let http = MockHttp::new();
        http.respond("https://s.test/api/v2/status.json", 200, &body("minor"));
        let p = ProviderDescriptor::new("s", "S", "https://s.test/api/v2/status.json", ResponseFormat::StatuspageV2);

        let i = StatuspageInterpreter.check(&p, &http).await.unwrap();
        assert_eq!(i.status, ServiceStatus::Degraded);
    }
}
