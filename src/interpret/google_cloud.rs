//! Google Cloud `incidents.json`: an array of incidents, most recent first.
//!
//! Operational unless some incident is still open (no `end`) and its
//! impact is an outage or disruption.

use async_trait::async_trait;
use serde_json::Value;

use super::{fetch_body, Interpretation, StatusInterpreter};
use crate::error::FetchError;
use crate::http::HttpClient;
use crate::types::{ProviderDescriptor, ServiceStatus};

pub struct GoogleCloudInterpreter;

#[async_trait]
impl StatusInterpreter for GoogleCloudInterpreter {
    fn name(&self) -> &str {
        "google_cloud"
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

fn is_disruptive(incident: &Value) -> bool {
    let impact = incident["status_impact"]
        .as_str()
        .or_else(|| incident["severity"].as_str())
        .unwrap_or_default()
        .to_ascii_uppercase();
    impact.contains("OUTAGE") || impact.contains("DISRUPTION") || impact == "HIGH"
}

fn is_open(incident: &Value) -> bool {
    match incident.get("end") {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

pub fn interpret_body(body: &str) -> Result<Interpretation, FetchError> {
    let json: Value = serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
    let Some(incidents) = json.as_array() else {
        return Err(FetchError::Malformed("expected an incident array".into()));
    };

    let active: Vec<&Value> = incidents
        .iter()
        .filter(|i| is_open(i) && is_disruptive(i))
        .collect();

    let interpretation = match active.first() {
        None => Interpretation::new(ServiceStatus::Operational, None),
        Some(first) => {
            let desc = first["external_desc"].as_str().unwrap_or("Active incident");
            let details = if active.len() > 1 {
                format!("{} (+{} more active incidents)", desc, active.len() - 1)
            } else {
                desc.to_string()
            };
            Interpretation::new(ServiceStatus::Degraded, Some(details))
        }
    };
    Ok(interpretation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_incidents_is_operational() {
        assert_eq!(interpret_body("[]").unwrap().status, ServiceStatus::Operational);
    }

    #[test]
    fn test_resolved_incidents_are_ignored() {
        let body = r#"[{"begin":"2024-01-01T00:00:00Z","end":"2024-01-01T02:00:00Z","status_impact":"SERVICE_OUTAGE","external_desc":"old"}]"#;
        assert_eq!(interpret_body(body).unwrap().status, ServiceStatus::Operational);
    }

    #[test]
    fn test_open_disruption_is_degraded() {
        let body = r#"[
            {"begin":"2024-05-01T00:00:00Z","status_impact":"SERVICE_DISRUPTION","external_desc":"Vertex AI latency"},
            {"begin":"2024-05-01T01:00:00Z","end":null,"status_impact":"SERVICE_OUTAGE","external_desc":"GCS errors"}
        ]"#;
        let i = interpret_body(body).unwrap();
        assert_eq!(i.status, ServiceStatus::Degraded);
        assert_eq!(i.details.as_deref(), Some("Vertex AI latency (+1 more active incidents)"));
    }

    #[test]
    fn test_open_informational_incident_is_operational() {
        let body = r#"[{"begin":"2024-05-01T00:00:00Z","status_impact":"SERVICE_INFORMATION","severity":"low"}]"#;
        assert_eq!(interpret_body(body).unwrap().status, ServiceStatus::Operational);
    }

    #[test]
    fn test_non_array_is_malformed() {
        assert!(matches!(interpret_body(r#"{"incidents":[]}"#), Err(FetchError::Malformed(_))));
        assert!(matches!(interpret_body("not json"), Err(FetchError::Malformed(_))));
    }
}
