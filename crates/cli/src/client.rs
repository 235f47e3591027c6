//! API client for querying a running prm-agent

use anyhow::{Context, Result};
use prm_lib::health::{HealthResponse, ReadinessResponse};
use prm_lib::regulator::RegulatorStatus;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// API client for the agent HTTP endpoint
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_accepting(path, &[]).await
    }

    /// GET that also decodes the body of the listed error statuses
    ///
    /// Health probes answer 503 with a regular JSON body.
    async fn get_accepting<T: DeserializeOwned>(
        &self,
        path: &str,
        accepted: &[StatusCode],
    ) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() && !accepted.contains(&status) {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Current regulator state
    pub async fn get_state(&self) -> Result<RegulatorStatus> {
        self.get("api/v1/state").await
    }

    /// Component health, including unhealthy reports
    pub async fn get_health(&self) -> Result<HealthResponse> {
        self.get_accepting("healthz", &[StatusCode::SERVICE_UNAVAILABLE])
            .await
    }

    pub async fn get_readiness(&self) -> Result<ReadinessResponse> {
        self.get_accepting("readyz", &[StatusCode::SERVICE_UNAVAILABLE])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prm_lib::health::ComponentStatus;

    #[tokio::test]
    async fn test_get_state_decodes_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/state")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "cycles": 12,
                    "last_timestamp": 1700000000.0,
                    "tasks_tracked": 3,
                    "lc_util_max": 410.0,
                    "levels": {"cpu_cycles": 2, "llc": -1, "memory_bw": 0},
                    "cpu_model": "Intel(R) Xeon(R) Gold 6140",
                    "last_anomalies": [{
                        "resource": "llc",
                        "contended_task_id": "lc-1",
                        "contending_task_ids": ["be-1"],
                        "metrics": []
                    }]
                }"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let state = client.get_state().await.unwrap();

        mock.assert_async().await;
        assert_eq!(state.cycles, 12);
        assert_eq!(state.levels.cpu_cycles, 2);
        assert_eq!(state.levels.llc, -1);
        assert_eq!(state.last_anomalies[0].contending_task_ids, vec!["be-1"]);
    }

    #[tokio::test]
    async fn test_get_health_accepts_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "status": "unhealthy",
                    "components": {
                        "snapshot_source": {
                            "status": "unhealthy",
                            "message": "Snapshot file unreadable",
                            "last_check_timestamp": 1700000000
                        }
                    }
                }"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let health = client.get_health().await.unwrap();

        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            health.components["snapshot_source"].message.as_deref(),
            Some("Snapshot file unreadable")
        );
    }

    #[tokio::test]
    async fn test_get_state_reports_server_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/state")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.get_state().await.unwrap_err();

        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_get_readiness_not_ready() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/readyz")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ready": false, "reason": "Regulator not yet initialized"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let readiness = client.get_readiness().await.unwrap();

        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Regulator not yet initialized")
        );
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
