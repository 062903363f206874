use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Serialize)]
struct RunIdentifier<'a> {
    experiment_id: &'a str,
    run_id: &'a str,
}

/// Client for the external run-registry service. Registration is an
/// optimization for dashboard discovery, not a correctness dependency, so
/// failures are logged and swallowed.
pub struct RunRegistry {
    base_uri: String,
    client: reqwest::Client,
}

impl RunRegistry {
    pub fn new(base_uri: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build run registry HTTP client")?;
        Ok(Self {
            base_uri: base_uri.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Register an (experiment, run) pair. Returns whether registration
    /// succeeded; callers treat this as best-effort.
    pub async fn register_run(&self, experiment_id: &str, run_id: &str) -> bool {
        let body = RunIdentifier {
            experiment_id,
            run_id,
        };
        let response = self
            .client
            .post(format!("{}/runs", self.base_uri))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                info!(experiment_id, run_id, "Registered run with run registry");
                true
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                error!(
                    experiment_id,
                    run_id,
                    %status,
                    body = %text,
                    "Failed to register run with run registry"
                );
                false
            }
            Err(e) => {
                error!(
                    experiment_id,
                    run_id,
                    error = %e,
                    "Failed to register run with run registry"
                );
                false
            }
        }
    }
}
