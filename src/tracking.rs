use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Experiment tracking store operations used by the orchestrator.
///
/// Every call is a fallible remote call. The Python `with mlflow.start_run()`
/// scope maps to passing explicit run ids here; there is no ambient active run.
#[allow(async_fn_in_trait)]
pub trait TrackingStore {
    /// Get or create an experiment by name, returning its id
    async fn set_experiment(&self, name: &str) -> Result<String>;
    /// Start a new run under the experiment, returning the run id
    async fn create_run(&self, experiment_id: &str) -> Result<String>;
    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()>;
    /// `synchronous` mirrors the tracking client contract; the REST transport
    /// completes the call either way
    async fn log_metric(&self, run_id: &str, key: &str, value: f64, synchronous: bool)
    -> Result<()>;
    async fn log_table(&self, run_id: &str, rows: &Value, artifact_file: &str) -> Result<()>;
}

/// MLflow REST client
pub struct MlflowTracking {
    base_uri: String,
    client: reqwest::Client,
}

impl MlflowTracking {
    pub fn new(base_uri: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build tracking store HTTP client")?;
        Ok(Self {
            base_uri: base_uri.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_uri, path)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(self.api(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Tracking store call {path} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Tracking store call {path} returned {status}: {text}");
        }
        response
            .json()
            .await
            .with_context(|| format!("Tracking store call {path} returned invalid JSON"))
    }
}

impl TrackingStore for MlflowTracking {
    async fn set_experiment(&self, name: &str) -> Result<String> {
        let response = self
            .client
            .get(self.api("experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()
            .await
            .context("Tracking store experiment lookup failed")?;

        if response.status().is_success() {
            let body: Value = response
                .json()
                .await
                .context("Experiment lookup returned invalid JSON")?;
            let id = body["experiment"]["experiment_id"]
                .as_str()
                .context("Experiment lookup response missing experiment_id")?;
            debug!(experiment = name, experiment_id = id, "Found existing experiment");
            return Ok(id.to_string());
        }

        // Not found (or any lookup failure body): create it
        let body = self
            .post("experiments/create", &json!({ "name": name }))
            .await?;
        let id = body["experiment_id"]
            .as_str()
            .context("Experiment create response missing experiment_id")?;
        debug!(experiment = name, experiment_id = id, "Created experiment");
        Ok(id.to_string())
    }

    async fn create_run(&self, experiment_id: &str) -> Result<String> {
        let body = self
            .post(
                "runs/create",
                &json!({
                    "experiment_id": experiment_id,
                    "start_time": Utc::now().timestamp_millis(),
                }),
            )
            .await?;
        let run_id = body["run"]["info"]["run_id"]
            .as_str()
            .context("Run create response missing run_id")?;
        Ok(run_id.to_string())
    }

    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()> {
        let params: Vec<Value> = params
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        self.post(
            "runs/log-batch",
            &json!({ "run_id": run_id, "params": params }),
        )
        .await?;
        Ok(())
    }

    async fn log_metric(
        &self,
        run_id: &str,
        key: &str,
        value: f64,
        _synchronous: bool,
    ) -> Result<()> {
        self.post(
            "runs/log-metric",
            &json!({
                "run_id": run_id,
                "key": key,
                "value": value,
                "timestamp": Utc::now().timestamp_millis(),
                "step": 0,
            }),
        )
        .await?;
        Ok(())
    }

    async fn log_table(&self, run_id: &str, rows: &Value, artifact_file: &str) -> Result<()> {
        let response = self
            .client
            .post(self.api("upload-artifact"))
            .query(&[("run_id", run_id), ("path", artifact_file)])
            .json(rows)
            .send()
            .await
            .context("Tracking store artifact upload failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Tracking store artifact upload returned {status}: {text}");
        }
        Ok(())
    }
}
