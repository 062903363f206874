use crate::judge::{JudgeModel, built_in_evaluators, load_custom_evaluators};
use crate::keywords::extract_keywords;
use crate::models::{EvalOutcome, LogStatus, Metric, PassStatus, ResponseRecord};
use crate::registry::RunRegistry;
use crate::tracking::TrackingStore;
use anyhow::{Context, Result};
use futures::future::join_all;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Drives one record through the evaluation state machine: experiment/run
/// registration, concurrent judge evaluation with metric logging, then
/// feedback logging. Failed phases are left pending and retried on the next
/// sweep; status flags never move backwards from success.
pub struct Orchestrator<T, M> {
    tracking: T,
    model: M,
    registry: RunRegistry,
    evaluators_dir: PathBuf,
    judge_timeout: Duration,
    keyword_top_n: usize,
}

impl<T: TrackingStore, M: JudgeModel> Orchestrator<T, M> {
    pub fn new(
        tracking: T,
        model: M,
        registry: RunRegistry,
        evaluators_dir: impl Into<PathBuf>,
        judge_timeout: Duration,
        keyword_top_n: usize,
    ) -> Self {
        Self {
            tracking,
            model,
            registry,
            evaluators_dir: evaluators_dir.into(),
            judge_timeout,
            keyword_top_n,
        }
    }

    /// Ensure the record carries experiment and run ids, creating them on
    /// first use. Idempotent: a record that already has both ids gets them
    /// back unchanged with no tracking-store calls.
    pub async fn ensure_assigned(
        &self,
        record: &mut ResponseRecord,
    ) -> Result<(String, String)> {
        if let (Some(experiment_id), Some(run_id)) =
            (&record.mlflow_experiment_id, &record.mlflow_run_id)
        {
            info!(
                record_id = %record.id,
                experiment_id = %experiment_id,
                run_id = %run_id,
                "Experiment and run ids already set"
            );
            return Ok((experiment_id.clone(), run_id.clone()));
        }

        let experiment_id = match &record.mlflow_experiment_id {
            Some(id) => id.clone(),
            None => {
                self.tracking
                    .set_experiment(&format!("{}_live", record.data_source_id))
                    .await?
            }
        };
        let run_id = match &record.mlflow_run_id {
            Some(id) => id.clone(),
            None => self.tracking.create_run(&experiment_id).await?,
        };

        info!(
            record_id = %record.id,
            experiment_id = %experiment_id,
            run_id = %run_id,
            "Set experiment and run ids first time"
        );
        record.mlflow_experiment_id = Some(experiment_id.clone());
        record.mlflow_run_id = Some(run_id.clone());
        Ok((experiment_id, run_id))
    }

    /// One orchestrator pass over one record
    pub async fn evaluate_record(&self, mut record: ResponseRecord) -> EvalOutcome {
        if record.is_complete() {
            return EvalOutcome {
                record,
                status: PassStatus::Success,
            };
        }

        if !record.has_run_ids() {
            let status = match self.ensure_assigned(&mut record).await {
                Ok(_) => PassStatus::Pending,
                Err(e) => {
                    error!(record_id = %record.id, error = %e, "Failed to assign experiment and run ids");
                    PassStatus::Failed
                }
            };
            // No further work this pass; evaluation starts next sweep
            return EvalOutcome { record, status };
        }

        let mut progressed = false;

        if record.metrics_logged_status != LogStatus::Success {
            match self.run_metrics_phase(&mut record).await {
                Ok(()) => {
                    record.metrics_logged_status = LogStatus::Success;
                    progressed = true;
                }
                Err(e) => {
                    // Left pending so the next sweep retries
                    error!(
                        record_id = %record.id,
                        error = %e,
                        "Failed to log evaluation metrics"
                    );
                }
            }
        }

        if record.feedback_logged_status == LogStatus::Pending && record.feedback.is_some() {
            match self.run_feedback_phase(&record).await {
                Ok(()) => {
                    record.feedback_logged_status = LogStatus::Success;
                    progressed = true;
                }
                Err(e) => {
                    error!(record_id = %record.id, error = %e, "Failed to log feedback");
                }
            }
        }

        let metrics_done = record.metrics_logged_status == LogStatus::Success;
        // A record with no feedback attached has nothing to log yet
        let feedback_done =
            record.feedback_logged_status == LogStatus::Success || record.feedback.is_none();

        let status = if metrics_done && feedback_done {
            PassStatus::Success
        } else if progressed {
            PassStatus::Pending
        } else {
            PassStatus::Failed
        };
        EvalOutcome { record, status }
    }

    /// Metric-evaluation phase: log params, run all judges concurrently, log
    /// metrics and the live-results table. Any error leaves the status flag
    /// pending for the next sweep.
    async fn run_metrics_phase(&self, record: &mut ResponseRecord) -> Result<()> {
        let experiment_id = record
            .mlflow_experiment_id
            .clone()
            .context("Record is missing its experiment id")?;
        let run_id = record
            .mlflow_run_id
            .clone()
            .context("Record is missing its run id")?;

        info!(record_id = %record.id, "Evaluating response");
        let contexts = record.contexts();

        // Best-effort; a registry failure never fails the evaluation
        self.registry.register_run(&experiment_id, &run_id).await;

        let mut params = vec![
            ("input".to_string(), record.input.clone()),
            ("output".to_string(), record.output.clone()),
            (
                "data_source_id".to_string(),
                record.data_source_id.to_string(),
            ),
            ("top_k".to_string(), record.top_k.to_string()),
            ("chunk_size".to_string(), record.chunk_size.to_string()),
            ("model_name".to_string(), record.model_name.clone()),
            ("timestamp".to_string(), record.timestamp.to_rfc3339()),
        ];
        for (i, context) in contexts.iter().enumerate() {
            params.push((format!("context_{i}"), context.clone()));
        }
        self.tracking.log_params(&run_id, &params).await?;

        let mut evaluators = built_in_evaluators();
        evaluators.extend(load_custom_evaluators(&self.evaluators_dir));

        // All judge calls are independent and latency-bound; await as a batch
        let results = join_all(evaluators.iter().map(|evaluator| {
            evaluator.evaluate(
                &self.model,
                &record.input,
                &record.output,
                &contexts,
                self.judge_timeout,
            )
        }))
        .await;

        let mut metrics = Vec::new();
        for (evaluator, result) in evaluators.iter().zip(results) {
            let result = result?;
            if result.invalid {
                warn!(
                    evaluator = %evaluator.name,
                    reason = result.invalid_reason.as_deref().unwrap_or("unknown"),
                    "Judge returned an invalid result"
                );
            } else {
                debug!(evaluator = %evaluator.name, rationale = %result.rationale, "Judge feedback");
            }
            metrics.push(Metric {
                name: evaluator.metric_name(),
                value: result.score,
            });
        }
        metrics.push(Metric {
            name: "input_length".to_string(),
            value: Some(record.input.split_whitespace().count() as f64),
        });
        metrics.push(Metric {
            name: "output_length".to_string(),
            value: Some(record.output.split_whitespace().count() as f64),
        });
        record.metrics = Some(metrics.clone());

        for metric in &metrics {
            if let Some(value) = metric.value {
                self.tracking
                    .log_metric(&run_id, &metric.name, value, false)
                    .await?;
            }
        }
        info!(
            experiment_id = %experiment_id,
            run_id = %run_id,
            "Logged evaluation metrics"
        );

        let query_keywords = extract_keywords(&record.input, self.keyword_top_n);
        let response_keywords = extract_keywords(&record.output, self.keyword_top_n);
        self.tracking
            .log_table(
                &run_id,
                &json!({
                    "response_id": record.id,
                    "input": record.input,
                    "output": record.output,
                    "source_nodes": record.source_nodes,
                    "query_keywords": query_keywords.join(", "),
                    "response_keywords": response_keywords.join(", "),
                    "timestamp": record.timestamp.to_rfc3339(),
                }),
                "live_results.json",
            )
            .await?;
        info!(
            experiment_id = %experiment_id,
            run_id = %run_id,
            "Logged live results table"
        );
        Ok(())
    }

    /// Feedback-logging phase, run against the already-assigned run
    async fn run_feedback_phase(&self, record: &ResponseRecord) -> Result<()> {
        let run_id = record
            .mlflow_run_id
            .clone()
            .context("Record is missing its run id")?;
        let feedback = record
            .feedback
            .as_ref()
            .context("Record has no feedback attached")?;

        info!(record_id = %record.id, "Logging feedback");
        self.tracking
            .log_metric(&run_id, "feedback", feedback.feedback, false)
            .await?;

        if let Some(feedback_str) = &feedback.feedback_str {
            self.tracking
                .log_table(
                    &run_id,
                    &json!({ "feedback_str": feedback_str }),
                    "user_feedback.json",
                )
                .await?;
        }
        Ok(())
    }
}
