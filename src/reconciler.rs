use crate::judge::JudgeModel;
use crate::models::PassStatus;
use crate::orchestrator::Orchestrator;
use crate::store::RecordStore;
use crate::tracking::TrackingStore;
use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

/// Background sweep loop over the record store.
///
/// Records are processed sequentially; the concurrency that matters happens
/// inside one record's evaluation (the judge batch). A record that errors
/// during read, evaluation, or write is logged and skipped so it never blocks
/// the rest of the sweep.
pub struct Reconciler<T, M> {
    store: RecordStore,
    orchestrator: Orchestrator<T, M>,
    interval: Duration,
    remove_completed: bool,
}

impl<T: TrackingStore, M: JudgeModel> Reconciler<T, M> {
    pub fn new(
        store: RecordStore,
        orchestrator: Orchestrator<T, M>,
        interval: Duration,
        remove_completed: bool,
    ) -> Self {
        Self {
            store,
            orchestrator,
            interval,
            remove_completed,
        }
    }

    /// Sweep, sleep, repeat forever
    pub async fn run(&self) -> Result<()> {
        self.store.ensure_dir()?;
        loop {
            info!(
                dir = %self.store.dir().display(),
                "Reconciler looking for response records"
            );
            self.sweep().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One pass over all currently listed records; returns how many were
    /// processed without a read/write error
    pub async fn sweep(&self) -> usize {
        let paths = match self.store.list_pending() {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "Failed to list record store");
                return 0;
            }
        };

        let mut processed = 0;
        for path in paths {
            match self.process_record(&path).await {
                Ok(status) => {
                    processed += 1;
                    if status == PassStatus::Failed {
                        error!(path = %path.display(), "Failed to process record. Will retry");
                    }
                }
                Err(e) => {
                    // Malformed or half-written file; leave it for the next sweep
                    error!(path = %path.display(), error = %e, "Error processing record file");
                }
            }
        }
        processed
    }

    async fn process_record(&self, path: &Path) -> Result<PassStatus> {
        let record = self.store.read(path)?;
        let outcome = self.orchestrator.evaluate_record(record).await;

        if self.remove_completed && outcome.record.is_complete() {
            self.store.remove(path)?;
        } else {
            self.store.write(path, &outcome.record)?;
        }
        Ok(outcome.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogStatus;
    use crate::registry::RunRegistry;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Tracking store that succeeds at everything unless switched off
    #[derive(Clone, Default)]
    struct ToggleTracking {
        down: Arc<AtomicBool>,
    }

    impl ToggleTracking {
        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("simulated tracking store outage");
            }
            Ok(())
        }
    }

    impl TrackingStore for ToggleTracking {
        async fn set_experiment(&self, name: &str) -> Result<String> {
            self.check()?;
            Ok(format!("exp-{name}"))
        }

        async fn create_run(&self, experiment_id: &str) -> Result<String> {
            self.check()?;
            Ok(format!("{experiment_id}-run"))
        }

        async fn log_params(&self, _run_id: &str, _params: &[(String, String)]) -> Result<()> {
            self.check()
        }

        async fn log_metric(
            &self,
            _run_id: &str,
            _key: &str,
            _value: f64,
            _synchronous: bool,
        ) -> Result<()> {
            self.check()
        }

        async fn log_table(
            &self,
            _run_id: &str,
            _rows: &serde_json::Value,
            _artifact_file: &str,
        ) -> Result<()> {
            self.check()
        }
    }

    struct CannedModel;

    impl JudgeModel for CannedModel {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok("Fine.\nFinal result: [RESULT] 2".to_string())
        }
    }

    fn reconciler_at(
        dir: &Path,
        tracking: ToggleTracking,
        remove_completed: bool,
    ) -> Reconciler<ToggleTracking, CannedModel> {
        let orchestrator = Orchestrator::new(
            tracking,
            CannedModel,
            RunRegistry::new("http://127.0.0.1:9").unwrap(),
            dir.join("evaluators"),
            Duration::from_secs(5),
            10,
        );
        Reconciler::new(
            RecordStore::new(dir),
            orchestrator,
            Duration::from_secs(15),
            remove_completed,
        )
    }

    fn write_pending_record(dir: &Path, id: &str, with_ids: bool) {
        let mut record = serde_json::json!({
            "id": id,
            "input": "What is CML?",
            "output": "CML is a machine learning platform.",
            "data_source_id": 3
        });
        if with_ids {
            record["mlflow_experiment_id"] = "exp-1".into();
            record["mlflow_run_id"] = "run-1".into();
        }
        std::fs::write(
            dir.join(format!("{id}.json")),
            serde_json::to_string_pretty(&record).unwrap(),
        )
        .unwrap();
    }

    fn read_status(dir: &Path, id: &str) -> LogStatus {
        let content = std::fs::read_to_string(dir.join(format!("{id}.json"))).unwrap();
        let record: crate::models::ResponseRecord = serde_json::from_str(&content).unwrap();
        record.metrics_logged_status
    }

    #[tokio::test]
    async fn test_sweep_updates_all_pending_records() {
        let temp_dir = tempdir().unwrap();
        write_pending_record(temp_dir.path(), "r1", true);
        write_pending_record(temp_dir.path(), "r2", true);

        let reconciler = reconciler_at(temp_dir.path(), ToggleTracking::default(), false);
        let processed = reconciler.sweep().await;

        assert_eq!(processed, 2);
        assert_eq!(read_status(temp_dir.path(), "r1"), LogStatus::Success);
        assert_eq!(read_status(temp_dir.path(), "r2"), LogStatus::Success);
    }

    #[tokio::test]
    async fn test_malformed_file_does_not_block_sweep() {
        let temp_dir = tempdir().unwrap();
        write_pending_record(temp_dir.path(), "r1", true);
        write_pending_record(temp_dir.path(), "r2", true);
        std::fs::write(temp_dir.path().join("corrupt.json"), "{ half a rec").unwrap();

        let reconciler = reconciler_at(temp_dir.path(), ToggleTracking::default(), false);
        let processed = reconciler.sweep().await;

        assert_eq!(processed, 2);
        assert_eq!(read_status(temp_dir.path(), "r1"), LogStatus::Success);
        assert_eq!(read_status(temp_dir.path(), "r2"), LogStatus::Success);
        // The corrupt file is left exactly as it was
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("corrupt.json")).unwrap(),
            "{ half a rec"
        );
    }

    #[tokio::test]
    async fn test_failed_record_is_persisted_for_retry() {
        let temp_dir = tempdir().unwrap();
        write_pending_record(temp_dir.path(), "r1", true);

        let tracking = ToggleTracking::default();
        tracking.down.store(true, Ordering::SeqCst);
        let reconciler = reconciler_at(temp_dir.path(), tracking.clone(), false);

        reconciler.sweep().await;
        assert_eq!(read_status(temp_dir.path(), "r1"), LogStatus::Pending);

        // Store recovers; the next sweep converges
        tracking.down.store(false, Ordering::SeqCst);
        reconciler.sweep().await;
        assert_eq!(read_status(temp_dir.path(), "r1"), LogStatus::Success);
    }

    #[tokio::test]
    async fn test_two_sweeps_take_fresh_record_to_success() {
        let temp_dir = tempdir().unwrap();
        write_pending_record(temp_dir.path(), "r1", false);

        let reconciler = reconciler_at(temp_dir.path(), ToggleTracking::default(), false);

        // Sweep 1 assigns ids only
        reconciler.sweep().await;
        assert_eq!(read_status(temp_dir.path(), "r1"), LogStatus::Pending);
        let content = std::fs::read_to_string(temp_dir.path().join("r1.json")).unwrap();
        assert!(content.contains("exp-3_live"));

        // Sweep 2 evaluates
        reconciler.sweep().await;
        assert_eq!(read_status(temp_dir.path(), "r1"), LogStatus::Success);
    }

    #[tokio::test]
    async fn test_remove_completed_deletes_terminal_records() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("r1.json");
        let record = serde_json::json!({
            "id": "r1",
            "input": "q",
            "output": "a",
            "data_source_id": 3,
            "mlflow_experiment_id": "exp-1",
            "mlflow_run_id": "run-1",
            "metrics_logged_status": "success",
            "feedback_logged_status": "success"
        });
        std::fs::write(&path, serde_json::to_string_pretty(&record).unwrap()).unwrap();

        let reconciler = reconciler_at(temp_dir.path(), ToggleTracking::default(), true);
        reconciler.sweep().await;
        assert!(!path.exists());
    }
}
