use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logging state of one phase of a record's lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// One retrieved chunk backing a response, ordered by descending relevance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceNode {
    pub node_id: String,
    pub doc_id: String,
    pub source_file_name: String,
    pub score: f64,
    pub content: String,
}

/// A single turn of chat history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// User feedback attached to a record by the feedback API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    /// Thumbs signal, 0.0 or 1.0
    pub feedback: f64,
    /// Optional free-text feedback
    #[serde(default)]
    pub feedback_str: Option<String>,
}

/// Named metric; value is absent when the judge output could not be parsed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: Option<f64>,
}

/// One query/response pair plus its evaluation lifecycle state.
///
/// Written by the external prediction API, mutated only by the orchestrator
/// (and by the feedback API, which attaches `feedback` and resets
/// `feedback_logged_status`). Field names match the on-disk JSON format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: String,
    pub input: String,
    pub output: String,
    pub data_source_id: i64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub source_nodes: Vec<SourceNode>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub mlflow_experiment_id: Option<String>,
    #[serde(default)]
    pub mlflow_run_id: Option<String>,
    #[serde(default)]
    pub metrics_logged_status: LogStatus,
    #[serde(default)]
    pub feedback_logged_status: LogStatus,
    #[serde(default)]
    pub feedback: Option<Feedback>,
    #[serde(default)]
    pub metrics: Option<Vec<Metric>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_top_k() -> usize {
    5
}

fn default_chunk_size() -> usize {
    512
}

impl ResponseRecord {
    /// Both lifecycle phases have reached success
    pub fn is_complete(&self) -> bool {
        self.metrics_logged_status == LogStatus::Success
            && self.feedback_logged_status == LogStatus::Success
    }

    /// Experiment and run ids have both been assigned
    pub fn has_run_ids(&self) -> bool {
        self.mlflow_experiment_id.is_some() && self.mlflow_run_id.is_some()
    }

    /// Contexts for evaluation, in stored source-node order
    pub fn contexts(&self) -> Vec<String> {
        self.source_nodes.iter().map(|n| n.content.clone()).collect()
    }
}

/// User-defined judge rubric, one JSON file per evaluator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomEvaluatorSpec {
    pub name: String,
    pub eval_definition: String,
    /// Newline-delimited evaluation questions
    pub questions: String,
}

/// Outcome of one orchestrator pass over one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// All applicable phases are done
    Success,
    /// Progress was made or work remains; retry next sweep
    Pending,
    /// Neither phase could make progress this pass; retry next sweep
    Failed,
}

/// Updated record plus the pass status returned to the reconciler
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub record: ResponseRecord,
    pub status: PassStatus,
}
