//! Worker-facing descriptors: what a launcher is asked to start and what it
//! reports back when polled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::search::Hyperparameters;

/// Opaque handle to a launched execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerRef(String);

impl WorkerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Describes a single trial to be started by a worker launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub sweep_id: String,

    /// Trial index within the sweep.
    pub trial_id: usize,

    /// Parameter overrides passed to the training script.
    pub hyperparameters: Hyperparameters,

    pub script_path: String,

    /// The metric the script is expected to report.
    pub objective: String,

    pub framework: String,

    /// Compute tier the worker should be placed on (e.g. "cpu-medium").
    pub cloud_compute: String,
}

impl LaunchRequest {
    /// Worker component name, `<sweep_id>.<trial id>`.
    pub fn component_name(&self) -> String {
        format!("{}.{}", self.sweep_id, self.trial_id)
    }

    /// Hyperparameters rendered as `--name=value`, in parameter-name order.
    pub fn cli_args(&self) -> Vec<String> {
        self.hyperparameters
            .iter()
            .map(|(name, value)| format!("--{name}={value}"))
            .collect()
    }
}

/// Worker-side view of a trial's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// What a launcher returns when polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub status: WorkerStatus,
    /// Latest metric values, merged into the trial's metrics.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// Failure detail, kept as the trial's exception.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkerReport {
    pub fn new(status: WorkerStatus) -> Self {
        Self {
            status,
            metrics: HashMap::new(),
            message: None,
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParameterValue;

    fn request() -> LaunchRequest {
        let mut hyperparameters = Hyperparameters::new();
        hyperparameters.insert("model.lr".into(), ParameterValue::Float(0.01));
        hyperparameters.insert(
            "data.batch_size".into(),
            ParameterValue::Json(serde_json::json!(32)),
        );
        hyperparameters.insert(
            "model.optimizer".into(),
            ParameterValue::Json(serde_json::json!("adam")),
        );

        LaunchRequest {
            sweep_id: "thomas-cb8f69f0".into(),
            trial_id: 1,
            hyperparameters,
            script_path: "train.py".into(),
            objective: "val_loss".into(),
            framework: "pytorch_lightning".into(),
            cloud_compute: "cpu".into(),
        }
    }

    #[test]
    fn cli_args_are_sorted_by_name() {
        assert_eq!(
            request().cli_args(),
            vec![
                "--data.batch_size=32".to_string(),
                "--model.lr=0.01".to_string(),
                "--model.optimizer=adam".to_string(),
            ]
        );
        assert_eq!(request().component_name(), "thomas-cb8f69f0.1");
    }

    #[test]
    fn worker_ref_is_transparent_on_the_wire() {
        let json = serde_json::to_string(&WorkerRef::new("sim-3")).unwrap();
        assert_eq!(json, "\"sim-3\"");
    }

    #[test]
    fn report_defaults_when_fields_missing() {
        let report: WorkerReport = serde_json::from_str(r#"{"status":"running"}"#).unwrap();
        assert_eq!(report, WorkerReport::new(WorkerStatus::Running));
    }
}
