//! Sweep configuration and the per-trial lifecycle record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sw_types::{LaunchError, Stage, StageError, StageEvent, SwResult};
use uuid::Uuid;

use crate::launch::WorkerRef;
use crate::search::{Hyperparameters, SearchSpace, StrategyKind};

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    #[default]
    Minimize,
}

impl ObjectiveDirection {
    /// Whether `candidate` is strictly better than `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

/// Experiment logger a sweep reports to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggerKind {
    /// Rendered in-app, one tab per sweep.
    #[default]
    Streamlit,
    Tensorboard,
    Wandb,
}

/// Declarative description of a sweep, as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Generated on registration when left empty.
    pub sweep_id: String,
    pub script_path: String,
    pub search_space: SearchSpace,
    pub strategy: StrategyKind,
    /// Fixes the strategy's random stream.
    pub seed: Option<u64>,
    /// Metric name the trials report their objective under.
    pub objective: String,
    pub direction: ObjectiveDirection,
    /// Concurrency budget: maximum trials in flight at once.
    pub simultaneous_trials: usize,
    /// Total trial budget.
    pub n_trials: usize,
    pub logger: LoggerKind,
    pub logger_url: Option<String>,
    pub framework: String,
    pub cloud_compute: String,
    pub created_at: DateTime<Utc>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sweep_id: String::new(),
            script_path: String::new(),
            search_space: SearchSpace::new(),
            strategy: StrategyKind::Random,
            seed: None,
            objective: "val_loss".to_string(),
            direction: ObjectiveDirection::Minimize,
            simultaneous_trials: 1,
            n_trials: 10,
            logger: LoggerKind::Streamlit,
            logger_url: None,
            framework: "pytorch_lightning".to_string(),
            cloud_compute: "cpu".to_string(),
            created_at: Utc::now(),
        }
    }
}

impl SweepConfig {
    pub fn new(
        sweep_id: impl Into<String>,
        script_path: impl Into<String>,
        search_space: SearchSpace,
    ) -> Self {
        Self {
            sweep_id: sweep_id.into(),
            script_path: script_path.into(),
            search_space,
            ..Self::default()
        }
    }

    /// Total trial budget and concurrency budget.
    pub fn with_budget(mut self, n_trials: usize, simultaneous_trials: usize) -> Self {
        self.n_trials = n_trials;
        self.simultaneous_trials = simultaneous_trials;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_objective(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.objective = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_logger(mut self, logger: LoggerKind) -> Self {
        self.logger = logger;
        self
    }

    /// Give the config an id of the form `<prefix>-<8 hex>` if it has none.
    pub fn ensure_id(&mut self, prefix: &str) -> &str {
        if self.sweep_id.is_empty() {
            let suffix = Uuid::new_v4().simple().to_string();
            self.sweep_id = format!("{prefix}-{}", &suffix[..8]);
        }
        &self.sweep_id
    }

    pub fn validate(&self) -> SwResult<()> {
        if self.sweep_id.trim().is_empty() {
            return Err(sw_types::validation_error!("sweep_id is empty"));
        }
        if self.sweep_id.contains(['/', '\\']) || self.sweep_id.starts_with('.') {
            return Err(sw_types::validation_error!(
                "sweep_id {:?} is not a valid identifier",
                self.sweep_id
            ));
        }
        if self.n_trials == 0 {
            return Err(sw_types::validation_error!("n_trials must be positive"));
        }
        if self.simultaneous_trials == 0 {
            return Err(sw_types::validation_error!("simultaneous_trials must be positive"));
        }
        if self.objective.is_empty() {
            return Err(sw_types::validation_error!("objective metric is empty"));
        }
        if let StrategyKind::Bayesian { exploration_weight } = self.strategy {
            if !(0.0..=1.0).contains(&exploration_weight) {
                return Err(sw_types::validation_error!(
                    "exploration_weight must be within [0, 1], got {exploration_weight}"
                ));
            }
        }
        self.search_space.validate()
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

/// One hyperparameter assignment and its execution lifecycle.
///
/// `stage` changes only through the stage machine, and `worker_ref` is set
/// exactly while the stage is `Pending` or `Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    id: usize,
    hyperparameters: Hyperparameters,
    stage: Stage,
    metrics: HashMap<String, f64>,
    worker_ref: Option<WorkerRef>,
    best_model_score: Option<f64>,
    exception: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(id: usize, hyperparameters: Hyperparameters) -> Self {
        Self {
            id,
            hyperparameters,
            stage: Stage::NotStarted,
            metrics: HashMap::new(),
            worker_ref: None,
            best_model_score: None,
            exception: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Generation index within the owning sweep.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn worker_ref(&self) -> Option<&WorkerRef> {
        self.worker_ref.as_ref()
    }

    pub fn metrics(&self) -> &HashMap<String, f64> {
        &self.metrics
    }

    pub fn best_model_score(&self) -> Option<f64> {
        self.best_model_score
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    /// Worker component name, `<sweep_id>.<trial id>`.
    pub fn component_name(&self, sweep_id: &str) -> String {
        format!("{sweep_id}.{}", self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// `true` when the worker handle agrees with the stage.
    pub fn worker_invariant_holds(&self) -> bool {
        self.worker_ref.is_some() == self.stage.holds_worker()
    }

    fn transition(&mut self, event: StageEvent) -> Result<Stage, StageError> {
        let next = self.stage.transition(event)?;
        self.stage = next;
        if next == Stage::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(next)
    }

    /// `NotStarted -> Pending`, attaching the launched worker.
    pub fn dispatch(&mut self, worker: WorkerRef) -> Result<(), StageError> {
        self.transition(StageEvent::Dispatch)?;
        self.worker_ref = Some(worker);
        Ok(())
    }

    /// `Pending -> Running`.
    pub fn acknowledge(&mut self) -> Result<(), StageError> {
        self.transition(StageEvent::WorkerAck).map(|_| ())
    }

    /// End the run; releases the worker handle.
    pub fn complete(&mut self, success: bool, exception: Option<String>) -> Result<(), StageError> {
        self.transition(StageEvent::Complete { success })?;
        self.worker_ref = None;
        if !success {
            self.exception = exception;
        }
        Ok(())
    }

    /// Force the trial into `Stopped`, handing back the worker to cancel (if any).
    pub fn cancel(&mut self) -> Result<Option<WorkerRef>, StageError> {
        self.transition(StageEvent::Cancel)?;
        Ok(self.worker_ref.take())
    }

    /// A launch request for this trial failed: straight to `Failed`.
    pub fn fail_launch(&mut self, error: &LaunchError) -> Result<(), StageError> {
        self.transition(StageEvent::Dispatch)?;
        self.complete(false, Some(error.to_string()))
    }

    /// Merge a worker's metric report; tracks the best objective value seen.
    pub fn record_metrics(
        &mut self,
        metrics: &HashMap<String, f64>,
        objective: &str,
        direction: ObjectiveDirection,
    ) {
        self.metrics
            .extend(metrics.iter().map(|(name, value)| (name.clone(), *value)));

        if let Some(&score) = metrics.get(objective) {
            let better = match self.best_model_score {
                None => true,
                Some(best) => direction.improves(score, best),
            };
            if better {
                self.best_model_score = Some(score);
            }
        }
    }
}
