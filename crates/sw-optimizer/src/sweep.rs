//! The sweep aggregate: a trial list, its generation strategy, and the pure
//! half of reconciliation.
//!
//! Every method here is synchronous and I/O free. The controller snapshots
//! what it needs ([`Sweep::active_workers`], [`Sweep::plan_launches`]), talks
//! to workers without holding any lock, and feeds the results back through
//! [`Sweep::apply_report`] and [`Sweep::apply_launch`].

use serde::{Deserialize, Serialize};
use sw_types::{LaunchError, Stage, StageError, SwResult};
use tracing::debug;

use crate::launch::{LaunchRequest, WorkerRef, WorkerReport, WorkerStatus};
use crate::search::SearchStrategy;
use crate::trial::{LoggerKind, ObjectiveDirection, SweepConfig, Trial};

/// Durable form of a sweep, as kept by a record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub config: SweepConfig,
    #[serde(default)]
    pub experiments: Vec<Trial>,
    #[serde(default)]
    pub stopped: bool,
}

impl SweepRecord {
    pub fn sweep_id(&self) -> &str {
        &self.config.sweep_id
    }
}

/// Result of feeding a launch attempt back into the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Trial is now `Pending` on the returned worker.
    Dispatched,
    /// Launch failed; trial is `Failed`.
    Failed,
    /// The trial was stopped while the launch was in flight; this worker
    /// must be cancelled.
    Orphaned(WorkerRef),
    /// Stopped mid-launch and the launch failed anyway; nothing to do.
    Discarded,
}

/// Read-only copy of a sweep for presentation and queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepView {
    pub sweep_id: String,
    pub stage: Stage,
    pub show: bool,
    pub n_trials: usize,
    pub simultaneous_trials: usize,
    pub trials_done: usize,
    pub framework: String,
    pub cloud_compute: String,
    pub objective: String,
    pub direction: ObjectiveDirection,
    pub logger: LoggerKind,
    pub logger_url: Option<String>,
    /// Id of the trial with the best objective so far.
    pub best_trial: Option<usize>,
    pub trials: Vec<Trial>,
}

/// A bounded hyperparameter search campaign.
pub struct Sweep {
    config: SweepConfig,
    experiments: Vec<Trial>,
    strategy: Box<dyn SearchStrategy>,
    show: bool,
    exhausted: bool,
    stopped: bool,
    complete: bool,
}

impl std::fmt::Debug for Sweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweep")
            .field("sweep_id", &self.config.sweep_id)
            .field("strategy", &self.strategy.name())
            .field("trials", &self.experiments.len())
            .field("complete", &self.complete)
            .finish()
    }
}

impl Sweep {
    /// Validate `config` and build a sweep with no trials yet.
    pub fn from_config(config: SweepConfig) -> SwResult<Self> {
        config.validate()?;
        let strategy = config
            .strategy
            .build(&config.search_space, config.seed, config.direction);
        let show = config.logger == LoggerKind::Streamlit;

        Ok(Self {
            config,
            experiments: Vec::new(),
            strategy,
            show,
            exhausted: false,
            stopped: false,
            complete: false,
        })
    }

    /// Rebuild a sweep from its durable record.
    ///
    /// The strategy is fast-forwarded past the trials already generated. Grid
    /// and seeded random strategies then continue the stream they would have
    /// produced. The bayesian strategy replays against final scores it had not
    /// seen when those trials were drawn, so its continuation can differ.
    pub fn from_record(record: SweepRecord) -> SwResult<Self> {
        let mut sweep = Self::from_config(record.config)?;

        if record.experiments.len() > sweep.config.n_trials {
            return Err(sw_types::validation_error!(
                "sweep {} holds {} trials, over its budget of {}",
                sweep.config.sweep_id,
                record.experiments.len(),
                sweep.config.n_trials
            ));
        }
        for (index, trial) in record.experiments.iter().enumerate() {
            if trial.id() != index || !trial.worker_invariant_holds() {
                return Err(sw_types::validation_error!(
                    "sweep {} has an inconsistent trial at position {index}",
                    sweep.config.sweep_id
                ));
            }
        }

        for generated in 0..record.experiments.len() {
            if sweep.strategy.next(&record.experiments[..generated]).is_none() {
                sweep.exhausted = true;
                break;
            }
        }
        sweep.exhausted |= sweep.strategy.is_exhausted();

        let mut experiments = record.experiments;
        // Launches in flight when the record was written never reported back.
        let interrupted = LaunchError::Unavailable {
            message: "launch interrupted by controller restart".to_string(),
        };
        for trial in experiments.iter_mut().filter(|t| t.stage() == Stage::NotStarted) {
            trial.fail_launch(&interrupted)?;
        }
        sweep.experiments = experiments;
        sweep.stopped = record.stopped;
        sweep.complete = record.stopped;
        sweep.refresh_completion();
        Ok(sweep)
    }

    pub fn record(&self) -> SweepRecord {
        SweepRecord {
            config: self.config.clone(),
            experiments: self.experiments.clone(),
            stopped: self.stopped,
        }
    }

    pub fn sweep_id(&self) -> &str {
        &self.config.sweep_id
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn experiments(&self) -> &[Trial] {
        &self.experiments
    }

    pub fn show(&self) -> bool {
        self.show
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Trials in `Pending` or `Running`.
    pub fn active_count(&self) -> usize {
        self.experiments
            .iter()
            .filter(|t| t.stage().holds_worker())
            .count()
    }

    pub fn trials_done(&self) -> usize {
        self.experiments.iter().filter(|t| t.is_terminal()).count()
    }

    fn budget_spent(&self) -> bool {
        self.experiments.len() >= self.config.n_trials
    }

    /// Free concurrency slots. Trials whose launch is still in flight
    /// (`NotStarted`) occupy a slot too.
    pub fn available_slots(&self) -> usize {
        if self.complete {
            return 0;
        }
        let in_flight = self.experiments.iter().filter(|t| !t.is_terminal()).count();
        self.config.simultaneous_trials.saturating_sub(in_flight)
    }

    /// Aggregate stage shown for the whole sweep.
    pub fn stage(&self) -> Stage {
        if self.stopped {
            Stage::Stopped
        } else if self.experiments.is_empty() {
            Stage::NotStarted
        } else if self.complete {
            if self
                .experiments
                .iter()
                .any(|t| t.stage() == Stage::Succeeded)
            {
                Stage::Succeeded
            } else {
                Stage::Failed
            }
        } else if self
            .experiments
            .iter()
            .all(|t| matches!(t.stage(), Stage::NotStarted | Stage::Pending))
        {
            Stage::Pending
        } else {
            Stage::Running
        }
    }

    /// Trial with the best objective so far.
    pub fn best_trial(&self) -> Option<&Trial> {
        let direction = self.config.direction;
        self.experiments
            .iter()
            .filter(|t| t.best_model_score().is_some())
            .reduce(|best, t| match (t.best_model_score(), best.best_model_score()) {
                (Some(candidate), Some(incumbent)) if direction.improves(candidate, incumbent) => t,
                _ => best,
            })
    }

    /// Worker component names, one per trial.
    pub fn component_names(&self) -> Vec<String> {
        self.experiments
            .iter()
            .map(|t| t.component_name(self.sweep_id()))
            .collect()
    }

    pub fn view(&self) -> SweepView {
        SweepView {
            sweep_id: self.config.sweep_id.clone(),
            stage: self.stage(),
            show: self.show,
            n_trials: self.config.n_trials,
            simultaneous_trials: self.config.simultaneous_trials,
            trials_done: self.trials_done(),
            framework: self.config.framework.clone(),
            cloud_compute: self.config.cloud_compute.clone(),
            objective: self.config.objective.clone(),
            direction: self.config.direction,
            logger: self.config.logger,
            logger_url: self.config.logger_url.clone(),
            best_trial: self.best_trial().map(Trial::id),
            trials: self.experiments.clone(),
        }
    }

    // -- reconciliation -----------------------------------------------------

    /// Workers to poll: `(trial id, worker)` for every `Pending`/`Running` trial.
    pub fn active_workers(&self) -> Vec<(usize, WorkerRef)> {
        self.experiments
            .iter()
            .filter_map(|t| t.worker_ref().map(|w| (t.id(), w.clone())))
            .collect()
    }

    /// Apply a poll result for `trial_id`.
    ///
    /// Reports for a trial that no longer holds `worker` (stopped, or already
    /// finished) are stale and ignored. Returns whether the stage changed.
    pub fn apply_report(
        &mut self,
        trial_id: usize,
        worker: &WorkerRef,
        report: &WorkerReport,
    ) -> Result<bool, StageError> {
        let Some(trial) = self.experiments.get_mut(trial_id) else {
            return Ok(false);
        };
        if trial.worker_ref() != Some(worker) {
            return Ok(false);
        }

        trial.record_metrics(&report.metrics, &self.config.objective, self.config.direction);

        let before = trial.stage();
        match report.status {
            WorkerStatus::Pending => {}
            WorkerStatus::Running => {
                if before == Stage::Pending {
                    trial.acknowledge()?;
                }
            }
            WorkerStatus::Succeeded => {
                if before == Stage::Pending {
                    trial.acknowledge()?;
                }
                trial.complete(true, None)?;
            }
            WorkerStatus::Failed => {
                let message = report
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("worker {worker} failed"));
                trial.complete(false, Some(message))?;
            }
        }
        Ok(trial.stage() != before)
    }

    /// Pull up to [`available_slots`](Self::available_slots) assignments from
    /// the strategy, append them as `NotStarted` trials and return their
    /// launch requests in emission order.
    pub fn plan_launches(&mut self) -> Vec<LaunchRequest> {
        let mut requests = Vec::new();
        if self.complete {
            return requests;
        }

        let mut slots = self.available_slots();
        while slots > 0 && !self.budget_spent() && !self.exhausted {
            let Some(hyperparameters) = self.strategy.next(&self.experiments) else {
                self.exhausted = true;
                break;
            };
            let trial = Trial::new(self.experiments.len(), hyperparameters);
            requests.push(self.launch_request(&trial));
            self.experiments.push(trial);
            slots -= 1;
        }
        if !self.exhausted && self.strategy.is_exhausted() {
            debug!(
                sweep = %self.config.sweep_id,
                strategy = self.strategy.name(),
                "search space exhausted"
            );
            self.exhausted = true;
        }
        requests
    }

    fn launch_request(&self, trial: &Trial) -> LaunchRequest {
        LaunchRequest {
            sweep_id: self.config.sweep_id.clone(),
            trial_id: trial.id(),
            hyperparameters: trial.hyperparameters().clone(),
            script_path: self.config.script_path.clone(),
            objective: self.config.objective.clone(),
            framework: self.config.framework.clone(),
            cloud_compute: self.config.cloud_compute.clone(),
        }
    }

    /// Feed back the result of launching `trial_id`.
    pub fn apply_launch(
        &mut self,
        trial_id: usize,
        result: Result<WorkerRef, LaunchError>,
    ) -> Result<LaunchOutcome, StageError> {
        let trial = match self.experiments.get_mut(trial_id) {
            Some(trial) if trial.stage() == Stage::NotStarted => trial,
            _ => {
                return Ok(match result {
                    Ok(worker) => LaunchOutcome::Orphaned(worker),
                    Err(_) => LaunchOutcome::Discarded,
                })
            }
        };

        match result {
            Ok(worker) => {
                trial.dispatch(worker)?;
                Ok(LaunchOutcome::Dispatched)
            }
            Err(error) => {
                trial.fail_launch(&error)?;
                Ok(LaunchOutcome::Failed)
            }
        }
    }

    /// Mark the sweep complete once every trial is terminal and nothing more
    /// will be generated. Returns the completion flag.
    pub fn refresh_completion(&mut self) -> bool {
        if !self.complete
            && self.experiments.iter().all(Trial::is_terminal)
            && (self.budget_spent() || self.exhausted)
        {
            debug!(
                sweep = %self.config.sweep_id,
                trials = self.experiments.len(),
                "sweep complete"
            );
            self.complete = true;
        }
        self.complete
    }

    /// Cancel every non-terminal trial and mark the sweep stopped.
    ///
    /// Returns the workers the caller must cancel. A sweep that is already
    /// complete is left untouched.
    pub fn stop(&mut self) -> Result<Vec<WorkerRef>, StageError> {
        if self.complete {
            return Ok(Vec::new());
        }

        let mut workers = Vec::new();
        for trial in self.experiments.iter_mut().filter(|t| !t.is_terminal()) {
            if let Some(worker) = trial.cancel()? {
                workers.push(worker);
            }
        }
        self.stopped = true;
        self.complete = true;
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ParameterValue, SearchSpace, StrategyKind};

    fn config(n_trials: usize, simultaneous: usize) -> SweepConfig {
        let space = SearchSpace::new()
            .add_log_uniform("model.lr", 0.001, 0.1)
            .add_categorical("data.batch_size", vec![serde_json::json!(32), serde_json::json!(64)]);
        SweepConfig::new("s1", "train.py", space)
            .with_budget(n_trials, simultaneous)
            .with_seed(11)
            .with_objective("val_loss", ObjectiveDirection::Minimize)
    }

    fn assert_invariants(sweep: &Sweep) {
        assert!(sweep.active_count() <= sweep.config().simultaneous_trials);
        assert!(sweep.experiments().len() <= sweep.config().n_trials);
        for trial in sweep.experiments() {
            assert!(trial.worker_invariant_holds(), "trial {} breaks worker invariant", trial.id());
        }
    }

    /// Launch every planned request successfully with worker `w<id>`.
    fn launch_all(sweep: &mut Sweep) -> Vec<usize> {
        let requests = sweep.plan_launches();
        let ids: Vec<usize> = requests.iter().map(|r| r.trial_id).collect();
        for id in &ids {
            let outcome = sweep.apply_launch(*id, Ok(WorkerRef::new(format!("w{id}")))).unwrap();
            assert_eq!(outcome, LaunchOutcome::Dispatched);
        }
        sweep.refresh_completion();
        assert_invariants(sweep);
        ids
    }

    fn finish(sweep: &mut Sweep, id: usize, loss: f64) {
        let report = WorkerReport::new(WorkerStatus::Succeeded).with_metric("val_loss", loss);
        assert!(sweep.apply_report(id, &WorkerRef::new(format!("w{id}")), &report).unwrap());
    }

    #[test]
    fn new_sweep_has_no_trials() {
        let sweep = Sweep::from_config(config(3, 2)).unwrap();
        assert!(sweep.experiments().is_empty());
        assert_eq!(sweep.stage(), Stage::NotStarted);
        assert!(sweep.show());
        assert!(!sweep.is_complete());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(Sweep::from_config(config(0, 1)).is_err());
    }

    #[test]
    fn budget_two_of_three_scenario() {
        let mut sweep = Sweep::from_config(config(3, 2)).unwrap();

        // Tick 1: A and B.
        assert_eq!(launch_all(&mut sweep), vec![0, 1]);
        assert_eq!(sweep.stage(), Stage::Pending);

        // Tick 2: nothing finished, nothing new.
        let running = WorkerReport::new(WorkerStatus::Running);
        sweep.apply_report(0, &WorkerRef::new("w0"), &running).unwrap();
        assert!(launch_all(&mut sweep).is_empty());
        assert_eq!(sweep.stage(), Stage::Running);

        // Tick 3: A done, C takes its slot.
        finish(&mut sweep, 0, 0.4);
        assert_eq!(launch_all(&mut sweep), vec![2]);
        assert!(!sweep.is_complete());

        // Budget spent: B and C finishing completes the sweep.
        finish(&mut sweep, 1, 0.2);
        finish(&mut sweep, 2, 0.3);
        assert!(launch_all(&mut sweep).is_empty());
        assert!(sweep.is_complete());
        assert_eq!(sweep.stage(), Stage::Succeeded);
        assert_eq!(sweep.trials_done(), 3);
        assert_eq!(sweep.best_trial().map(Trial::id), Some(1));
        assert_eq!(sweep.available_slots(), 0);
    }

    #[test]
    fn failed_launch_frees_the_slot() {
        let mut sweep = Sweep::from_config(config(3, 1)).unwrap();
        let requests = sweep.plan_launches();
        assert_eq!(requests.len(), 1);

        let outcome = sweep
            .apply_launch(
                0,
                Err(LaunchError::Unavailable {
                    message: "cluster down".into(),
                }),
            )
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::Failed);
        assert_eq!(sweep.experiments()[0].stage(), Stage::Failed);
        assert!(sweep.experiments()[0].exception().unwrap().contains("cluster down"));

        assert_eq!(launch_all(&mut sweep), vec![1]);
    }

    #[test]
    fn worker_failure_keeps_message() {
        let mut sweep = Sweep::from_config(config(1, 1)).unwrap();
        launch_all(&mut sweep);
        let report = WorkerReport::new(WorkerStatus::Failed).with_message("exit code 1");
        assert!(sweep.apply_report(0, &WorkerRef::new("w0"), &report).unwrap());
        assert_eq!(sweep.experiments()[0].exception(), Some("exit code 1"));
        assert!(sweep.refresh_completion());
        assert_eq!(sweep.stage(), Stage::Failed);
    }

    #[test]
    fn success_reported_while_pending_acks_first() {
        let mut sweep = Sweep::from_config(config(1, 1)).unwrap();
        launch_all(&mut sweep);
        finish(&mut sweep, 0, 0.1);
        let trial = &sweep.experiments()[0];
        assert_eq!(trial.stage(), Stage::Succeeded);
        assert!(trial.started_at.is_some());
        assert_eq!(trial.best_model_score(), Some(0.1));
    }

    #[test]
    fn stale_reports_are_ignored() {
        let mut sweep = Sweep::from_config(config(2, 2)).unwrap();
        launch_all(&mut sweep);
        let done = WorkerReport::new(WorkerStatus::Succeeded);

        assert!(!sweep.apply_report(0, &WorkerRef::new("someone-else"), &done).unwrap());
        assert!(!sweep.apply_report(9, &WorkerRef::new("w9"), &done).unwrap());

        sweep.stop().unwrap();
        assert!(!sweep.apply_report(1, &WorkerRef::new("w1"), &done).unwrap());
        assert_eq!(sweep.experiments()[1].stage(), Stage::Stopped);
    }

    #[test]
    fn stop_cancels_in_flight_trials_once() {
        let mut sweep = Sweep::from_config(config(4, 2)).unwrap();
        launch_all(&mut sweep);

        let workers = sweep.stop().unwrap();
        assert_eq!(workers, vec![WorkerRef::new("w0"), WorkerRef::new("w1")]);
        assert!(sweep.is_complete());
        assert_eq!(sweep.stage(), Stage::Stopped);
        assert_invariants(&sweep);

        assert!(sweep.stop().unwrap().is_empty());
        assert!(sweep.plan_launches().is_empty());
    }

    #[test]
    fn stop_during_launch_orphans_the_worker() {
        let mut sweep = Sweep::from_config(config(2, 2)).unwrap();
        let requests = sweep.plan_launches();
        assert_eq!(requests.len(), 2);

        // Stop lands between plan and apply.
        assert!(sweep.stop().unwrap().is_empty());

        let outcome = sweep.apply_launch(0, Ok(WorkerRef::new("late"))).unwrap();
        assert_eq!(outcome, LaunchOutcome::Orphaned(WorkerRef::new("late")));
        let outcome = sweep
            .apply_launch(1, Err(LaunchError::Rejected { reason: "x".into() }))
            .unwrap();
        assert_eq!(outcome, LaunchOutcome::Discarded);
        assert!(sweep.experiments().iter().all(|t| t.stage() == Stage::Stopped));
    }

    #[test]
    fn grid_exhaustion_completes_before_budget() {
        let space = SearchSpace::new().add_int("layers", 1, 2);
        let config = SweepConfig::new("g", "train.py", space)
            .with_budget(10, 5)
            .with_strategy(StrategyKind::Grid { float_steps: 2 });
        let mut sweep = Sweep::from_config(config).unwrap();

        assert_eq!(launch_all(&mut sweep), vec![0, 1]);
        finish(&mut sweep, 0, 1.0);
        finish(&mut sweep, 1, 2.0);
        assert!(launch_all(&mut sweep).is_empty());
        assert!(sweep.is_complete());
        assert_eq!(sweep.experiments().len(), 2);
    }

    #[test]
    fn restored_sweep_continues_the_seeded_stream() {
        let mut uninterrupted = Sweep::from_config(config(4, 2)).unwrap();
        launch_all(&mut uninterrupted);
        finish(&mut uninterrupted, 0, 0.5);
        finish(&mut uninterrupted, 1, 0.6);
        launch_all(&mut uninterrupted);

        let mut original = Sweep::from_config(config(4, 2)).unwrap();
        launch_all(&mut original);
        finish(&mut original, 0, 0.5);
        finish(&mut original, 1, 0.6);
        let mut restored = Sweep::from_record(original.record()).unwrap();
        launch_all(&mut restored);

        let params = |s: &Sweep| -> Vec<_> {
            s.experiments().iter().map(|t| t.hyperparameters().clone()).collect()
        };
        assert_eq!(params(&restored), params(&uninterrupted));
    }

    #[test]
    fn restored_grid_resumes_at_its_cursor() {
        let space = SearchSpace::new().add_int("seed", 0, 2_000_000_000);
        let config = SweepConfig::new("g", "train.py", space)
            .with_budget(4, 2)
            .with_strategy(StrategyKind::Grid { float_steps: 2 });
        let mut original = Sweep::from_config(config).unwrap();
        launch_all(&mut original);
        finish(&mut original, 0, 1.0);
        finish(&mut original, 1, 2.0);

        let mut restored = Sweep::from_record(original.record()).unwrap();
        assert_eq!(launch_all(&mut restored), vec![2, 3]);
        let seeds: Vec<ParameterValue> = restored
            .experiments()
            .iter()
            .map(|t| t.hyperparameters()["seed"].clone())
            .collect();
        assert_eq!(seeds, (0..4).map(ParameterValue::Int).collect::<Vec<_>>());
    }

    #[test]
    fn restore_rejects_inconsistent_records() {
        let mut sweep = Sweep::from_config(config(2, 2)).unwrap();
        launch_all(&mut sweep);
        let mut record = sweep.record();
        record.config.n_trials = 1;
        assert!(Sweep::from_record(record).is_err());
    }

    #[test]
    fn restore_fails_interrupted_launches() {
        let mut sweep = Sweep::from_config(config(3, 2)).unwrap();
        assert_eq!(sweep.plan_launches().len(), 2);
        sweep.apply_launch(0, Ok(WorkerRef::new("w0"))).unwrap();

        let mut restored = Sweep::from_record(sweep.record()).unwrap();
        assert_eq!(restored.experiments()[0].stage(), Stage::Pending);
        assert_eq!(restored.experiments()[1].stage(), Stage::Failed);
        assert!(restored.experiments()[1].exception().unwrap().contains("restart"));
        assert_eq!(restored.plan_launches().len(), 1);
    }

    #[test]
    fn restored_stopped_sweep_stays_complete() {
        let mut sweep = Sweep::from_config(config(3, 1)).unwrap();
        launch_all(&mut sweep);
        sweep.stop().unwrap();
        let restored = Sweep::from_record(sweep.record()).unwrap();
        assert!(restored.is_complete());
        assert_eq!(restored.stage(), Stage::Stopped);
    }

    #[test]
    fn view_is_a_copy() {
        let mut sweep = Sweep::from_config(config(2, 1)).unwrap();
        launch_all(&mut sweep);
        let view = sweep.view();
        finish(&mut sweep, 0, 0.1);
        assert_eq!(view.trials[0].stage(), Stage::Pending);
        assert_eq!(view.trials_done, 0);
        assert_eq!(sweep.view().trials_done, 1);
        assert_eq!(sweep.component_names(), vec!["s1.0".to_string()]);
    }
}
