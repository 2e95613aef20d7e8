//! # sw-optimizer
//!
//! Hyperparameter search and sweep bookkeeping for Sweeper.
//!
//! Provides search space definitions, generation strategies (grid, random,
//! Bayesian), the per-trial lifecycle record, worker launch descriptors, and
//! the [`Sweep`] aggregate whose synchronous reconciliation steps the
//! controller drives.

mod launch;
mod search;
mod sweep;
mod trial;

pub use launch::{LaunchRequest, WorkerRef, WorkerReport, WorkerStatus};
pub use search::{
    BayesianSearch, GridSearch, Hyperparameters, ParameterDef, ParameterKind, ParameterValue,
    RandomSearch, SearchSpace, SearchStrategy, StrategyKind,
};
pub use sweep::{LaunchOutcome, Sweep, SweepRecord, SweepView};
pub use trial::{LoggerKind, ObjectiveDirection, SweepConfig, Trial};
