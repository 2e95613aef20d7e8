//! Trial lifecycle state machine.
//!
//! `NotStarted -> Pending -> Running -> {Succeeded | Failed | Stopped}`. Any
//! non-terminal stage can be cancelled into `Stopped`. The transition function
//! is pure: starting or stopping the actual worker is the caller's job.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::StageError;

/// Position of a trial in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Created from a strategy assignment, no launch requested yet.
    #[default]
    NotStarted,
    /// Launch accepted, waiting for the worker to acknowledge.
    Pending,
    /// Worker acknowledged and is executing the trial.
    Running,
    Succeeded,
    Failed,
    /// Cancelled before reaching a natural end.
    Stopped,
}

impl Stage {
    /// No transition out of a terminal stage is legal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }

    /// Stages during which a worker handle exists.
    pub fn holds_worker(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Apply `event` to this stage.
    ///
    /// `Complete { success: false }` is accepted from `Pending` as well as
    /// `Running`: a worker can die before acknowledging, and a failed launch
    /// is recorded as dispatch followed by an unsuccessful completion.
    pub fn transition(self, event: StageEvent) -> Result<Stage, StageError> {
        let next = match (self, event) {
            (from, _) if from.is_terminal() => None,
            (_, StageEvent::Cancel) => Some(Self::Stopped),
            (Self::NotStarted, StageEvent::Dispatch) => Some(Self::Pending),
            (Self::Pending, StageEvent::WorkerAck) => Some(Self::Running),
            (Self::Pending, StageEvent::Complete { success: false }) => Some(Self::Failed),
            (Self::Running, StageEvent::Complete { success }) => Some(if success {
                Self::Succeeded
            } else {
                Self::Failed
            }),
            _ => None,
        };

        next.ok_or(StageError::IllegalTransition { from: self, event })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Edges of the stage machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    /// `NotStarted -> Pending`
    Dispatch,
    /// `Pending -> Running`
    WorkerAck,
    /// `Running -> Succeeded | Failed`
    Complete { success: bool },
    /// any non-terminal stage `-> Stopped`
    Cancel,
}

impl fmt::Display for StageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch => f.write_str("dispatch"),
            Self::WorkerAck => f.write_str("worker_ack"),
            Self::Complete { success } => write!(f, "complete(success={success})"),
            Self::Cancel => f.write_str("cancel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STAGES: [Stage; 6] = [
        Stage::NotStarted,
        Stage::Pending,
        Stage::Running,
        Stage::Succeeded,
        Stage::Failed,
        Stage::Stopped,
    ];

    const ALL_EVENTS: [StageEvent; 5] = [
        StageEvent::Dispatch,
        StageEvent::WorkerAck,
        StageEvent::Complete { success: true },
        StageEvent::Complete { success: false },
        StageEvent::Cancel,
    ];

    #[test]
    fn happy_path() {
        let stage = Stage::NotStarted
            .transition(StageEvent::Dispatch)
            .and_then(|s| s.transition(StageEvent::WorkerAck))
            .and_then(|s| s.transition(StageEvent::Complete { success: true }))
            .unwrap();
        assert_eq!(stage, Stage::Succeeded);

        let failed = Stage::Running
            .transition(StageEvent::Complete { success: false })
            .unwrap();
        assert_eq!(failed, Stage::Failed);
    }

    #[test]
    fn terminal_stages_reject_every_event() {
        for stage in ALL_STAGES.iter().filter(|s| s.is_terminal()) {
            for event in ALL_EVENTS {
                let err = stage.transition(event).unwrap_err();
                assert!(matches!(
                    err,
                    StageError::IllegalTransition { from, .. } if from == *stage
                ));
            }
        }
    }

    #[test]
    fn cancel_from_any_non_terminal_stage() {
        for stage in ALL_STAGES.iter().filter(|s| !s.is_terminal()) {
            assert_eq!(stage.transition(StageEvent::Cancel).unwrap(), Stage::Stopped);
        }
    }

    #[test]
    fn edges_out_of_order_are_illegal() {
        assert!(Stage::NotStarted.transition(StageEvent::WorkerAck).is_err());
        assert!(Stage::NotStarted
            .transition(StageEvent::Complete { success: true })
            .is_err());
        assert!(Stage::Pending.transition(StageEvent::Dispatch).is_err());
        assert!(Stage::Pending
            .transition(StageEvent::Complete { success: true })
            .is_err());
        assert!(Stage::Running.transition(StageEvent::Dispatch).is_err());
        assert!(Stage::Running.transition(StageEvent::WorkerAck).is_err());
    }

    #[test]
    fn pending_can_fail_directly() {
        assert_eq!(
            Stage::Pending
                .transition(StageEvent::Complete { success: false })
                .unwrap(),
            Stage::Failed
        );
    }

    #[test]
    fn worker_holding_stages() {
        let holding: Vec<Stage> = ALL_STAGES.into_iter().filter(Stage::holds_worker).collect();
        assert_eq!(holding, vec![Stage::Pending, Stage::Running]);
    }

    #[test]
    fn stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::NotStarted).unwrap();
        assert_eq!(json, "\"not_started\"");
        assert_eq!(Stage::Running.to_string(), "running");
    }
}
