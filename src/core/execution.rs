//! Execution info: the persisted control row of one run.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::StateTransitionError;
use super::event::{EventId, TaskId, Version};
use super::ids::{RunId, WorkflowId};

/// Lifecycle state of a run. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Running,
    Completed,
}

impl WorkflowState {
    pub fn is_running(self) -> bool {
        matches!(self, WorkflowState::Created | WorkflowState::Running)
    }

    /// Validate a transition. Created -> Running -> Completed, no regression;
    /// Completed is absorbing and re-entry is rejected.
    pub fn transition(self, to: WorkflowState) -> Result<WorkflowState, StateTransitionError> {
        let allowed = match (self, to) {
            (WorkflowState::Created, WorkflowState::Created) => true,
            (WorkflowState::Created, WorkflowState::Running) => true,
            (WorkflowState::Created, WorkflowState::Completed) => true,
            (WorkflowState::Running, WorkflowState::Running) => true,
            (WorkflowState::Running, WorkflowState::Completed) => true,
            _ => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(StateTransitionError { from: self, to })
        }
    }
}

/// Close status of a completed run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Running,
    Completed,
    Failed,
    TimedOut,
    Terminated,
    Canceled,
    ContinuedAsNew,
}

/// In-flight decision task bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub version: Version,
    pub schedule_id: EventId,
    pub started_id: Option<EventId>,
    pub tasklist: String,
    pub start_to_close_timeout_secs: u32,
    pub attempt: u32,
}

/// Parent linkage for child workflows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParentExecution {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub initiated_event_id: EventId,
}

/// Live activity bookkeeping synchronized by `SyncActivity`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub version: Version,
    pub schedule_id: EventId,
    pub scheduled_time_ms: u64,
    pub started_id: Option<EventId>,
    pub started_time_ms: Option<u64>,
    pub last_heartbeat_ms: Option<u64>,
    pub details: Option<serde_json::Value>,
    pub attempt: u32,
    pub last_failure: Option<String>,
    pub last_worker_identity: Option<String>,
}

/// The control row of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub run_id: RunId,
    pub workflow_type: String,
    pub tasklist: String,
    pub state: WorkflowState,
    pub status: WorkflowStatus,
    pub next_event_id: EventId,
    pub last_event_task_id: TaskId,
    pub branch_token: Bytes,
    pub decision: Option<DecisionInfo>,
    pub parent: Option<ParentExecution>,
    pub execution_timeout_secs: u32,
    pub task_timeout_secs: u32,
    pub cron_schedule: Option<String>,
    pub attempt: u32,
    pub create_request_id: String,
}

impl ExecutionInfo {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            workflow_type: String::new(),
            tasklist: String::new(),
            state: WorkflowState::Created,
            status: WorkflowStatus::Running,
            next_event_id: EventId::FIRST,
            last_event_task_id: TaskId(0),
            branch_token: Bytes::new(),
            decision: None,
            parent: None,
            execution_timeout_secs: 0,
            task_timeout_secs: 0,
            cron_schedule: None,
            attempt: 0,
            create_request_id: String::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn set_state(&mut self, to: WorkflowState) -> Result<(), StateTransitionError> {
        self.state = self.state.transition(to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_never_regresses() {
        assert!(
            WorkflowState::Completed
                .transition(WorkflowState::Running)
                .is_err()
        );
        assert!(
            WorkflowState::Running
                .transition(WorkflowState::Created)
                .is_err()
        );
        assert!(
            WorkflowState::Completed
                .transition(WorkflowState::Completed)
                .is_err()
        );
    }

    #[test]
    fn forward_transitions_allowed() {
        let state = WorkflowState::Created;
        let state = state.transition(WorkflowState::Running).unwrap();
        let state = state.transition(WorkflowState::Completed).unwrap();
        assert_eq!(state, WorkflowState::Completed);
    }

    #[test]
    fn created_and_running_count_as_running() {
        assert!(WorkflowState::Created.is_running());
        assert!(WorkflowState::Running.is_running());
        assert!(!WorkflowState::Completed.is_running());
    }
}
