//! Queue tasks emitted by commits.
//!
//! Category and type codes are protocol-stable: they are persisted and
//! exchanged across clusters, and must never be renumbered.

use serde::{Deserialize, Serialize};

use crate::core::{EventId, RunId, Version, WorkflowKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Transfer,
    Timer,
    Replication,
}

impl TaskCategory {
    pub fn code(self) -> i32 {
        match self {
            TaskCategory::Transfer => 2,
            TaskCategory::Timer => 3,
            TaskCategory::Replication => 4,
        }
    }
}

/// Persisted task type codes, 0..17. Frozen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TransferDecisionTask,
    TransferActivityTask,
    TransferCloseExecution,
    TransferCancelExecution,
    TransferStartChildExecution,
    TransferSignalExecution,
    TransferRecordWorkflowStarted,
    TransferResetWorkflow,
    TransferUpsertWorkflowSearchAttributes,
    TimerDecisionTimeout,
    TimerActivityTimeout,
    TimerUserTimer,
    TimerWorkflowRunTimeout,
    TimerDeleteHistoryEvent,
    TimerActivityRetry,
    TimerWorkflowBackoff,
    ReplicationHistory,
    ReplicationSyncActivity,
}

impl TaskType {
    pub fn code(self) -> i32 {
        match self {
            TaskType::TransferDecisionTask => 0,
            TaskType::TransferActivityTask => 1,
            TaskType::TransferCloseExecution => 2,
            TaskType::TransferCancelExecution => 3,
            TaskType::TransferStartChildExecution => 4,
            TaskType::TransferSignalExecution => 5,
            TaskType::TransferRecordWorkflowStarted => 6,
            TaskType::TransferResetWorkflow => 7,
            TaskType::TransferUpsertWorkflowSearchAttributes => 8,
            TaskType::TimerDecisionTimeout => 9,
            TaskType::TimerActivityTimeout => 10,
            TaskType::TimerUserTimer => 11,
            TaskType::TimerWorkflowRunTimeout => 12,
            TaskType::TimerDeleteHistoryEvent => 13,
            TaskType::TimerActivityRetry => 14,
            TaskType::TimerWorkflowBackoff => 15,
            TaskType::ReplicationHistory => 16,
            TaskType::ReplicationSyncActivity => 17,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransferTask {
    DecisionTask {
        tasklist: String,
        schedule_id: EventId,
    },
    CloseExecution,
    RecordWorkflowStarted,
}

impl TransferTask {
    pub fn task_type(&self) -> TaskType {
        match self {
            TransferTask::DecisionTask { .. } => TaskType::TransferDecisionTask,
            TransferTask::CloseExecution => TaskType::TransferCloseExecution,
            TransferTask::RecordWorkflowStarted => TaskType::TransferRecordWorkflowStarted,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TimerTask {
    WorkflowRunTimeout { fire_at_ms: u64 },
    DecisionTimeout { fire_at_ms: u64, schedule_id: EventId },
    DeleteHistoryEvent { fire_at_ms: u64 },
}

impl TimerTask {
    pub fn task_type(&self) -> TaskType {
        match self {
            TimerTask::WorkflowRunTimeout { .. } => TaskType::TimerWorkflowRunTimeout,
            TimerTask::DecisionTimeout { .. } => TaskType::TimerDecisionTimeout,
            TimerTask::DeleteHistoryEvent { .. } => TaskType::TimerDeleteHistoryEvent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReplicationTask {
    History {
        first_event_id: EventId,
        next_event_id: EventId,
        version: Version,
        new_run_id: Option<RunId>,
    },
    SyncActivity {
        schedule_id: EventId,
        version: Version,
    },
}

impl ReplicationTask {
    pub fn task_type(&self) -> TaskType {
        match self {
            ReplicationTask::History { .. } => TaskType::ReplicationHistory,
            ReplicationTask::SyncActivity { .. } => TaskType::ReplicationSyncActivity,
        }
    }
}

/// A replication task as stored on a shard's replication queue, addressed by
/// a strictly increasing task id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTaskEntry {
    pub task_id: i64,
    pub workflow: WorkflowKey,
    pub task: ReplicationTask,
    pub created_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_codes_are_frozen() {
        assert_eq!(TaskCategory::Transfer.code(), 2);
        assert_eq!(TaskCategory::Timer.code(), 3);
        assert_eq!(TaskCategory::Replication.code(), 4);
    }

    #[test]
    fn task_type_codes_are_frozen() {
        assert_eq!(TaskType::TransferDecisionTask.code(), 0);
        assert_eq!(TaskType::TimerDecisionTimeout.code(), 9);
        assert_eq!(TaskType::ReplicationHistory.code(), 16);
        assert_eq!(TaskType::ReplicationSyncActivity.code(), 17);
    }
}
