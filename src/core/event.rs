//! History events and the scalar stamps they carry.
//!
//! EventId: position on a run's event log, starting at 1.
//! Version: failover version stamped by the authoring cluster.
//! TaskId: replication task id, the same-version tie-breaker.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{CoreError, EventBatchError};
use super::ids::RunId;

/// Position of an event on its run's log. The first event of every run is 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(i64);

impl EventId {
    pub const FIRST: EventId = EventId(1);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn next(self) -> EventId {
        EventId(self.0 + 1)
    }

    pub fn prev(self) -> Option<EventId> {
        if self.0 > 1 { Some(EventId(self.0 - 1)) } else { None }
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failover version. Monotone per workflow; the authoring cluster stamps it
/// on every event it writes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication task id. Strictly increasing per source shard; used to order
/// duplicate deliveries that tie on version.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    pub fn get(self) -> i64 {
        self.0
    }
}

/// Event types the replicator dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionTimedOut,
    WorkflowExecutionTerminated,
    WorkflowExecutionCanceled,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionSignaled,
    DecisionTaskScheduled,
    DecisionTaskStarted,
    DecisionTaskCompleted,
    DecisionTaskFailed,
    DecisionTaskTimedOut,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    TimerStarted,
    TimerFired,
}

impl EventType {
    /// Terminal events close the run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventType::WorkflowExecutionCompleted
                | EventType::WorkflowExecutionFailed
                | EventType::WorkflowExecutionTimedOut
                | EventType::WorkflowExecutionTerminated
                | EventType::WorkflowExecutionCanceled
                | EventType::WorkflowExecutionContinuedAsNew
        )
    }
}

/// Per-type payloads the replicator inspects. Types it merely forwards use
/// `Common`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventAttributes {
    Started(StartedAttributes),
    Signaled(SignaledAttributes),
    DecisionScheduled(DecisionScheduledAttributes),
    DecisionFailed(DecisionFailedAttributes),
    Terminated(TerminatedAttributes),
    ContinuedAsNew(ContinuedAsNewAttributes),
    Common,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StartedAttributes {
    pub workflow_type: String,
    pub tasklist: String,
    pub execution_timeout_secs: u32,
    pub task_timeout_secs: u32,
    pub create_request_id: String,
    pub parent_workflow_id: Option<String>,
    pub parent_run_id: Option<RunId>,
    pub cron_schedule: Option<String>,
    pub attempt: u32,
    pub input: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignaledAttributes {
    pub signal_name: String,
    pub input: Option<Value>,
    pub identity: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionScheduledAttributes {
    pub tasklist: String,
    pub start_to_close_timeout_secs: u32,
    pub attempt: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionFailedAttributes {
    pub scheduled_event_id: EventId,
    pub started_event_id: EventId,
    pub cause: DecisionFailCause,
    pub identity: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionFailCause {
    UnhandledDecision,
    FailoverCloseDecision,
    ResetWorkflow,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TerminatedAttributes {
    pub reason: String,
    pub details: Option<Value>,
    pub identity: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContinuedAsNewAttributes {
    pub new_run_id: RunId,
}

/// One replicated history event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: EventId,
    pub version: Version,
    pub task_id: TaskId,
    pub timestamp_ms: u64,
    pub event_type: EventType,
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn is_signal(&self) -> bool {
        self.event_type == EventType::WorkflowExecutionSignaled
    }
}

/// A contiguous slice of a run's event log, as shipped by one replication
/// request. Construction validates contiguity so downstream code can rely
/// on `first`/`last` arithmetic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryBatch {
    events: Vec<HistoryEvent>,
}

impl HistoryBatch {
    pub fn new(events: Vec<HistoryEvent>) -> Result<Self, CoreError> {
        let Some(first) = events.first() else {
            return Err(EventBatchError::Empty.into());
        };
        let mut expected = first.event_id;
        for event in &events {
            if event.event_id != expected {
                return Err(EventBatchError::NonContiguous {
                    expected,
                    got: event.event_id,
                }
                .into());
            }
            expected = expected.next();
        }
        Ok(Self { events })
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<HistoryEvent> {
        self.events
    }

    pub fn first(&self) -> &HistoryEvent {
        self.events.first().expect("batch is non-empty")
    }

    pub fn last(&self) -> &HistoryEvent {
        self.events.last().expect("batch is non-empty")
    }

    pub fn first_event_id(&self) -> EventId {
        self.first().event_id
    }

    /// One past the last event id in the batch.
    pub fn next_event_id(&self) -> EventId {
        self.last().event_id.next()
    }

    pub fn has_signals(&self) -> bool {
        self.events.iter().any(HistoryEvent::is_signal)
    }

    pub fn signals(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.events.iter().filter(|event| event.is_signal())
    }

    pub fn starts_workflow(&self) -> bool {
        self.first().event_type == EventType::WorkflowExecutionStarted
            && self.first().event_id == EventId::FIRST
    }
}
