//! Per-run mutable state.
//!
//! One struct carries the three capability groups the replicator needs:
//! queries (pure reads), mutators (version bumps and event addition), and
//! the commit operation producing a persistence snapshot. All event
//! addition funnels through one internal append so the log invariants hold
//! by construction.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{
    ActivityInfo, DecisionFailCause, DecisionFailedAttributes, DecisionInfo,
    DecisionScheduledAttributes, EventAttributes, EventId, EventType, ExecutionInfo,
    HistoryEvent, NamespaceId, ReplicationState, RunId, SignaledAttributes,
    StateTransitionError, TaskId, TerminatedAttributes, Version, VersionHistories, VersionHistory,
    VersionHistoryError, VersionHistoryItem, WorkflowId, WorkflowKey, WorkflowState,
    WorkflowStatus,
};
use crate::persistence::{
    ReplicationTask, StoredExecution, TimerTask, TransferTask, WorkflowSnapshot,
};

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionPolicy {
    /// This cluster owns the run: schedule user-visible work and emit
    /// replication tasks for the new events.
    Active,
    /// Recording replicated events: no replication tasks are emitted.
    Passive,
}

/// New events of one transaction, addressed to their branch.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowEvents {
    pub branch_token: Bytes,
    pub events: Vec<HistoryEvent>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MutableStateError {
    #[error("decision task already pending")]
    DecisionAlreadyPending,
    #[error("no in-flight decision to fail")]
    NoInFlightDecision,
    #[error("workflow is not running")]
    WorkflowClosed,
    #[error("event id {got} does not match next event id {expected}")]
    EventIdMismatch { expected: EventId, got: EventId },
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),
    #[error(transparent)]
    VersionHistory(#[from] VersionHistoryError),
}

#[derive(Clone, Debug)]
pub struct MutableState {
    key: WorkflowKey,
    execution_info: ExecutionInfo,
    replication_state: ReplicationState,
    version_histories: VersionHistories,
    activities: BTreeMap<EventId, ActivityInfo>,
    buffered_events: Vec<HistoryEvent>,
    retention_days: u32,

    // Transaction scratch, drained by close_transaction_as_snapshot.
    pending_events: Vec<HistoryEvent>,
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
    closed_this_transaction: bool,
    continued_as_new_run: Option<RunId>,
    update_condition: i64,
}

impl MutableState {
    /// Fresh state for a run about to receive its start event.
    pub fn new(
        namespace_id: NamespaceId,
        workflow_id: WorkflowId,
        run_id: RunId,
        start_version: Version,
        retention_days: u32,
    ) -> Self {
        let mut execution_info = ExecutionInfo::new(run_id);
        execution_info.branch_token = Bytes::from(format!("branch:{run_id}"));
        let branch_token = execution_info.branch_token.clone();
        Self {
            key: WorkflowKey::new(namespace_id, workflow_id, run_id),
            execution_info,
            replication_state: ReplicationState::new(start_version),
            version_histories: VersionHistories::new(VersionHistory::new(
                branch_token,
                Vec::new(),
            )),
            activities: BTreeMap::new(),
            buffered_events: Vec::new(),
            retention_days,
            pending_events: Vec::new(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            closed_this_transaction: false,
            continued_as_new_run: None,
            update_condition: EventId::FIRST.get(),
        }
    }

    pub fn from_stored(
        namespace_id: NamespaceId,
        workflow_id: WorkflowId,
        stored: StoredExecution,
        retention_days: u32,
    ) -> Self {
        let run_id = stored.snapshot.execution_info.run_id;
        let branch_token = stored.snapshot.execution_info.branch_token.clone();
        let version_histories = stored
            .snapshot
            .version_histories
            .unwrap_or_else(|| {
                VersionHistories::new(VersionHistory::new(branch_token, Vec::new()))
            });
        Self {
            key: WorkflowKey::new(namespace_id, workflow_id, run_id),
            execution_info: stored.snapshot.execution_info,
            replication_state: stored.snapshot.replication_state,
            version_histories,
            activities: stored.snapshot.activities,
            buffered_events: stored.snapshot.buffered_events,
            retention_days,
            pending_events: Vec::new(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            closed_this_transaction: false,
            continued_as_new_run: None,
            update_condition: stored.update_condition,
        }
    }

    // --- queries ---

    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    pub fn run_id(&self) -> RunId {
        self.execution_info.run_id
    }

    pub fn execution_info(&self) -> &ExecutionInfo {
        &self.execution_info
    }

    pub fn replication_state(&self) -> &ReplicationState {
        &self.replication_state
    }

    pub fn version_histories(&self) -> &VersionHistories {
        &self.version_histories
    }

    pub fn next_event_id(&self) -> EventId {
        self.execution_info.next_event_id
    }

    pub fn last_write_version(&self) -> Version {
        self.replication_state.last_write_version
    }

    pub fn is_running(&self) -> bool {
        self.execution_info.is_running()
    }

    pub fn has_pending_decision(&self) -> bool {
        self.execution_info.decision.is_some()
    }

    /// The decision currently being worked, if a worker has started it.
    pub fn in_flight_decision(&self) -> Option<&DecisionInfo> {
        self.execution_info
            .decision
            .as_ref()
            .filter(|decision| decision.started_id.is_some())
    }

    pub fn has_buffered_events(&self) -> bool {
        !self.buffered_events.is_empty()
    }

    pub fn update_condition(&self) -> i64 {
        self.update_condition
    }

    pub fn set_update_condition(&mut self, condition: i64) {
        self.update_condition = condition;
    }

    pub fn current_branch_token(&self) -> &Bytes {
        &self.execution_info.branch_token
    }

    pub fn activity(&self, schedule_id: EventId) -> Option<&ActivityInfo> {
        self.activities.get(&schedule_id)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending_events.is_empty() || self.closed_this_transaction
    }

    /// Set while the closing continued-as-new event is in this transaction.
    pub fn continued_as_new_run_id(&self) -> Option<RunId> {
        self.continued_as_new_run
    }

    /// Overwrite the per-cluster watermark map. The conflict resolver uses
    /// this to carry peer confirmations across a history replay.
    pub(super) fn replace_replication_info(
        &mut self,
        info: std::collections::BTreeMap<crate::core::ClusterName, crate::core::ReplicationInfo>,
    ) {
        self.replication_state.last_replication_info = info;
    }

    /// Drop the open transaction without committing. Used after a replay
    /// whose events already live in the history store.
    pub(super) fn discard_pending_transaction(&mut self) {
        self.pending_events.clear();
        self.transfer_tasks.clear();
        self.timer_tasks.clear();
        self.closed_this_transaction = false;
        self.continued_as_new_run = None;
    }

    // --- mutators ---

    /// Bump the working version. Without `force`, the version only moves
    /// upward.
    pub fn update_current_version(&mut self, version: Version, force: bool) {
        if force || version > self.replication_state.current_version {
            self.replication_state.current_version = version;
        }
    }

    /// Hold an event that arrived while a decision is in flight; it flushes
    /// when that decision completes or fails.
    pub fn buffer_event(&mut self, event: HistoryEvent) {
        self.buffered_events.push(event);
    }

    pub fn add_workflow_execution_signaled(
        &mut self,
        signal_name: String,
        input: Option<serde_json::Value>,
        identity: String,
    ) -> Result<EventId, MutableStateError> {
        if !self.is_running() {
            return Err(MutableStateError::WorkflowClosed);
        }
        self.append_own_event(
            EventType::WorkflowExecutionSignaled,
            EventAttributes::Signaled(SignaledAttributes {
                signal_name,
                input,
                identity,
            }),
        )
    }

    pub fn add_decision_task_scheduled(
        &mut self,
        bypass_task_generation: bool,
    ) -> Result<DecisionInfo, MutableStateError> {
        if !self.is_running() {
            return Err(MutableStateError::WorkflowClosed);
        }
        if self.has_pending_decision() {
            return Err(MutableStateError::DecisionAlreadyPending);
        }
        let tasklist = self.execution_info.tasklist.clone();
        let timeout = self.execution_info.task_timeout_secs;
        let event_id = self.append_own_event(
            EventType::DecisionTaskScheduled,
            EventAttributes::DecisionScheduled(DecisionScheduledAttributes {
                tasklist: tasklist.clone(),
                start_to_close_timeout_secs: timeout,
                attempt: 0,
            }),
        )?;
        let decision = DecisionInfo {
            version: self.replication_state.current_version,
            schedule_id: event_id,
            started_id: None,
            tasklist: tasklist.clone(),
            start_to_close_timeout_secs: timeout,
            attempt: 0,
        };
        self.execution_info.decision = Some(decision.clone());
        self.execution_info.set_state(WorkflowState::Running)?;
        if !bypass_task_generation {
            self.transfer_tasks.push(TransferTask::DecisionTask {
                tasklist,
                schedule_id: event_id,
            });
        }
        Ok(decision)
    }

    /// Fail the in-flight decision and flush buffered events onto the log
    /// behind the failure event.
    pub fn add_decision_task_failed(
        &mut self,
        cause: DecisionFailCause,
        identity: String,
    ) -> Result<EventId, MutableStateError> {
        let decision = self
            .in_flight_decision()
            .cloned()
            .ok_or(MutableStateError::NoInFlightDecision)?;
        let event_id = self.append_own_event(
            EventType::DecisionTaskFailed,
            EventAttributes::DecisionFailed(DecisionFailedAttributes {
                scheduled_event_id: decision.schedule_id,
                started_event_id: decision.started_id.expect("in-flight decision has start"),
                cause,
                identity,
            }),
        )?;
        self.execution_info.decision = None;

        let buffered = std::mem::take(&mut self.buffered_events);
        for event in buffered {
            self.append_own_event(event.event_type, event.attributes)?;
        }
        Ok(event_id)
    }

    pub fn add_workflow_execution_terminated(
        &mut self,
        reason: String,
        details: Option<serde_json::Value>,
        identity: String,
    ) -> Result<EventId, MutableStateError> {
        if !self.is_running() {
            return Err(MutableStateError::WorkflowClosed);
        }
        let event_id = self.append_own_event(
            EventType::WorkflowExecutionTerminated,
            EventAttributes::Terminated(TerminatedAttributes {
                reason,
                details,
                identity,
            }),
        )?;
        self.execution_info.set_state(WorkflowState::Completed)?;
        self.execution_info.status = WorkflowStatus::Terminated;
        self.execution_info.decision = None;
        self.closed_this_transaction = true;
        Ok(event_id)
    }

    pub fn upsert_activity(&mut self, info: ActivityInfo) {
        self.activities.insert(info.schedule_id, info);
    }

    /// Re-emit the queue task for a decision that is scheduled but not yet
    /// started. Returns false when there is nothing to refresh.
    pub fn regenerate_pending_decision_task(&mut self) -> bool {
        let Some(decision) = &self.execution_info.decision else {
            return false;
        };
        if decision.started_id.is_some() {
            return false;
        }
        self.transfer_tasks.push(TransferTask::DecisionTask {
            tasklist: decision.tasklist.clone(),
            schedule_id: decision.schedule_id,
        });
        true
    }

    /// Apply one replicated event at the head of the log. The state builder
    /// is the only caller.
    pub(crate) fn replicate_event(
        &mut self,
        event: &HistoryEvent,
        source_cluster: Option<&crate::core::ClusterName>,
    ) -> Result<(), MutableStateError> {
        let expected = self.execution_info.next_event_id;
        if event.event_id != expected {
            return Err(MutableStateError::EventIdMismatch {
                expected,
                got: event.event_id,
            });
        }

        self.apply_event_effects(event)?;

        self.execution_info.next_event_id = event.event_id.next();
        self.execution_info.last_event_task_id = event.task_id;
        self.replication_state
            .record_write(source_cluster, event.version, event.event_id);
        self.version_histories
            .current_mut()
            .add_or_update_item(VersionHistoryItem::new(event.event_id, event.version))?;
        self.pending_events.push(event.clone());
        Ok(())
    }

    fn apply_event_effects(&mut self, event: &HistoryEvent) -> Result<(), MutableStateError> {
        match event.event_type {
            EventType::WorkflowExecutionStarted => {
                if let EventAttributes::Started(attributes) = &event.attributes {
                    self.execution_info.workflow_type = attributes.workflow_type.clone();
                    self.execution_info.tasklist = attributes.tasklist.clone();
                    self.execution_info.execution_timeout_secs =
                        attributes.execution_timeout_secs;
                    self.execution_info.task_timeout_secs = attributes.task_timeout_secs;
                    self.execution_info.create_request_id =
                        attributes.create_request_id.clone();
                    self.execution_info.cron_schedule = attributes.cron_schedule.clone();
                    self.execution_info.attempt = attributes.attempt;
                }
                if self.execution_info.execution_timeout_secs > 0 {
                    self.timer_tasks.push(TimerTask::WorkflowRunTimeout {
                        fire_at_ms: event.timestamp_ms
                            + self.execution_info.execution_timeout_secs as u64 * 1000,
                    });
                }
            }
            EventType::DecisionTaskScheduled => {
                self.execution_info.set_state(WorkflowState::Running)?;
                let (tasklist, timeout, attempt) = match &event.attributes {
                    EventAttributes::DecisionScheduled(attributes) => (
                        attributes.tasklist.clone(),
                        attributes.start_to_close_timeout_secs,
                        attributes.attempt,
                    ),
                    _ => (self.execution_info.tasklist.clone(), 0, 0),
                };
                self.execution_info.decision = Some(DecisionInfo {
                    version: event.version,
                    schedule_id: event.event_id,
                    started_id: None,
                    tasklist,
                    start_to_close_timeout_secs: timeout,
                    attempt,
                });
            }
            EventType::DecisionTaskStarted => {
                if let Some(decision) = self.execution_info.decision.as_mut() {
                    decision.started_id = Some(event.event_id);
                }
            }
            EventType::DecisionTaskCompleted
            | EventType::DecisionTaskFailed
            | EventType::DecisionTaskTimedOut => {
                self.execution_info.decision = None;
            }
            EventType::ActivityTaskScheduled => {
                self.execution_info.set_state(WorkflowState::Running)?;
                self.activities.insert(
                    event.event_id,
                    ActivityInfo {
                        version: event.version,
                        schedule_id: event.event_id,
                        scheduled_time_ms: event.timestamp_ms,
                        started_id: None,
                        started_time_ms: None,
                        last_heartbeat_ms: None,
                        details: None,
                        attempt: 0,
                        last_failure: None,
                        last_worker_identity: None,
                    },
                );
            }
            EventType::ActivityTaskCompleted
            | EventType::ActivityTaskFailed
            | EventType::ActivityTaskTimedOut => {
                // Keyed by schedule id in attributes for full engines; the
                // replicator only needs the slot gone once terminal.
            }
            _ if event.event_type.is_terminal() => {
                self.execution_info.set_state(WorkflowState::Completed)?;
                self.execution_info.status = close_status(event.event_type);
                self.execution_info.decision = None;
                self.closed_this_transaction = true;
                if event.event_type == EventType::WorkflowExecutionContinuedAsNew
                    && let EventAttributes::ContinuedAsNew(attributes) = &event.attributes
                {
                    self.continued_as_new_run = Some(attributes.new_run_id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn append_own_event(
        &mut self,
        event_type: EventType,
        attributes: EventAttributes,
    ) -> Result<EventId, MutableStateError> {
        let event_id = self.execution_info.next_event_id;
        let version = self.replication_state.current_version;
        let event = HistoryEvent {
            event_id,
            version,
            task_id: TaskId(0),
            timestamp_ms: crate::core::WallClock::now().ms(),
            event_type,
            attributes,
        };
        self.execution_info.next_event_id = event_id.next();
        self.replication_state.record_write(None, version, event_id);
        self.version_histories
            .current_mut()
            .add_or_update_item(VersionHistoryItem::new(event_id, version))?;
        self.pending_events.push(event);
        Ok(event_id)
    }

    // --- commit ---

    /// Close the transaction: produce the snapshot to persist plus the new
    /// events addressed to their branch. Transaction scratch is drained;
    /// the caller persists both or neither.
    pub fn close_transaction_as_snapshot(
        &mut self,
        now_ms: u64,
        policy: TransactionPolicy,
    ) -> (WorkflowSnapshot, Vec<WorkflowEvents>) {
        let mut transfer_tasks = std::mem::take(&mut self.transfer_tasks);
        let mut timer_tasks = std::mem::take(&mut self.timer_tasks);
        let mut replication_tasks = Vec::new();
        let pending = std::mem::take(&mut self.pending_events);

        if self.closed_this_transaction {
            transfer_tasks.push(TransferTask::CloseExecution);
            timer_tasks.push(TimerTask::DeleteHistoryEvent {
                fire_at_ms: now_ms + self.retention_days as u64 * MS_PER_DAY,
            });
        }

        if policy == TransactionPolicy::Active && !pending.is_empty() {
            let first = pending.first().expect("pending is non-empty");
            let last = pending.last().expect("pending is non-empty");
            replication_tasks.push(ReplicationTask::History {
                first_event_id: first.event_id,
                next_event_id: last.event_id.next(),
                version: self.replication_state.last_write_version,
                new_run_id: self.continued_as_new_run,
            });
        }

        self.closed_this_transaction = false;
        self.continued_as_new_run = None;

        debug_assert_eq!(
            self.execution_info.next_event_id.get() - 1,
            self.replication_state.last_write_event_id.get(),
            "next_event_id must stay one past last_write_event_id"
        );

        let snapshot = WorkflowSnapshot {
            execution_info: self.execution_info.clone(),
            replication_state: self.replication_state.clone(),
            version_histories: Some(self.version_histories.clone()),
            activities: self.activities.clone(),
            buffered_events: self.buffered_events.clone(),
            transfer_tasks,
            timer_tasks,
            replication_tasks,
        };

        let events = if pending.is_empty() {
            Vec::new()
        } else {
            vec![WorkflowEvents {
                branch_token: self.execution_info.branch_token.clone(),
                events: pending,
            }]
        };

        (snapshot, events)
    }
}

fn close_status(event_type: EventType) -> WorkflowStatus {
    match event_type {
        EventType::WorkflowExecutionCompleted => WorkflowStatus::Completed,
        EventType::WorkflowExecutionFailed => WorkflowStatus::Failed,
        EventType::WorkflowExecutionTimedOut => WorkflowStatus::TimedOut,
        EventType::WorkflowExecutionTerminated => WorkflowStatus::Terminated,
        EventType::WorkflowExecutionCanceled => WorkflowStatus::Canceled,
        EventType::WorkflowExecutionContinuedAsNew => WorkflowStatus::ContinuedAsNew,
        _ => WorkflowStatus::Running,
    }
}
