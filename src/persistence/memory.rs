//! In-memory store backing the service tests.
//!
//! One struct implements every store capability behind a single mutex. The
//! conditional-update and workflow-id-reuse semantics match what the
//! replicator relies on from a production driver.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::core::{
    EventId, HistoryEvent, NamespaceId, RunId, ShardId, ShardInfo, WallClock, WorkflowId,
    WorkflowKey,
};

use super::error::{
    ExecutionStoreError, HistoryStoreError, ShardStoreError, WorkflowAlreadyStarted,
};
use super::tasks::{ReplicationTaskEntry, TimerTask, TransferTask};
use super::{
    CreateMode, CreateWorkflowExecutionRequest, CurrentExecution, ExecutionStore,
    HistoryBranchPage, HistoryStore, ReplicationQueue, ShardStore, StoredExecution,
    UpdateWorkflowExecutionRequest, WorkflowSnapshot,
};

#[derive(Default)]
struct MemoryStoreInner {
    current: BTreeMap<(NamespaceId, WorkflowId), RunId>,
    executions: BTreeMap<WorkflowKey, StoredRow>,
    branches: BTreeMap<Bytes, BTreeMap<i64, HistoryEvent>>,
    shards: BTreeMap<ShardId, ShardInfo>,
    replication_queue: BTreeMap<ShardId, Vec<ReplicationTaskEntry>>,
    transfer_queue: Vec<(WorkflowKey, TransferTask)>,
    timer_queue: Vec<(WorkflowKey, TimerTask)>,
    next_task_id: i64,
}

struct StoredRow {
    snapshot: WorkflowSnapshot,
    update_condition: i64,
}

pub struct MemoryStore {
    shard_id: ShardId,
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new(shard_id: ShardId) -> Self {
        let mut inner = MemoryStoreInner::default();
        inner.shards.insert(shard_id, ShardInfo::new(shard_id));
        inner.next_task_id = 1;
        Self {
            shard_id,
            inner: Mutex::new(inner),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    /// Count of events stored on a branch; test helper.
    pub fn branch_len(&self, branch_token: &Bytes) -> usize {
        self.lock()
            .branches
            .get(branch_token)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Transfer tasks enqueued for one run, in commit order; test helper.
    pub fn transfer_tasks_for(&self, key: &WorkflowKey) -> Vec<TransferTask> {
        self.lock()
            .transfer_queue
            .iter()
            .filter(|(task_key, _)| task_key == key)
            .map(|(_, task)| task.clone())
            .collect()
    }
}

impl MemoryStoreInner {
    fn already_started(&self, key: &WorkflowKey) -> Option<WorkflowAlreadyStarted> {
        let row = self.executions.get(key)?;
        let info = &row.snapshot.execution_info;
        Some(WorkflowAlreadyStarted {
            run_id: info.run_id,
            state: info.state,
            status: info.status,
            last_write_version: row.snapshot.replication_state.last_write_version,
            create_request_id: info.create_request_id.clone(),
        })
    }

    fn drain_tasks(&mut self, shard_id: ShardId, snapshot: &mut WorkflowSnapshot, key: &WorkflowKey) {
        for task in std::mem::take(&mut snapshot.transfer_tasks) {
            self.transfer_queue.push((key.clone(), task));
        }
        for task in std::mem::take(&mut snapshot.timer_tasks) {
            self.timer_queue.push((key.clone(), task));
        }
        let replication_tasks = std::mem::take(&mut snapshot.replication_tasks);
        let queue = self.replication_queue.entry(shard_id).or_default();
        for task in replication_tasks {
            let task_id = self.next_task_id;
            self.next_task_id += 1;
            queue.push(ReplicationTaskEntry {
                task_id,
                workflow: key.clone(),
                task,
                created_at_ms: WallClock::now().ms(),
            });
        }
    }
}

impl ExecutionStore for MemoryStore {
    fn get_current_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
    ) -> Result<CurrentExecution, ExecutionStoreError> {
        let inner = self.lock();
        let run_id = inner
            .current
            .get(&(namespace_id.clone(), workflow_id.clone()))
            .copied()
            .ok_or(ExecutionStoreError::NotFound)?;
        let key = WorkflowKey::new(namespace_id.clone(), workflow_id.clone(), run_id);
        let row = inner
            .executions
            .get(&key)
            .ok_or(ExecutionStoreError::NotFound)?;
        Ok(CurrentExecution {
            run_id,
            state: row.snapshot.execution_info.state,
            status: row.snapshot.execution_info.status,
            last_write_version: row.snapshot.replication_state.last_write_version,
        })
    }

    fn get_workflow_execution(
        &self,
        key: &WorkflowKey,
    ) -> Result<StoredExecution, ExecutionStoreError> {
        let inner = self.lock();
        let row = inner
            .executions
            .get(key)
            .ok_or(ExecutionStoreError::NotFound)?;
        Ok(StoredExecution {
            snapshot: row.snapshot.clone(),
            update_condition: row.update_condition,
        })
    }

    fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), ExecutionStoreError> {
        let mut inner = self.lock();
        let pointer_key = (request.namespace_id.clone(), request.workflow_id.clone());
        let new_run_id = request.snapshot.execution_info.run_id;

        if let Some(&current_run) = inner.current.get(&pointer_key) {
            let current_key = WorkflowKey::new(
                request.namespace_id.clone(),
                request.workflow_id.clone(),
                current_run,
            );
            let started = inner
                .already_started(&current_key)
                .ok_or_else(|| ExecutionStoreError::Internal("dangling current pointer".into()))?;

            match request.mode {
                CreateMode::BrandNew => {
                    return Err(ExecutionStoreError::AlreadyStarted(started));
                }
                CreateMode::WorkflowIdReuse => {
                    if Some(current_run) != request.previous_run_id {
                        return Err(ExecutionStoreError::AlreadyStarted(started));
                    }
                    if started.state.is_running() {
                        return Err(ExecutionStoreError::AlreadyStarted(started));
                    }
                    if Some(started.last_write_version) != request.previous_last_write_version {
                        return Err(ExecutionStoreError::ConditionFailed {
                            expected: request
                                .previous_last_write_version
                                .map(|version| version.get())
                                .unwrap_or(0),
                            actual: started.last_write_version.get(),
                        });
                    }
                }
            }
        } else if request.mode == CreateMode::WorkflowIdReuse {
            return Err(ExecutionStoreError::NotFound);
        }

        let key = WorkflowKey::new(
            request.namespace_id.clone(),
            request.workflow_id.clone(),
            new_run_id,
        );
        let mut snapshot = request.snapshot;
        let shard_id = self.shard_id;
        inner.drain_tasks(shard_id, &mut snapshot, &key);
        let condition = snapshot.execution_info.next_event_id.get();
        inner.current.insert(pointer_key, new_run_id);
        inner.executions.insert(
            key,
            StoredRow {
                snapshot,
                update_condition: condition,
            },
        );
        Ok(())
    }

    fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), ExecutionStoreError> {
        let mut inner = self.lock();
        let key = WorkflowKey::new(
            request.namespace_id.clone(),
            request.workflow_id.clone(),
            request.snapshot.execution_info.run_id,
        );
        let actual = inner
            .executions
            .get(&key)
            .ok_or(ExecutionStoreError::NotFound)?
            .update_condition;
        if actual != request.update_condition {
            return Err(ExecutionStoreError::ConditionFailed {
                expected: request.update_condition,
                actual,
            });
        }

        let mut snapshot = request.snapshot;
        let shard_id = self.shard_id;
        inner.drain_tasks(shard_id, &mut snapshot, &key);
        let condition = snapshot.execution_info.next_event_id.get();
        inner.executions.insert(
            key,
            StoredRow {
                snapshot,
                update_condition: condition,
            },
        );
        Ok(())
    }

    fn delete_workflow_execution(&self, key: &WorkflowKey) -> Result<(), ExecutionStoreError> {
        let mut inner = self.lock();
        inner
            .executions
            .remove(key)
            .ok_or(ExecutionStoreError::NotFound)?;
        let pointer_key = (key.namespace_id.clone(), key.workflow_id.clone());
        if inner.current.get(&pointer_key) == Some(&key.run_id) {
            inner.current.remove(&pointer_key);
        }
        Ok(())
    }
}

impl HistoryStore for MemoryStore {
    fn append_history_nodes(
        &self,
        branch_token: &Bytes,
        events: &[HistoryEvent],
        _shard_id: ShardId,
    ) -> Result<(), HistoryStoreError> {
        let mut inner = self.lock();
        let branch = inner.branches.entry(branch_token.clone()).or_default();
        for event in events {
            branch.insert(event.event_id.get(), event.clone());
        }
        Ok(())
    }

    fn read_history_branch(
        &self,
        branch_token: &Bytes,
        min_event_id: EventId,
        max_event_id: EventId,
        page_size: usize,
        token: Option<EventId>,
    ) -> Result<HistoryBranchPage, HistoryStoreError> {
        let inner = self.lock();
        let branch = inner
            .branches
            .get(branch_token)
            .ok_or(HistoryStoreError::BranchNotFound)?;
        let start = token.unwrap_or(min_event_id).get();
        let events: Vec<HistoryEvent> = branch
            .range(start..max_event_id.get())
            .take(page_size)
            .map(|(_, event)| event.clone())
            .collect();
        let next = match events.last() {
            Some(last) if last.event_id.next().get() < max_event_id.get() => {
                Some(last.event_id.next())
            }
            _ => None,
        };
        Ok(HistoryBranchPage { events, next })
    }

    fn delete_history_branch(
        &self,
        branch_token: &Bytes,
        _shard_id: ShardId,
    ) -> Result<(), HistoryStoreError> {
        let mut inner = self.lock();
        inner.branches.remove(branch_token);
        Ok(())
    }
}

impl ShardStore for MemoryStore {
    fn get_shard(&self, shard_id: ShardId) -> Result<ShardInfo, ShardStoreError> {
        self.lock()
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or(ShardStoreError::NotFound(shard_id.get()))
    }

    fn update_shard(
        &self,
        info: ShardInfo,
        previous_range_id: i64,
    ) -> Result<(), ShardStoreError> {
        let mut inner = self.lock();
        let stored = inner
            .shards
            .get(&info.shard_id)
            .ok_or(ShardStoreError::NotFound(info.shard_id.get()))?;
        if stored.range_id != previous_range_id {
            return Err(ShardStoreError::OwnershipLost {
                shard_id: info.shard_id.get(),
                requested: previous_range_id,
                actual: stored.range_id,
            });
        }
        inner.shards.insert(info.shard_id, info);
        Ok(())
    }
}

impl ReplicationQueue for MemoryStore {
    fn read_replication_tasks(
        &self,
        shard_id: ShardId,
        last_retrieved: i64,
        batch_size: usize,
    ) -> Result<Vec<ReplicationTaskEntry>, ExecutionStoreError> {
        let inner = self.lock();
        let Some(queue) = inner.replication_queue.get(&shard_id) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .iter()
            .filter(|entry| entry.task_id > last_retrieved)
            .take(batch_size)
            .cloned()
            .collect())
    }
}
