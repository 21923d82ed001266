//! Shared test rig: a wired history service over the in-memory store.
//!
//! Cluster topology used throughout: `active` (this cluster, failover
//! versions ending in 1) and `standby` (versions ending in 2), increment 10.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use strand::api::requests::{ReplicateEventsRequest, WorkflowExecution};
use strand::cluster::{ClusterInfo, ClusterMetadata};
use strand::core::{
    CancellationToken, ClusterName, EventAttributes, EventId, EventType, HistoryEvent, Limits,
    NamespaceId, ReplicationInfo, RunId, ShardId, SignaledAttributes, StartedAttributes, TaskId,
    Version, WorkflowId, WorkflowKey,
};
use strand::history::{
    DlqStore, HistoryEventNotifier, HistoryReplicator, HistoryService, MemoryDlq, MutableState,
    ReplicationError, StateBuilder, TransactionPolicy, WorkflowResetor,
};
use strand::namespace::{
    NamespaceCache, NamespaceConfig, NamespaceEntry, NamespaceInfo, NamespaceReplicationConfig,
};
use strand::persistence::{
    CreateMode, CreateWorkflowExecutionRequest, ExecutionStore, HistoryStore, MemoryStore,
};

pub const SHARD: ShardId = ShardId(1);

pub fn active() -> ClusterName {
    ClusterName::new("active").unwrap()
}

pub fn standby() -> ClusterName {
    ClusterName::new("standby").unwrap()
}

pub fn ns_id() -> NamespaceId {
    NamespaceId::new("ns1").unwrap()
}

pub fn wf_id(name: &str) -> WorkflowId {
    WorkflowId::new(name).unwrap()
}

/// Records every resetor invocation for assertions.
#[derive(Default)]
pub struct RecordingResetor {
    pub reset_requests: Mutex<Vec<RunId>>,
    pub closed_reapplies: Mutex<Vec<(RunId, usize)>>,
}

impl WorkflowResetor for RecordingResetor {
    fn apply_reset_request(
        &self,
        _token: &CancellationToken,
        _request: &ReplicateEventsRequest,
        current_run_id: RunId,
    ) -> Result<(), ReplicationError> {
        self.reset_requests
            .lock()
            .unwrap()
            .push(current_run_id);
        Ok(())
    }

    fn reapply_to_closed_run(
        &self,
        _token: &CancellationToken,
        _namespace_id: &NamespaceId,
        _workflow_id: &WorkflowId,
        run_id: RunId,
        signals: Vec<HistoryEvent>,
    ) -> Result<(), ReplicationError> {
        self.closed_reapplies
            .lock()
            .unwrap()
            .push((run_id, signals.len()));
        Ok(())
    }
}

pub struct ReplicationRig {
    pub store: Arc<MemoryStore>,
    pub dlq: Arc<MemoryDlq>,
    pub notifier: Arc<HistoryEventNotifier>,
    pub resetor: Arc<RecordingResetor>,
    pub replicator: Arc<HistoryReplicator>,
    pub service: HistoryService,
    pub cluster_metadata: Arc<ClusterMetadata>,
    pub token: CancellationToken,
}

impl ReplicationRig {
    pub fn new() -> Self {
        let limits = Limits::default();
        let store = Arc::new(MemoryStore::new(SHARD));
        let dlq = Arc::new(MemoryDlq::new());
        let notifier = Arc::new(HistoryEventNotifier::new(limits.clone()));
        let resetor = Arc::new(RecordingResetor::default());

        let mut clusters = BTreeMap::new();
        clusters.insert(
            active(),
            ClusterInfo {
                initial_failover_version: 1,
                enabled: true,
            },
        );
        clusters.insert(
            standby(),
            ClusterInfo {
                initial_failover_version: 2,
                enabled: true,
            },
        );
        let cluster_metadata =
            Arc::new(ClusterMetadata::new(active(), 10, clusters, true).unwrap());

        let namespace_cache = Arc::new(NamespaceCache::new());
        namespace_cache.register(NamespaceEntry {
            info: NamespaceInfo {
                id: ns_id(),
                name: "test-namespace".into(),
            },
            config: NamespaceConfig { retention_days: 1 },
            replication_config: NamespaceReplicationConfig {
                active_cluster: standby(),
                clusters: vec![active(), standby()],
            },
            failover_version: Version::new(2),
            is_global: true,
        });

        let cache = Arc::new(strand::history::ExecutionCache::new(limits.clone()));
        let replicator = Arc::new(HistoryReplicator::new(
            SHARD,
            Arc::clone(&cluster_metadata),
            Arc::clone(&namespace_cache),
            store.clone(),
            store.clone(),
            cache,
            Arc::clone(&notifier),
            resetor.clone(),
            limits.clone(),
        ));
        let service = HistoryService::new(
            SHARD,
            Arc::clone(&replicator),
            Arc::clone(&cluster_metadata),
            store.clone(),
            store.clone(),
            dlq.clone(),
            Arc::clone(&notifier),
            limits,
        );

        Self {
            store,
            dlq,
            notifier,
            resetor,
            replicator,
            service,
            cluster_metadata,
            token: CancellationToken::new(),
        }
    }

    /// Seed a run directly in the store: history nodes plus the execution
    /// row, applied through the state builder exactly as replication would.
    /// Events stamped with a `standby` version record that cluster's
    /// replication info; events in `active`'s residue class read as local
    /// writes.
    pub fn seed_run(&self, workflow: &WorkflowId, run_id: RunId, events: &[HistoryEvent]) {
        let builder = StateBuilder::new(Arc::clone(&self.cluster_metadata));
        let mut state = MutableState::new(ns_id(), workflow.clone(), run_id, events[0].version, 1);
        let namespace = namespace_entry();
        let standby_name = standby();
        for event in events {
            let source = if event.version.get().rem_euclid(10) == 2 {
                Some(&standby_name)
            } else {
                None
            };
            let batch = strand::core::HistoryBatch::new(vec![event.clone()]).unwrap();
            builder
                .apply_events(&mut state, source, &batch, None, &namespace)
                .unwrap();
        }
        let (snapshot, chunks) = state.close_transaction_as_snapshot(0, TransactionPolicy::Passive);
        for chunk in &chunks {
            self.store
                .append_history_nodes(&chunk.branch_token, &chunk.events, SHARD)
                .unwrap();
        }
        self.store
            .create_workflow_execution(CreateWorkflowExecutionRequest {
                namespace_id: ns_id(),
                workflow_id: workflow.clone(),
                mode: CreateMode::BrandNew,
                previous_run_id: None,
                previous_last_write_version: None,
                snapshot,
            })
            .unwrap();
    }

    /// Seed a successor run over a closed current one, mirroring the
    /// workflow-id-reuse create the replicator performs.
    pub fn seed_run_reuse(
        &self,
        workflow: &WorkflowId,
        run_id: RunId,
        events: &[HistoryEvent],
        previous_run_id: RunId,
        previous_last_write_version: Version,
    ) {
        let builder = StateBuilder::new(Arc::clone(&self.cluster_metadata));
        let mut state = MutableState::new(ns_id(), workflow.clone(), run_id, events[0].version, 1);
        let namespace = namespace_entry();
        let standby_name = standby();
        for event in events {
            let source = if event.version.get().rem_euclid(10) == 2 {
                Some(&standby_name)
            } else {
                None
            };
            let batch = strand::core::HistoryBatch::new(vec![event.clone()]).unwrap();
            builder
                .apply_events(&mut state, source, &batch, None, &namespace)
                .unwrap();
        }
        let (snapshot, chunks) = state.close_transaction_as_snapshot(0, TransactionPolicy::Passive);
        for chunk in &chunks {
            self.store
                .append_history_nodes(&chunk.branch_token, &chunk.events, SHARD)
                .unwrap();
        }
        self.store
            .create_workflow_execution(CreateWorkflowExecutionRequest {
                namespace_id: ns_id(),
                workflow_id: workflow.clone(),
                mode: CreateMode::WorkflowIdReuse,
                previous_run_id: Some(previous_run_id),
                previous_last_write_version: Some(previous_last_write_version),
                snapshot,
            })
            .unwrap();
    }

    pub fn stored_state(&self, workflow: &WorkflowId, run_id: RunId) -> MutableState {
        let key = WorkflowKey::new(ns_id(), workflow.clone(), run_id);
        let stored = self.store.get_workflow_execution(&key).unwrap();
        MutableState::from_stored(ns_id(), workflow.clone(), stored, 1)
    }

    pub fn current_run(&self, workflow: &WorkflowId) -> strand::persistence::CurrentExecution {
        self.store.get_current_execution(&ns_id(), workflow).unwrap()
    }
}

pub fn namespace_entry() -> NamespaceEntry {
    NamespaceEntry {
        info: NamespaceInfo {
            id: ns_id(),
            name: "test-namespace".into(),
        },
        config: NamespaceConfig { retention_days: 1 },
        replication_config: NamespaceReplicationConfig {
            active_cluster: standby(),
            clusters: vec![active(), standby()],
        },
        failover_version: Version::new(2),
        is_global: true,
    }
}

// --- event builders ---

pub fn started_event(version: i64, task_id: i64) -> HistoryEvent {
    HistoryEvent {
        event_id: EventId::FIRST,
        version: Version::new(version),
        task_id: TaskId(task_id),
        timestamp_ms: 1_000,
        event_type: EventType::WorkflowExecutionStarted,
        attributes: EventAttributes::Started(StartedAttributes {
            workflow_type: "order-processing".into(),
            tasklist: "orders".into(),
            execution_timeout_secs: 600,
            task_timeout_secs: 10,
            create_request_id: "create-req-1".into(),
            parent_workflow_id: None,
            parent_run_id: None,
            cron_schedule: None,
            attempt: 0,
            input: None,
        }),
    }
}

pub fn plain_event(event_id: i64, version: i64, task_id: i64, event_type: EventType) -> HistoryEvent {
    HistoryEvent {
        event_id: EventId::new(event_id),
        version: Version::new(version),
        task_id: TaskId(task_id),
        timestamp_ms: 1_000 + event_id as u64,
        event_type,
        attributes: EventAttributes::Common,
    }
}

pub fn signal_event(event_id: i64, version: i64, name: &str, identity: &str) -> HistoryEvent {
    HistoryEvent {
        event_id: EventId::new(event_id),
        version: Version::new(version),
        task_id: TaskId(event_id),
        timestamp_ms: 1_000 + event_id as u64,
        event_type: EventType::WorkflowExecutionSignaled,
        attributes: EventAttributes::Signaled(SignaledAttributes {
            signal_name: name.into(),
            input: None,
            identity: identity.into(),
        }),
    }
}

// --- request builder ---

pub struct RequestBuilder {
    request: ReplicateEventsRequest,
}

impl RequestBuilder {
    pub fn new(workflow: &WorkflowId, run_id: RunId, events: Vec<HistoryEvent>) -> Self {
        let first_event_id = events.first().map(|event| event.event_id).unwrap_or(EventId::FIRST);
        let next_event_id = events
            .last()
            .map(|event| event.event_id.next())
            .unwrap_or(EventId::FIRST);
        let version = events.last().map(|event| event.version).unwrap_or(Version::new(2));
        Self {
            request: ReplicateEventsRequest {
                source_cluster: standby(),
                namespace_id: ns_id(),
                workflow_execution: WorkflowExecution {
                    workflow_id: workflow.clone(),
                    run_id,
                },
                first_event_id,
                next_event_id,
                version,
                replication_info: BTreeMap::new(),
                history: events,
                new_run_history: Vec::new(),
                reset_workflow: false,
                force_buffer_events: false,
            },
        }
    }

    pub fn replication_info(mut self, cluster: ClusterName, version: i64, last_event_id: i64) -> Self {
        self.request.replication_info.insert(
            cluster,
            ReplicationInfo::new(Version::new(version), EventId::new(last_event_id)),
        );
        self
    }

    pub fn new_run_history(mut self, events: Vec<HistoryEvent>) -> Self {
        self.request.new_run_history = events;
        self
    }

    pub fn reset_workflow(mut self) -> Self {
        self.request.reset_workflow = true;
        self
    }

    pub fn build(self) -> ReplicateEventsRequest {
        self.request
    }
}
