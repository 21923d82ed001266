//! Applies replicated event batches to a mutable state.
//!
//! The builder is the only writer of replicated events: it walks a batch in
//! order, lets the mutable state absorb each event, and hands back the
//! continued-as-new run when the batch closes one.

use std::sync::Arc;

use crate::core::{ClusterName, EventId, EventType, HistoryBatch};
use crate::namespace::NamespaceEntry;
use crate::persistence::ExecutionStoreError;

use super::error::ReplicationError;
use super::mutable_state::{MutableState, MutableStateError};

/// Side outputs of applying one batch.
#[derive(Debug, Default)]
pub struct AppliedState {
    /// Mutable state of the continued-as-new run, pre-populated from
    /// `new_run_history`, ready to be created alongside the update.
    pub new_run: Option<MutableState>,
}

pub struct StateBuilder {
    cluster_metadata: Arc<crate::cluster::ClusterMetadata>,
}

impl StateBuilder {
    pub fn new(cluster_metadata: Arc<crate::cluster::ClusterMetadata>) -> Self {
        Self { cluster_metadata }
    }

    /// Apply `batch` to `state`. `source_cluster` stamps the per-cluster
    /// replication info; pass `None` when replaying local history (conflict
    /// resolution).
    pub fn apply_events(
        &self,
        state: &mut MutableState,
        source_cluster: Option<&ClusterName>,
        batch: &HistoryBatch,
        new_run_history: Option<&HistoryBatch>,
        namespace: &NamespaceEntry,
    ) -> Result<AppliedState, ReplicationError> {
        let mut continued_as_new = false;
        for event in batch.events() {
            state
                .replicate_event(event, source_cluster)
                .map_err(map_mutable_state_error)?;
            if event.event_type == EventType::WorkflowExecutionContinuedAsNew {
                continued_as_new = true;
            }
        }

        let mut applied = AppliedState::default();
        if continued_as_new && let Some(new_history) = new_run_history {
            applied.new_run = Some(self.build_new_run(state, new_history, namespace)?);
        }
        Ok(applied)
    }

    /// Replay persisted history into a fresh state; used by the conflict
    /// resolver. The replayed events are local facts, so no per-cluster
    /// replication info is stamped.
    pub fn replay(
        &self,
        state: &mut MutableState,
        batch: &HistoryBatch,
    ) -> Result<(), ReplicationError> {
        for event in batch.events() {
            state
                .replicate_event(event, None)
                .map_err(map_mutable_state_error)?;
        }
        Ok(())
    }

    fn build_new_run(
        &self,
        closing: &MutableState,
        new_history: &HistoryBatch,
        namespace: &NamespaceEntry,
    ) -> Result<MutableState, ReplicationError> {
        if !new_history.starts_workflow() {
            return Err(ReplicationError::Core(
                crate::core::EventBatchError::NonContiguous {
                    expected: EventId::FIRST,
                    got: new_history.first_event_id(),
                }
                .into(),
            ));
        }

        let run_id = closing.continued_as_new_run_id().ok_or_else(|| {
            ReplicationError::ExecutionStore(ExecutionStoreError::Internal(
                "continued-as-new event without new run id".into(),
            ))
        })?;

        let key = closing.key();
        let first = new_history.first();
        let mut new_state = MutableState::new(
            key.namespace_id.clone(),
            key.workflow_id.clone(),
            run_id,
            first.version,
            namespace.config.retention_days,
        );

        let source = self
            .cluster_metadata
            .cluster_name_for_failover_version(first.version)
            .ok()
            .filter(|cluster| *cluster != self.cluster_metadata.current_cluster_name())
            .cloned();
        for event in new_history.events() {
            new_state
                .replicate_event(event, source.as_ref())
                .map_err(map_mutable_state_error)?;
        }
        Ok(new_state)
    }
}

pub(super) fn map_mutable_state_error(err: MutableStateError) -> ReplicationError {
    match err {
        MutableStateError::StateTransition(inner) => ReplicationError::Core(inner.into()),
        MutableStateError::VersionHistory(inner) => ReplicationError::Core(inner.into()),
        other => ReplicationError::ExecutionStore(ExecutionStoreError::Internal(
            other.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::two_cluster_metadata;
    use crate::core::{
        ContinuedAsNewAttributes, EventAttributes, HistoryEvent, NamespaceId, RunId, TaskId,
        Version, WorkflowId, WorkflowState,
    };
    use crate::namespace::{
        NamespaceConfig, NamespaceEntry, NamespaceInfo, NamespaceReplicationConfig,
    };

    fn namespace_entry() -> NamespaceEntry {
        NamespaceEntry {
            info: NamespaceInfo {
                id: NamespaceId::new("ns1").unwrap(),
                name: "ns1-name".into(),
            },
            config: NamespaceConfig { retention_days: 1 },
            replication_config: NamespaceReplicationConfig {
                active_cluster: crate::core::ClusterName::new("active").unwrap(),
                clusters: vec![
                    crate::core::ClusterName::new("active").unwrap(),
                    crate::core::ClusterName::new("standby").unwrap(),
                ],
            },
            failover_version: Version::new(1),
            is_global: true,
        }
    }

    fn event(event_id: i64, version: i64, event_type: EventType) -> HistoryEvent {
        let attributes = match event_type {
            EventType::WorkflowExecutionStarted => EventAttributes::Started(Default::default()),
            _ => EventAttributes::Common,
        };
        HistoryEvent {
            event_id: EventId::new(event_id),
            version: Version::new(version),
            task_id: TaskId(event_id),
            timestamp_ms: 1_000,
            event_type,
            attributes,
        }
    }

    fn fresh_state(run_id: RunId, version: i64) -> MutableState {
        MutableState::new(
            NamespaceId::new("ns1").unwrap(),
            WorkflowId::new("wf1").unwrap(),
            run_id,
            Version::new(version),
            1,
        )
    }

    #[test]
    fn apply_batch_advances_state_and_stamps_source() {
        let metadata = Arc::new(two_cluster_metadata("active"));
        let builder = StateBuilder::new(metadata);
        let standby = ClusterName::new("standby").unwrap();
        let mut state = fresh_state(RunId::generate(), 2);

        let batch = HistoryBatch::new(vec![
            event(1, 2, EventType::WorkflowExecutionStarted),
            event(2, 2, EventType::DecisionTaskScheduled),
        ])
        .unwrap();
        builder
            .apply_events(&mut state, Some(&standby), &batch, None, &namespace_entry())
            .unwrap();

        assert_eq!(state.next_event_id(), EventId::new(3));
        assert_eq!(
            state.replication_state().info_for(&standby).unwrap().last_event_id,
            EventId::new(2)
        );
    }

    #[test]
    fn continued_as_new_builds_second_run() {
        let metadata = Arc::new(two_cluster_metadata("active"));
        let builder = StateBuilder::new(metadata);
        let standby = ClusterName::new("standby").unwrap();
        let new_run_id = RunId::generate();
        let mut state = fresh_state(RunId::generate(), 2);

        builder
            .apply_events(
                &mut state,
                Some(&standby),
                &HistoryBatch::new(vec![
                    event(1, 2, EventType::WorkflowExecutionStarted),
                    event(2, 2, EventType::DecisionTaskScheduled),
                ])
                .unwrap(),
                None,
                &namespace_entry(),
            )
            .unwrap();

        let close = HistoryEvent {
            attributes: EventAttributes::ContinuedAsNew(ContinuedAsNewAttributes {
                new_run_id,
            }),
            ..event(3, 2, EventType::WorkflowExecutionContinuedAsNew)
        };
        let new_run_history =
            HistoryBatch::new(vec![event(1, 2, EventType::WorkflowExecutionStarted)]).unwrap();

        let applied = builder
            .apply_events(
                &mut state,
                Some(&standby),
                &HistoryBatch::new(vec![close]).unwrap(),
                Some(&new_run_history),
                &namespace_entry(),
            )
            .unwrap();

        assert_eq!(state.execution_info().state, WorkflowState::Completed);
        let new_run = applied.new_run.expect("new run built");
        assert_eq!(new_run.run_id(), new_run_id);
        assert_eq!(new_run.next_event_id(), EventId::new(2));
    }

    #[test]
    fn new_run_history_must_start_at_one() {
        let metadata = Arc::new(two_cluster_metadata("active"));
        let builder = StateBuilder::new(metadata);
        let standby = ClusterName::new("standby").unwrap();
        let mut state = fresh_state(RunId::generate(), 2);

        builder
            .apply_events(
                &mut state,
                Some(&standby),
                &HistoryBatch::new(vec![event(1, 2, EventType::WorkflowExecutionStarted)])
                    .unwrap(),
                None,
                &namespace_entry(),
            )
            .unwrap();

        let close = HistoryEvent {
            attributes: EventAttributes::ContinuedAsNew(ContinuedAsNewAttributes {
                new_run_id: RunId::generate(),
            }),
            ..event(2, 2, EventType::WorkflowExecutionContinuedAsNew)
        };
        let bad_new_history =
            HistoryBatch::new(vec![event(5, 2, EventType::DecisionTaskScheduled)]).unwrap();

        let err = builder
            .apply_events(
                &mut state,
                Some(&standby),
                &HistoryBatch::new(vec![close]).unwrap(),
                Some(&bad_new_history),
                &namespace_entry(),
            )
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Core(_)));
    }
}
