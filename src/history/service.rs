//! History-service facade over the replicator suite.
//!
//! Routes the transport-level request surface: the three replicate variants,
//! activity/shard sync, the replication-message feed, the DLQ taxonomy, and
//! the long-poll mutable-state read. Conflict-class failures divert to the
//! DLQ here so the replication stream keeps draining.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::requests::{
    DlqMessage, DlqType, GetDlqReplicationMessagesRequest, GetReplicationMessagesRequest,
    GetReplicationMessagesResponse,
    MergeDlqMessagesRequest, MergeDlqMessagesResponse, PollMutableStateRequest,
    PollMutableStateResponse, PurgeDlqMessagesRequest, ReadDlqMessagesRequest,
    ReadDlqMessagesResponse, ReapplyEventsRequest, RefreshWorkflowTasksRequest,
    ReplicateEventsRequest, ReplicateEventsV2Request, ReplicateRawEventsRequest,
    ReplicationMessages, SyncActivityRequest, SyncShardStatusRequest,
};
use crate::api::decode_history_blob;
use crate::cluster::ClusterMetadata;
use crate::core::{CancellationToken, Limits, ShardId, WorkflowKey};
use crate::persistence::{ReplicationQueue, ShardStore};

use super::dlq::DlqStore;
use super::error::ReplicationError;
use super::metrics;
use super::notifier::HistoryEventNotifier;
use super::replicator::HistoryReplicator;

pub struct HistoryService {
    shard_id: ShardId,
    replicator: Arc<HistoryReplicator>,
    cluster_metadata: Arc<ClusterMetadata>,
    shard_store: Arc<dyn ShardStore>,
    replication_queue: Arc<dyn ReplicationQueue>,
    dlq: Arc<dyn DlqStore>,
    notifier: Arc<HistoryEventNotifier>,
    limits: Limits,
}

impl HistoryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: ShardId,
        replicator: Arc<HistoryReplicator>,
        cluster_metadata: Arc<ClusterMetadata>,
        shard_store: Arc<dyn ShardStore>,
        replication_queue: Arc<dyn ReplicationQueue>,
        dlq: Arc<dyn DlqStore>,
        notifier: Arc<HistoryEventNotifier>,
        limits: Limits,
    ) -> Self {
        Self {
            shard_id,
            replicator,
            cluster_metadata,
            shard_store,
            replication_queue,
            dlq,
            notifier,
            limits,
        }
    }

    pub fn replicator(&self) -> &Arc<HistoryReplicator> {
        &self.replicator
    }

    /// Ingest a v1 replication batch. Conflict-class outcomes divert the
    /// request to the DLQ and acknowledge the task.
    pub fn replicate_events(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsRequest,
    ) -> Result<(), ReplicationError> {
        match self.replicator.apply_events(token, request) {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() => {
                tracing::error!(
                    target: "repl",
                    namespace_id = %request.namespace_id,
                    workflow_id = %request.workflow_execution.workflow_id,
                    run_id = %request.workflow_execution.run_id,
                    error = %err,
                    "diverting conflicting replication task to DLQ"
                );
                self.dlq.enqueue(
                    self.shard_id,
                    &request.source_cluster,
                    DlqMessage {
                        message_id: 0,
                        source_cluster: request.source_cluster.clone(),
                        request: request.clone(),
                        failure: err.to_string(),
                    },
                )?;
                metrics::repl_dlq_enqueued();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// V2 wire format: version-history items and event blobs. The
    /// reconciliation core is shared with v1; the items pin the incoming
    /// version.
    pub fn replicate_events_v2(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsV2Request,
    ) -> Result<(), ReplicationError> {
        let events = decode_history_blob(&request.events, &self.limits)?;
        let new_run_events = match &request.new_run_events {
            Some(blob) => decode_history_blob(blob, &self.limits)?,
            None => Vec::new(),
        };
        let version = request
            .version_history_items
            .last()
            .map(|item| item.version)
            .or_else(|| events.last().map(|event| event.version))
            .ok_or_else(|| {
                ReplicationError::ExecutionStore(
                    crate::persistence::ExecutionStoreError::Internal(
                        "v2 request with no events and no version history".into(),
                    ),
                )
            })?;
        let (first_event_id, next_event_id) = batch_bounds(&events)?;
        let source_cluster = self
            .cluster_metadata
            .cluster_name_for_failover_version(version)?
            .clone();

        let v1 = ReplicateEventsRequest {
            source_cluster,
            namespace_id: request.namespace_id.clone(),
            workflow_execution: request.workflow_execution.clone(),
            first_event_id,
            next_event_id,
            version,
            replication_info: BTreeMap::new(),
            history: events,
            new_run_history: new_run_events,
            reset_workflow: false,
            force_buffer_events: false,
        };
        self.replicate_events(token, &v1)
    }

    /// V1 semantics on the compressed wire format.
    pub fn replicate_raw_events(
        &self,
        token: &CancellationToken,
        request: &ReplicateRawEventsRequest,
    ) -> Result<(), ReplicationError> {
        let events = decode_history_blob(&request.history.data, &self.limits)?;
        let new_run_events = match &request.new_run_history {
            Some(blob) => decode_history_blob(&blob.data, &self.limits)?,
            None => Vec::new(),
        };
        let version = events.last().map(|event| event.version).ok_or_else(|| {
            ReplicationError::ExecutionStore(
                crate::persistence::ExecutionStoreError::Internal(
                    "raw replication request with empty history".into(),
                ),
            )
        })?;
        let (first_event_id, next_event_id) = batch_bounds(&events)?;
        let source_cluster = self
            .cluster_metadata
            .cluster_name_for_failover_version(version)?
            .clone();

        let v1 = ReplicateEventsRequest {
            source_cluster,
            namespace_id: request.namespace_id.clone(),
            workflow_execution: request.workflow_execution.clone(),
            first_event_id,
            next_event_id,
            version,
            replication_info: request.replication_info.clone(),
            history: events,
            new_run_history: new_run_events,
            reset_workflow: false,
            force_buffer_events: false,
        };
        self.replicate_events(token, &v1)
    }

    pub fn sync_activity(
        &self,
        token: &CancellationToken,
        request: &SyncActivityRequest,
    ) -> Result<(), ReplicationError> {
        self.replicator.sync_activity(token, request)
    }

    /// Record peer liveness in the shard row.
    pub fn sync_shard_status(
        &self,
        token: &CancellationToken,
        request: &SyncShardStatusRequest,
    ) -> Result<(), ReplicationError> {
        if token.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }
        let mut info = self.shard_store.get_shard(request.shard_id)?;
        let previous_range_id = info.range_id;
        info.cluster_transfer_ack_levels.insert(
            request.source_cluster.clone(),
            request.timestamp_ms as i64,
        );
        self.shard_store.update_shard(info, previous_range_id)?;
        Ok(())
    }

    /// Page replication tasks for each requested shard token.
    pub fn get_replication_messages(
        &self,
        token: &CancellationToken,
        request: &GetReplicationMessagesRequest,
    ) -> Result<GetReplicationMessagesResponse, ReplicationError> {
        let mut messages_by_shard = BTreeMap::new();
        for shard_token in &request.tokens {
            if token.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
            let batch_size = self.limits.replication_messages_max_batch;
            let tasks = self.replication_queue.read_replication_tasks(
                shard_token.shard_id,
                shard_token.last_retrieved_message_id,
                batch_size,
            )?;
            let has_more = tasks.len() == batch_size;
            let last_retrieved_message_id = tasks
                .last()
                .map(|task| task.task_id)
                .unwrap_or(shard_token.last_retrieved_message_id);
            messages_by_shard.insert(
                shard_token.shard_id,
                ReplicationMessages {
                    replication_tasks: tasks,
                    last_retrieved_message_id,
                    has_more,
                },
            );
        }
        Ok(GetReplicationMessagesResponse { messages_by_shard })
    }

    /// Fetch specific diverted messages by id, for peer-driven DLQ drains.
    pub fn get_dlq_replication_messages(
        &self,
        request: &GetDlqReplicationMessagesRequest,
    ) -> Result<Vec<DlqMessage>, ReplicationError> {
        let mut wanted: Vec<DlqMessage> = Vec::new();
        let mut token = None;
        loop {
            let (page, next) = self.dlq.read(
                request.shard_id,
                &request.source_cluster,
                None,
                self.limits.dlq_read_max_page_size,
                token,
            )?;
            wanted.extend(
                page.into_iter()
                    .filter(|message| request.message_ids.contains(&message.message_id)),
            );
            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(wanted)
    }

    pub fn read_dlq_messages(
        &self,
        request: &ReadDlqMessagesRequest,
    ) -> Result<ReadDlqMessagesResponse, ReplicationError> {
        let page_size = request
            .maximum_page_size
            .min(self.limits.dlq_read_max_page_size);
        let (messages, next_page_token) = self.dlq.read(
            request.shard_id,
            &request.source_cluster,
            request.inclusive_end_message_id,
            page_size,
            request.next_page_token,
        )?;
        Ok(ReadDlqMessagesResponse {
            dlq_type: request.dlq_type,
            messages,
            next_page_token,
        })
    }

    pub fn purge_dlq_messages(
        &self,
        request: &PurgeDlqMessagesRequest,
    ) -> Result<usize, ReplicationError> {
        Ok(self.dlq.purge(
            request.shard_id,
            &request.source_cluster,
            request.inclusive_end_message_id,
        )?)
    }

    /// Re-ingest DLQ messages through the replicator, removing each on
    /// success. A retriable outcome stops the merge and leaves the message
    /// queued; the peer's resend will unblock it.
    pub fn merge_dlq_messages(
        &self,
        token: &CancellationToken,
        request: &MergeDlqMessagesRequest,
    ) -> Result<MergeDlqMessagesResponse, ReplicationError> {
        if request.dlq_type != DlqType::Replication {
            return Ok(MergeDlqMessagesResponse {
                merged: 0,
                next_page_token: None,
            });
        }
        let page_size = request
            .maximum_page_size
            .min(self.limits.dlq_read_max_page_size);
        let (messages, next_page_token) = self.dlq.read(
            request.shard_id,
            &request.source_cluster,
            request.inclusive_end_message_id,
            page_size,
            None,
        )?;

        let mut merged = 0usize;
        for message in messages {
            match self.replicator.apply_events(token, &message.request) {
                Ok(()) => {
                    self.dlq
                        .remove(request.shard_id, &request.source_cluster, message.message_id)?;
                    merged += 1;
                }
                Err(err) if err.is_retryable() => {
                    tracing::info!(
                        target: "repl",
                        message_id = message.message_id,
                        error = %err,
                        "DLQ merge paused on retriable outcome"
                    );
                    return Ok(MergeDlqMessagesResponse {
                        merged,
                        next_page_token: Some(message.message_id),
                    });
                }
                Err(err) if err.is_conflict() => {
                    // Still conflicting; leave it queued for inspection.
                    tracing::warn!(
                        target: "repl",
                        message_id = message.message_id,
                        error = %err,
                        "DLQ message still conflicts; skipping"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(MergeDlqMessagesResponse {
            merged,
            next_page_token,
        })
    }

    pub fn reapply_events(
        &self,
        token: &CancellationToken,
        request: &ReapplyEventsRequest,
    ) -> Result<(), ReplicationError> {
        self.replicator.reapply_events(
            token,
            &request.namespace_id,
            &request.workflow_execution.workflow_id,
            request.workflow_execution.run_id,
            request.events.clone(),
        )
    }

    pub fn refresh_workflow_tasks(
        &self,
        token: &CancellationToken,
        request: &RefreshWorkflowTasksRequest,
    ) -> Result<(), ReplicationError> {
        self.replicator.refresh_tasks(
            token,
            &request.namespace_id,
            &request.workflow_execution.workflow_id,
            request.workflow_execution.run_id,
        )
    }

    /// Long-poll read of a run's mutable state. Returns immediately unless
    /// the caller asks to wait for the log to pass `expected_next_event_id`.
    pub fn poll_mutable_state(
        &self,
        token: &CancellationToken,
        request: &PollMutableStateRequest,
    ) -> Result<PollMutableStateResponse, ReplicationError> {
        let key = WorkflowKey::new(
            request.namespace_id.clone(),
            request.workflow_execution.workflow_id.clone(),
            request.workflow_execution.run_id,
        );

        let view = self.replicator.read_mutable_state(token, &key)?;
        let satisfied = |next_event_id: crate::core::EventId| match request.expected_next_event_id
        {
            Some(expected) => next_event_id > expected,
            None => true,
        };
        if satisfied(view.next_event_id) || !view.workflow_state.is_running() {
            return Ok(respond(request, view));
        }

        let subscription = match self.notifier.watch(&key) {
            Ok(subscription) => subscription,
            // Waiter budget exhausted: degrade to an immediate answer.
            Err(_) => return Ok(respond(request, view)),
        };
        let deadline =
            Instant::now() + Duration::from_millis(self.limits.poll_mutable_state_timeout_ms);

        loop {
            if token.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let view = self.replicator.read_mutable_state(token, &key)?;
                return Ok(respond(request, view));
            }
            let wait = remaining.min(Duration::from_millis(100));
            match subscription.receiver().recv_timeout(wait) {
                Ok(notification) => {
                    if satisfied(notification.next_event_id)
                        || !notification.workflow_state.is_running()
                    {
                        let view = self.replicator.read_mutable_state(token, &key)?;
                        return Ok(respond(request, view));
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    // The notification may have fired before the waiter
                    // registered; re-check committed state each tick.
                    let view = self.replicator.read_mutable_state(token, &key)?;
                    if satisfied(view.next_event_id) || !view.workflow_state.is_running() {
                        return Ok(respond(request, view));
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    let view = self.replicator.read_mutable_state(token, &key)?;
                    return Ok(respond(request, view));
                }
            }
        }
    }
}

fn respond(
    request: &PollMutableStateRequest,
    view: super::replicator::MutableStateView,
) -> PollMutableStateResponse {
    PollMutableStateResponse {
        workflow_execution: request.workflow_execution.clone(),
        next_event_id: view.next_event_id,
        last_event_task_id: view.last_event_task_id,
        is_workflow_running: view.workflow_state.is_running(),
        workflow_state: view.workflow_state,
        branch_token: view.branch_token,
        last_write_version: view.last_write_version,
    }
}

fn batch_bounds(
    events: &[crate::core::HistoryEvent],
) -> Result<(crate::core::EventId, crate::core::EventId), ReplicationError> {
    let first = events.first().map(|event| event.event_id).ok_or_else(|| {
        ReplicationError::ExecutionStore(crate::persistence::ExecutionStoreError::Internal(
            "empty event batch".into(),
        ))
    })?;
    let next = events
        .last()
        .map(|event| event.event_id.next())
        .expect("non-empty checked above");
    Ok((first, next))
}
