//! The cross-cluster history replicator.
//!
//! Ingests replicated event batches, reconciles them against local mutable
//! state, and either appends, drops, reapplies signals, asks the peer to
//! resend, or resets through the conflict resolver. The decision tables
//! here are the protocol; treat every branch as load-bearing.

use std::sync::Arc;

use crate::api::requests::ReplicateEventsRequest;
use crate::cluster::ClusterMetadata;
use crate::core::{
    CancellationToken, EventId, HistoryBatch, HistoryEvent, Limits, NamespaceId,
    ReplicationInfo, RunId, ShardId, Version, WallClock, WorkflowId, WorkflowKey, WorkflowState,
};
use crate::namespace::{NamespaceCache, NamespaceEntry};
use crate::persistence::{
    CreateMode, CreateWorkflowExecutionRequest, ExecutionStore, ExecutionStoreError,
    HistoryStore, WorkflowAlreadyStarted,
};

use super::cache::{ExecutionCache, ExecutionGuard};
use super::conflict_resolver::{ConflictResolver, ResetFence};
use super::context::ContextOps;
use super::error::{
    ERR_RETRY_BUFFER_EVENTS, ERR_RETRY_EXISTING_WORKFLOW, ERR_WORKFLOW_NOT_FOUND,
    ReplicationError, WORKFLOW_TERMINATION_IDENTITY, WORKFLOW_TERMINATION_REASON,
};
use super::metrics;
use super::mutable_state::{MutableState, TransactionPolicy};
use super::notifier::{EventNotification, HistoryEventNotifier};
use super::state_builder::{StateBuilder, map_mutable_state_error};

/// External workflow-reset capability. The replicator only routes to it;
/// rebuilding a run from a reset point is the resetor's business.
pub trait WorkflowResetor: Send + Sync {
    fn apply_reset_request(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsRequest,
        current_run_id: RunId,
    ) -> Result<(), ReplicationError>;

    /// Signals aimed at a closed current run; the resetor decides whether a
    /// reset-and-reapply is warranted.
    fn reapply_to_closed_run(
        &self,
        token: &CancellationToken,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: RunId,
        signals: Vec<HistoryEvent>,
    ) -> Result<(), ReplicationError>;
}

/// Resetor used when no reset pipeline is wired: it acknowledges and logs.
pub struct NoopResetor;

impl WorkflowResetor for NoopResetor {
    fn apply_reset_request(
        &self,
        _token: &CancellationToken,
        request: &ReplicateEventsRequest,
        current_run_id: RunId,
    ) -> Result<(), ReplicationError> {
        tracing::warn!(
            target: "repl",
            namespace_id = %request.namespace_id,
            workflow_id = %request.workflow_execution.workflow_id,
            current_run_id = %current_run_id,
            "reset request received but no resetor is wired"
        );
        Ok(())
    }

    fn reapply_to_closed_run(
        &self,
        _token: &CancellationToken,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: RunId,
        signals: Vec<HistoryEvent>,
    ) -> Result<(), ReplicationError> {
        tracing::warn!(
            target: "repl",
            namespace_id = %namespace_id,
            workflow_id = %workflow_id,
            run_id = %run_id,
            signal_count = signals.len(),
            "dropping signal reapply aimed at closed run; no resetor wired"
        );
        Ok(())
    }
}

enum VersionCheckOutcome {
    /// Proceed to append onto the (possibly rebuilt) mutable state.
    Continue,
    /// Fully handled inside version checking.
    Handled,
    /// Stale batch carrying signals for a closed target: reapply into the
    /// workflow's current run once the target lock is released.
    ReapplySignalsToCurrent(Vec<HistoryEvent>),
}

pub struct HistoryReplicator {
    shard_id: ShardId,
    cluster_metadata: Arc<ClusterMetadata>,
    namespace_cache: Arc<NamespaceCache>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    cache: Arc<ExecutionCache>,
    notifier: Arc<HistoryEventNotifier>,
    resetor: Arc<dyn WorkflowResetor>,
    state_builder: StateBuilder,
    limits: Limits,
}

impl HistoryReplicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: ShardId,
        cluster_metadata: Arc<ClusterMetadata>,
        namespace_cache: Arc<NamespaceCache>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        cache: Arc<ExecutionCache>,
        notifier: Arc<HistoryEventNotifier>,
        resetor: Arc<dyn WorkflowResetor>,
        limits: Limits,
    ) -> Self {
        let state_builder = StateBuilder::new(Arc::clone(&cluster_metadata));
        Self {
            shard_id,
            cluster_metadata,
            namespace_cache,
            execution_store,
            history_store,
            cache,
            notifier,
            resetor,
            state_builder,
            limits,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn execution_cache(&self) -> &Arc<ExecutionCache> {
        &self.cache
    }

    fn ops(&self) -> ContextOps<'_> {
        ContextOps {
            execution_store: self.execution_store.as_ref(),
            history_store: self.history_store.as_ref(),
            shard_id: self.shard_id,
        }
    }

    fn resolver(&self) -> ConflictResolver<'_> {
        ConflictResolver {
            history_store: self.history_store.as_ref(),
            state_builder: &self.state_builder,
            limits: &self.limits,
        }
    }

    /// Ingest one replicated batch. The single entry point of the v1
    /// replication protocol.
    pub fn apply_events(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsRequest,
    ) -> Result<(), ReplicationError> {
        let started_at = std::time::Instant::now();
        let result = self.apply_events_inner(token, request);
        metrics::repl_apply_duration(started_at.elapsed());
        result
    }

    fn apply_events_inner(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsRequest,
    ) -> Result<(), ReplicationError> {
        if token.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }
        if request.history.is_empty() {
            tracing::warn!(
                target: "repl",
                namespace_id = %request.namespace_id,
                workflow_id = %request.workflow_execution.workflow_id,
                "dropping replication request with empty history"
            );
            return Ok(());
        }

        let namespace = self
            .namespace_cache
            .get_namespace_by_id(&request.namespace_id)?;
        let batch = HistoryBatch::new(request.history.clone())?;
        let key = WorkflowKey::new(
            request.namespace_id.clone(),
            request.workflow_execution.workflow_id.clone(),
            request.workflow_execution.run_id,
        );

        if batch.starts_workflow() {
            return self.apply_start_event(token, &namespace, &key, request, &batch);
        }

        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock(token, &self.limits)?;
        match self.ops().load(&mut guard, &namespace) {
            Err(ExecutionStoreError::NotFound) => {
                drop(guard);
                self.apply_other_events_missing_mutable_state(
                    token, &namespace, &key, request, &batch,
                )
            }
            Err(err) => Err(err.into()),
            Ok(_) => {
                let outcome = self.apply_other_events_version_checking(
                    token, &mut guard, &namespace, request, &batch,
                )?;
                match outcome {
                    VersionCheckOutcome::Handled => Ok(()),
                    VersionCheckOutcome::Continue => {
                        self.apply_other_events(token, &mut guard, &namespace, request, &batch)
                    }
                    VersionCheckOutcome::ReapplySignalsToCurrent(signals) => {
                        let target_run = key.run_id;
                        drop(guard);
                        self.reapply_signals_to_current_run(
                            token,
                            &namespace,
                            &key.namespace_id,
                            &key.workflow_id,
                            target_run,
                            signals,
                        )
                    }
                }
            }
        }
    }

    // --- start-event replication and workflow-id reuse ---

    fn apply_start_event(
        &self,
        token: &CancellationToken,
        namespace: &Arc<NamespaceEntry>,
        key: &WorkflowKey,
        request: &ReplicateEventsRequest,
        batch: &HistoryBatch,
    ) -> Result<(), ReplicationError> {
        let mut state = MutableState::new(
            key.namespace_id.clone(),
            key.workflow_id.clone(),
            key.run_id,
            batch.first().version,
            namespace.config.retention_days,
        );
        let new_run_batch = optional_batch(&request.new_run_history)?;
        let applied = self.state_builder.apply_events(
            &mut state,
            Some(&request.source_cluster),
            batch,
            new_run_batch.as_ref(),
            namespace,
        )?;
        if applied.new_run.is_some() {
            tracing::warn!(
                target: "repl",
                run_id = %key.run_id,
                "start batch closes with continued-as-new; successor arrives by its own start event"
            );
        }

        let context = self.cache.get_or_create(key);
        let mut guard = context.lock(token, &self.limits)?;
        self.replicate_workflow_started(token, &mut guard, namespace, key, request, batch, state)
    }

    fn replicate_workflow_started(
        &self,
        token: &CancellationToken,
        guard: &mut ExecutionGuard<'_>,
        namespace: &Arc<NamespaceEntry>,
        key: &WorkflowKey,
        request: &ReplicateEventsRequest,
        batch: &HistoryBatch,
        mut state: MutableState,
    ) -> Result<(), ReplicationError> {
        let incoming_version = request.version;
        let now_ms = WallClock::now().ms();
        let (snapshot, events) =
            state.close_transaction_as_snapshot(now_ms, TransactionPolicy::Passive);
        let branch_token = snapshot.execution_info.branch_token.clone();
        for chunk in &events {
            self.history_store.append_history_nodes(
                &chunk.branch_token,
                &chunk.events,
                self.shard_id,
            )?;
        }

        let brand_new = CreateWorkflowExecutionRequest {
            namespace_id: key.namespace_id.clone(),
            workflow_id: key.workflow_id.clone(),
            mode: CreateMode::BrandNew,
            previous_run_id: None,
            previous_last_write_version: None,
            snapshot: snapshot.clone(),
        };
        let started = match self.execution_store.create_workflow_execution(brand_new) {
            Ok(()) => {
                self.finish_created_run(guard, state);
                return Ok(());
            }
            Err(ExecutionStoreError::AlreadyStarted(started)) => started,
            Err(err) => return Err(err.into()),
        };

        if started.run_id == key.run_id {
            // Idempotent redelivery of the start event.
            return Ok(());
        }

        if !started.state.is_running() {
            return self.start_against_closed_current(
                guard,
                key,
                incoming_version,
                &started,
                snapshot,
                state,
            );
        }
        self.start_against_running_current(
            token,
            guard,
            namespace,
            key,
            request,
            batch,
            &started,
            &branch_token,
            snapshot,
            state,
        )
    }

    fn finish_created_run(&self, guard: &mut ExecutionGuard<'_>, mut state: MutableState) {
        let condition = state.next_event_id().get();
        state.set_update_condition(condition);
        let notification = EventNotification {
            key: state.key().clone(),
            next_event_id: state.next_event_id(),
            last_event_task_id: state.execution_info().last_event_task_id,
            workflow_state: state.execution_info().state,
        };
        guard.install(state);
        self.notifier.notify(notification);
    }

    /// Closed current runs never version-race a new start: creation lands
    /// via workflow-id reuse even when the incoming version is older, since
    /// that combination arises from missed replication events plus
    /// failovers. The reuse fence on `(run_id, last_write_version)` still
    /// catches concurrent pointer changes.
    fn start_against_closed_current(
        &self,
        guard: &mut ExecutionGuard<'_>,
        key: &WorkflowKey,
        incoming_version: Version,
        started: &WorkflowAlreadyStarted,
        snapshot: crate::persistence::WorkflowSnapshot,
        state: MutableState,
    ) -> Result<(), ReplicationError> {
        if incoming_version < started.last_write_version {
            tracing::info!(
                target: "repl",
                workflow_id = %key.workflow_id,
                run_id = %key.run_id,
                incoming_version = %incoming_version,
                current_last_write_version = %started.last_write_version,
                "creating workflow with version below closed current run"
            );
        }
        let reuse = CreateWorkflowExecutionRequest {
            namespace_id: key.namespace_id.clone(),
            workflow_id: key.workflow_id.clone(),
            mode: CreateMode::WorkflowIdReuse,
            previous_run_id: Some(started.run_id),
            previous_last_write_version: Some(started.last_write_version),
            snapshot,
        };
        self.create_with_reuse(guard, key, reuse, state)
    }

    #[allow(clippy::too_many_arguments)]
    fn start_against_running_current(
        &self,
        token: &CancellationToken,
        guard: &mut ExecutionGuard<'_>,
        namespace: &Arc<NamespaceEntry>,
        key: &WorkflowKey,
        request: &ReplicateEventsRequest,
        batch: &HistoryBatch,
        started: &WorkflowAlreadyStarted,
        branch_token: &bytes::Bytes,
        snapshot: crate::persistence::WorkflowSnapshot,
        state: MutableState,
    ) -> Result<(), ReplicationError> {
        let incoming_version = request.version;
        let current_version = started.last_write_version;

        if incoming_version < current_version {
            self.history_store
                .delete_history_branch(branch_token, self.shard_id)?;
            metrics::repl_events_dropped_stale(1);
            let signals: Vec<HistoryEvent> = batch.signals().cloned().collect();
            if signals.is_empty() {
                return Ok(());
            }
            return self.reapply_signals_to_run(
                token,
                namespace,
                &key.namespace_id,
                &key.workflow_id,
                started.run_id,
                signals,
            );
        }

        if incoming_version == current_version {
            let current_key = WorkflowKey::new(
                key.namespace_id.clone(),
                key.workflow_id.clone(),
                started.run_id,
            );
            let current_context = self.cache.get_or_create(&current_key);
            let mut current_guard = current_context.lock(token, &self.limits)?;
            let current = self.ops().load(&mut current_guard, namespace)?;
            let out_of_order = batch.last().task_id <= current.execution_info().last_event_task_id;
            if out_of_order {
                self.history_store
                    .delete_history_branch(branch_token, self.shard_id)?;
                metrics::repl_events_dropped_stale(1);
                return Ok(());
            }
            metrics::repl_retry_emitted("existing_workflow");
            return Err(ReplicationError::retry_task(
                ERR_RETRY_EXISTING_WORKFLOW,
                key.namespace_id.clone(),
                key.workflow_id.clone(),
                Some(started.run_id),
                Some(current.next_event_id()),
            ));
        }

        // incoming > current: the incoming run wins; terminate the current
        // run, then land the new one via workflow-id reuse.
        self.terminate_run(
            token,
            namespace,
            &key.namespace_id,
            &key.workflow_id,
            started.run_id,
            incoming_version,
        )?;
        let reuse = CreateWorkflowExecutionRequest {
            namespace_id: key.namespace_id.clone(),
            workflow_id: key.workflow_id.clone(),
            mode: CreateMode::WorkflowIdReuse,
            previous_run_id: Some(started.run_id),
            previous_last_write_version: Some(current_version),
            snapshot,
        };
        self.create_with_reuse(guard, key, reuse, state)
    }

    /// Land a run via workflow-id reuse. A concurrent takeover by another
    /// incoming run surfaces as a fresh `AlreadyStarted`; that converts to
    /// a resend hint rather than escaping as a store error.
    fn create_with_reuse(
        &self,
        guard: &mut ExecutionGuard<'_>,
        key: &WorkflowKey,
        request: CreateWorkflowExecutionRequest,
        state: MutableState,
    ) -> Result<(), ReplicationError> {
        match self.execution_store.create_workflow_execution(request) {
            Ok(()) => {
                self.finish_created_run(guard, state);
                Ok(())
            }
            Err(ExecutionStoreError::AlreadyStarted(other)) if other.run_id == key.run_id => {
                Ok(())
            }
            Err(ExecutionStoreError::AlreadyStarted(other)) => {
                metrics::repl_retry_emitted("existing_workflow");
                Err(ReplicationError::retry_task(
                    ERR_RETRY_EXISTING_WORKFLOW,
                    key.namespace_id.clone(),
                    key.workflow_id.clone(),
                    Some(other.run_id),
                    None,
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    // --- missing-mutable-state path ---

    fn apply_other_events_missing_mutable_state(
        &self,
        token: &CancellationToken,
        namespace: &Arc<NamespaceEntry>,
        key: &WorkflowKey,
        request: &ReplicateEventsRequest,
        batch: &HistoryBatch,
    ) -> Result<(), ReplicationError> {
        let incoming_version = batch.first().version;

        let current = match self
            .execution_store
            .get_current_execution(&key.namespace_id, &key.workflow_id)
        {
            Ok(current) => current,
            Err(ExecutionStoreError::NotFound) => {
                metrics::repl_retry_emitted("workflow_not_found");
                return Err(ReplicationError::retry_task(
                    ERR_WORKFLOW_NOT_FOUND,
                    key.namespace_id.clone(),
                    key.workflow_id.clone(),
                    Some(key.run_id),
                    Some(EventId::FIRST),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let current_key = WorkflowKey::new(
            key.namespace_id.clone(),
            key.workflow_id.clone(),
            current.run_id,
        );
        let current_context = self.cache.get_or_create(&current_key);
        let mut current_guard = current_context.lock(token, &self.limits)?;
        let current_state = self.ops().load(&mut current_guard, namespace)?;
        let current_version = current_state.last_write_version();
        let current_next_event_id = current_state.next_event_id();
        let current_last_task_id = current_state.execution_info().last_event_task_id;
        let current_running = current_state.is_running();

        if current_version > incoming_version {
            // Stale events for an unknown run; salvage the signals.
            let signals: Vec<HistoryEvent> = batch.signals().cloned().collect();
            if signals.is_empty() {
                metrics::repl_events_dropped_stale(batch.events().len());
                return Ok(());
            }
            if current_running {
                let applied =
                    self.reapply_signals_into(&mut current_guard, namespace, signals)?;
                metrics::repl_signals_reapplied(applied);
                return Ok(());
            }
            drop(current_guard);
            return self.resetor.reapply_to_closed_run(
                token,
                &key.namespace_id,
                &key.workflow_id,
                current.run_id,
                signals,
            );
        }

        if current_version == incoming_version && current_running {
            if batch.last().task_id <= current_last_task_id {
                // Late redelivery of something the current run already saw.
                metrics::repl_events_dropped_stale(batch.events().len());
                return Ok(());
            }
            metrics::repl_retry_emitted("workflow_not_found");
            return Err(ReplicationError::retry_task(
                ERR_WORKFLOW_NOT_FOUND,
                key.namespace_id.clone(),
                key.workflow_id.clone(),
                Some(current.run_id),
                Some(current_next_event_id),
            ));
        }

        if current_running {
            // incoming > current: the incoming run supersedes the current
            // one. Kill it, then ask the peer to resend from the start
            // event so the run can be created whole.
            drop(current_guard);
            self.terminate_run(
                token,
                namespace,
                &key.namespace_id,
                &key.workflow_id,
                current.run_id,
                incoming_version,
            )?;
            metrics::repl_retry_emitted("workflow_not_found");
            return Err(ReplicationError::retry_task(
                ERR_WORKFLOW_NOT_FOUND,
                key.namespace_id.clone(),
                key.workflow_id.clone(),
                Some(key.run_id),
                Some(EventId::FIRST),
            ));
        }

        drop(current_guard);
        if request.reset_workflow {
            return self
                .resetor
                .apply_reset_request(token, request, current.run_id);
        }
        metrics::repl_retry_emitted("workflow_not_found");
        Err(ReplicationError::retry_task(
            ERR_WORKFLOW_NOT_FOUND,
            key.namespace_id.clone(),
            key.workflow_id.clone(),
            Some(key.run_id),
            Some(EventId::FIRST),
        ))
    }

    // --- version checking (target run known) ---

    fn apply_other_events_version_checking(
        &self,
        token: &CancellationToken,
        guard: &mut ExecutionGuard<'_>,
        namespace: &Arc<NamespaceEntry>,
        request: &ReplicateEventsRequest,
        batch: &HistoryBatch,
    ) -> Result<VersionCheckOutcome, ReplicationError> {
        let incoming_version = request.version;
        let state = guard.cached().expect("version checking requires state");
        let last_write_version = state.last_write_version();
        let last_write_event_id = state.replication_state().last_write_event_id;

        if last_write_version > incoming_version {
            return self.handle_stale_batch(guard, namespace, batch);
        }
        if last_write_version == incoming_version {
            return Ok(VersionCheckOutcome::Continue);
        }

        // incoming > current: detect and resolve divergence. Only the
        // two-cluster protocol is supported.
        let previous_active = self
            .cluster_metadata
            .cluster_name_for_failover_version(last_write_version)?
            .clone();
        let current_cluster = self.cluster_metadata.current_cluster_name().clone();

        if previous_active != current_cluster {
            if self
                .cluster_metadata
                .is_version_from_same_cluster(incoming_version, last_write_version)
            {
                // The same remote kept authoring across the version bump.
                return Ok(VersionCheckOutcome::Continue);
            }
            tracing::error!(
                target: "repl",
                run_id = %state.run_id(),
                incoming_version = %incoming_version,
                last_write_version = %last_write_version,
                previous_active = %previous_active,
                "three-way failover conflict"
            );
            return Err(ReplicationError::MoreThanTwoActiveClusters);
        }

        // We were the previous authority; decide against what the peer
        // claims to have seen from us.
        let remote_claim = request.replication_info.get(&current_cluster).copied();
        match remote_claim {
            Some(claim) if claim.version > last_write_version => {
                Err(ReplicationError::ImpossibleRemoteClaim {
                    claimed: claim.version,
                    last_write: last_write_version,
                })
            }
            Some(claim) if claim.version == last_write_version => {
                if claim.last_event_id > last_write_event_id {
                    return Err(ReplicationError::CorruptedReplicationInfo {
                        claimed_event_id: claim.last_event_id,
                        last_write_event_id,
                    });
                }
                if claim.last_event_id == last_write_event_id {
                    let state = guard.cached_mut().expect("state loaded");
                    if !state.has_buffered_events() {
                        // Peer saw everything we wrote; nothing to unwind.
                        return Ok(VersionCheckOutcome::Continue);
                    }
                    self.flush_buffered_events(guard, namespace)?;
                }
                self.reset_to_checkpoint(token, guard, namespace, batch, claim.last_event_id)?;
                Ok(VersionCheckOutcome::Continue)
            }
            _ => {
                // Claim absent or older than our last write: the peer never
                // saw our tail. Cut back to the freshest checkpoint either
                // side can prove.
                let incoming_cluster = self
                    .cluster_metadata
                    .cluster_name_for_failover_version(incoming_version)?
                    .clone();
                let state = guard.cached().expect("state loaded");
                let local_entry = state.replication_state().info_for(&incoming_cluster);
                let checkpoint = latest_checkpoint(remote_claim, local_entry)
                    .ok_or(ReplicationError::MissingReplicationCheckpoint)?;
                self.reset_to_checkpoint(
                    token,
                    guard,
                    namespace,
                    batch,
                    checkpoint.last_event_id,
                )?;
                Ok(VersionCheckOutcome::Continue)
            }
        }
    }

    fn handle_stale_batch(
        &self,
        guard: &mut ExecutionGuard<'_>,
        namespace: &Arc<NamespaceEntry>,
        batch: &HistoryBatch,
    ) -> Result<VersionCheckOutcome, ReplicationError> {
        let state = guard.cached().expect("state loaded");
        let signals: Vec<HistoryEvent> = batch.signals().cloned().collect();
        if state.is_running() {
            if signals.is_empty() {
                metrics::repl_events_dropped_stale(batch.events().len());
                return Ok(VersionCheckOutcome::Handled);
            }
            let applied = self.reapply_signals_into(guard, namespace, signals)?;
            metrics::repl_signals_reapplied(applied);
            return Ok(VersionCheckOutcome::Handled);
        }
        if signals.is_empty() {
            metrics::repl_events_dropped_stale(batch.events().len());
            return Ok(VersionCheckOutcome::Handled);
        }
        Ok(VersionCheckOutcome::ReapplySignalsToCurrent(signals))
    }

    /// Flush buffered events by failing the in-flight decision, committing
    /// as active, and scheduling a replacement decision.
    fn flush_buffered_events(
        &self,
        guard: &mut ExecutionGuard<'_>,
        _namespace: &Arc<NamespaceEntry>,
    ) -> Result<(), ReplicationError> {
        let state = guard.cached_mut().expect("state loaded");
        let last_write_version = state.last_write_version();
        state.update_current_version(last_write_version, true);
        state
            .add_decision_task_failed(
                crate::core::DecisionFailCause::FailoverCloseDecision,
                WORKFLOW_TERMINATION_IDENTITY.to_string(),
            )
            .map_err(map_mutable_state_error)?;
        if !state.has_pending_decision() {
            state
                .add_decision_task_scheduled(false)
                .map_err(map_mutable_state_error)?;
        }
        let now_ms = WallClock::now().ms();
        self.ops().update_as_active(guard, now_ms)?;
        self.notify_for(guard);
        Ok(())
    }

    fn reset_to_checkpoint(
        &self,
        token: &CancellationToken,
        guard: &mut ExecutionGuard<'_>,
        namespace: &Arc<NamespaceEntry>,
        batch: &HistoryBatch,
        replay_until: EventId,
    ) -> Result<(), ReplicationError> {
        let incoming_version = batch.first().version;
        let incoming_timestamp = batch.last().timestamp_ms;
        let fence = self.terminate_current_if_not_self(
            token,
            guard,
            namespace,
            incoming_version,
            incoming_timestamp,
        )?;

        let state = guard.cached().expect("state loaded");
        let key = state.key().clone();
        let branch_token = state.current_branch_token().clone();
        let prior_info = state.replication_state().last_replication_info.clone();
        let update_condition = state.update_condition();

        let rebuilt = self.resolver().reset(
            token,
            namespace,
            &key,
            &branch_token,
            replay_until,
            &fence,
            prior_info,
            update_condition,
        )?;
        guard.install(rebuilt);
        Ok(())
    }

    /// Before resetting a closed target, make sure no *other* running run
    /// with a lower version survives to contend for the current pointer.
    fn terminate_current_if_not_self(
        &self,
        token: &CancellationToken,
        guard: &ExecutionGuard<'_>,
        namespace: &Arc<NamespaceEntry>,
        incoming_version: Version,
        _incoming_timestamp_ms: u64,
    ) -> Result<ResetFence, ReplicationError> {
        let state = guard.cached().expect("state loaded");
        if state.is_running() {
            return Ok(ResetFence {
                prev_run_id: Some(state.run_id()),
                prev_last_write_version: state.last_write_version(),
                prev_state: state.execution_info().state,
            });
        }

        let key = state.key().clone();
        let current = self
            .execution_store
            .get_current_execution(&key.namespace_id, &key.workflow_id)?;
        if !current.state.is_running() {
            return Ok(ResetFence {
                prev_run_id: Some(current.run_id),
                prev_last_write_version: current.last_write_version,
                prev_state: current.state,
            });
        }
        if current.last_write_version < incoming_version {
            self.terminate_run(
                token,
                namespace,
                &key.namespace_id,
                &key.workflow_id,
                current.run_id,
                incoming_version,
            )?;
            return Ok(ResetFence {
                prev_run_id: Some(current.run_id),
                prev_last_write_version: current.last_write_version,
                prev_state: WorkflowState::Completed,
            });
        }
        // The running current run outranks the incoming version; nothing to
        // terminate, and no fence to claim.
        Ok(ResetFence {
            prev_run_id: None,
            prev_last_write_version: Version::new(0),
            prev_state: WorkflowState::Created,
        })
    }

    // --- append path ---

    fn apply_other_events(
        &self,
        _token: &CancellationToken,
        guard: &mut ExecutionGuard<'_>,
        namespace: &Arc<NamespaceEntry>,
        request: &ReplicateEventsRequest,
        batch: &HistoryBatch,
    ) -> Result<(), ReplicationError> {
        let state = guard.cached().expect("append requires state");
        let local_next = state.next_event_id();
        let first = batch.first_event_id();
        let key = state.key().clone();

        if first < local_next {
            tracing::debug!(
                target: "repl",
                run_id = %key.run_id,
                first_event_id = %first,
                local_next_event_id = %local_next,
                "dropping duplicate replication batch"
            );
            metrics::repl_events_dropped_stale(batch.events().len());
            return Ok(());
        }

        if first > local_next {
            if !state.is_running() {
                tracing::warn!(
                    target: "repl",
                    run_id = %key.run_id,
                    force_buffer_events = request.force_buffer_events,
                    "gap in events for closed workflow; dropping"
                );
                return Ok(());
            }
            metrics::repl_retry_emitted("buffer_events");
            return Err(ReplicationError::retry_task(
                ERR_RETRY_BUFFER_EVENTS,
                key.namespace_id.clone(),
                key.workflow_id.clone(),
                Some(key.run_id),
                Some(local_next),
            ));
        }

        self.apply_replication_task(guard, namespace, request, batch)
    }

    fn apply_replication_task(
        &self,
        guard: &mut ExecutionGuard<'_>,
        namespace: &Arc<NamespaceEntry>,
        request: &ReplicateEventsRequest,
        batch: &HistoryBatch,
    ) -> Result<(), ReplicationError> {
        let state = guard.cached_mut().expect("append requires state");
        if !state.is_running() {
            tracing::warn!(
                target: "repl",
                run_id = %state.run_id(),
                "workflow already closed by conflict resolution; dropping batch"
            );
            return Ok(());
        }

        let new_run_batch = optional_batch(&request.new_run_history)?;
        let applied = self.state_builder.apply_events(
            state,
            Some(&request.source_cluster),
            batch,
            new_run_batch.as_ref(),
            namespace,
        )?;

        let now_ms = WallClock::now().ms();
        self.ops().update_as_passive(guard, now_ms)?;
        self.notify_for(guard);
        metrics::repl_events_applied(batch.events().len());

        if let Some(new_run) = applied.new_run {
            self.create_continued_run(guard, new_run, now_ms)?;
        }
        Ok(())
    }

    /// Land the continued-as-new run produced by the batch that closed the
    /// predecessor. Reuses the workflow-id pointer fenced on the closed run.
    fn create_continued_run(
        &self,
        guard: &ExecutionGuard<'_>,
        mut new_run: MutableState,
        now_ms: u64,
    ) -> Result<(), ReplicationError> {
        let closed = guard.cached().expect("predecessor state");
        let key = closed.key().clone();
        let (snapshot, events) =
            new_run.close_transaction_as_snapshot(now_ms, TransactionPolicy::Passive);
        for chunk in &events {
            self.history_store.append_history_nodes(
                &chunk.branch_token,
                &chunk.events,
                self.shard_id,
            )?;
        }
        let create = CreateWorkflowExecutionRequest {
            namespace_id: key.namespace_id.clone(),
            workflow_id: key.workflow_id.clone(),
            mode: CreateMode::WorkflowIdReuse,
            previous_run_id: Some(key.run_id),
            previous_last_write_version: Some(closed.last_write_version()),
            snapshot,
        };
        match self.execution_store.create_workflow_execution(create) {
            Ok(()) => Ok(()),
            Err(ExecutionStoreError::AlreadyStarted(started))
                if started.run_id == new_run.run_id() =>
            {
                // Redelivered continued-as-new; the successor already exists.
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // --- signal reapplication ---

    fn reapply_signals_to_current_run(
        &self,
        token: &CancellationToken,
        namespace: &Arc<NamespaceEntry>,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        origin_run_id: RunId,
        signals: Vec<HistoryEvent>,
    ) -> Result<(), ReplicationError> {
        let current = self
            .execution_store
            .get_current_execution(namespace_id, workflow_id)?;
        if current.run_id == origin_run_id || !current.state.is_running() {
            return self.resetor.reapply_to_closed_run(
                token,
                namespace_id,
                workflow_id,
                current.run_id,
                signals,
            );
        }
        self.reapply_signals_to_run(
            token,
            namespace,
            namespace_id,
            workflow_id,
            current.run_id,
            signals,
        )
    }

    fn reapply_signals_to_run(
        &self,
        token: &CancellationToken,
        namespace: &Arc<NamespaceEntry>,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: RunId,
        signals: Vec<HistoryEvent>,
    ) -> Result<(), ReplicationError> {
        let key = WorkflowKey::new(namespace_id.clone(), workflow_id.clone(), run_id);
        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock(token, &self.limits)?;
        self.ops().load(&mut guard, namespace)?;
        let applied = self.reapply_signals_into(&mut guard, namespace, signals)?;
        metrics::repl_signals_reapplied(applied);
        Ok(())
    }

    /// Append the signal events to the locked run and commit as active:
    /// this cluster takes ownership of the signals even though a peer
    /// authored them.
    fn reapply_signals_into(
        &self,
        guard: &mut ExecutionGuard<'_>,
        _namespace: &Arc<NamespaceEntry>,
        signals: Vec<HistoryEvent>,
    ) -> Result<usize, ReplicationError> {
        let state = guard.cached_mut().expect("signal target loaded");
        let last_write_version = state.last_write_version();
        state.update_current_version(last_write_version, true);

        let mut applied = 0usize;
        for signal in signals {
            let crate::core::EventAttributes::Signaled(attributes) = signal.attributes else {
                continue;
            };
            state
                .add_workflow_execution_signaled(
                    attributes.signal_name,
                    attributes.input,
                    attributes.identity,
                )
                .map_err(map_mutable_state_error)?;
            applied += 1;
        }
        if applied == 0 {
            return Ok(0);
        }
        if !state.has_pending_decision() {
            state
                .add_decision_task_scheduled(false)
                .map_err(map_mutable_state_error)?;
        }
        let now_ms = WallClock::now().ms();
        self.ops().update_as_active(guard, now_ms)?;
        self.notify_for(guard);
        Ok(applied)
    }

    // --- shared helpers ---

    /// Terminate a running run under this cluster's authority. Used when a
    /// higher-versioned incoming run supersedes it.
    fn terminate_run(
        &self,
        token: &CancellationToken,
        namespace: &Arc<NamespaceEntry>,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: RunId,
        incoming_version: Version,
    ) -> Result<(), ReplicationError> {
        let key = WorkflowKey::new(namespace_id.clone(), workflow_id.clone(), run_id);
        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock(token, &self.limits)?;
        let state = self.ops().load(&mut guard, namespace)?;
        if !state.is_running() {
            return Ok(());
        }
        let own_version = state.last_write_version();
        state.update_current_version(own_version, true);
        state
            .add_workflow_execution_terminated(
                WORKFLOW_TERMINATION_REASON.to_string(),
                Some(serde_json::json!({ "superseding_version": incoming_version.get() })),
                WORKFLOW_TERMINATION_IDENTITY.to_string(),
            )
            .map_err(map_mutable_state_error)?;
        let now_ms = WallClock::now().ms();
        self.ops().update_as_active(&mut guard, now_ms)?;
        self.notify_for(&guard);
        metrics::repl_workflow_terminated();
        tracing::info!(
            target: "repl",
            namespace_id = %namespace_id,
            workflow_id = %workflow_id,
            run_id = %run_id,
            incoming_version = %incoming_version,
            "terminated running workflow superseded by replication"
        );
        Ok(())
    }

    fn notify_for(&self, guard: &ExecutionGuard<'_>) {
        if let Some(state) = guard.cached() {
            self.notifier.notify(EventNotification {
                key: state.key().clone(),
                next_event_id: state.next_event_id(),
                last_event_task_id: state.execution_info().last_event_task_id,
                workflow_state: state.execution_info().state,
            });
        }
    }

    // --- auxiliary service surface ---

    /// Externally requested signal reapplication. Targets the named run if
    /// it is still running, the workflow's current run otherwise.
    pub fn reapply_events(
        &self,
        token: &CancellationToken,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: RunId,
        events: Vec<HistoryEvent>,
    ) -> Result<(), ReplicationError> {
        let signals: Vec<HistoryEvent> =
            events.into_iter().filter(HistoryEvent::is_signal).collect();
        if signals.is_empty() {
            return Ok(());
        }
        let namespace = self.namespace_cache.get_namespace_by_id(namespace_id)?;

        let key = WorkflowKey::new(namespace_id.clone(), workflow_id.clone(), run_id);
        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock(token, &self.limits)?;
        let target_running = match self.ops().load(&mut guard, &namespace) {
            Ok(state) => state.is_running(),
            Err(ExecutionStoreError::NotFound) => false,
            Err(err) => return Err(err.into()),
        };
        if target_running {
            let applied = self.reapply_signals_into(&mut guard, &namespace, signals)?;
            metrics::repl_signals_reapplied(applied);
            return Ok(());
        }
        drop(guard);
        self.reapply_signals_to_current_run(
            token,
            &namespace,
            namespace_id,
            workflow_id,
            run_id,
            signals,
        )
    }

    /// Synchronize one activity's live state without replaying its events.
    pub fn sync_activity(
        &self,
        token: &CancellationToken,
        request: &crate::api::requests::SyncActivityRequest,
    ) -> Result<(), ReplicationError> {
        if token.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }
        let namespace = self
            .namespace_cache
            .get_namespace_by_id(&request.namespace_id)?;
        let key = WorkflowKey::new(
            request.namespace_id.clone(),
            request.workflow_id.clone(),
            request.run_id,
        );
        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock(token, &self.limits)?;
        let state = match self.ops().load(&mut guard, &namespace) {
            Ok(state) => state,
            Err(ExecutionStoreError::NotFound) => {
                metrics::repl_retry_emitted("workflow_not_found");
                return Err(ReplicationError::retry_task(
                    ERR_WORKFLOW_NOT_FOUND,
                    key.namespace_id,
                    key.workflow_id,
                    Some(key.run_id),
                    Some(EventId::FIRST),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        if !state.is_running() {
            return Ok(());
        }
        if request.version < state.last_write_version() {
            metrics::repl_events_dropped_stale(1);
            return Ok(());
        }
        if request.scheduled_id >= state.next_event_id() {
            // The schedule event has not replicated yet.
            let hint = state.next_event_id();
            metrics::repl_retry_emitted("buffer_events");
            return Err(ReplicationError::retry_task(
                ERR_RETRY_BUFFER_EVENTS,
                key.namespace_id,
                key.workflow_id,
                Some(key.run_id),
                Some(hint),
            ));
        }

        state.update_current_version(request.version, false);
        state.upsert_activity(crate::core::ActivityInfo {
            version: request.version,
            schedule_id: request.scheduled_id,
            scheduled_time_ms: request.scheduled_time_ms,
            started_id: request.started_id,
            started_time_ms: request.started_time_ms,
            last_heartbeat_ms: request.last_heartbeat_ms,
            details: request.details.clone(),
            attempt: request.attempt,
            last_failure: request.last_failure.clone(),
            last_worker_identity: request.last_worker_identity.clone(),
        });
        let now_ms = WallClock::now().ms();
        self.ops().update_as_passive(&mut guard, now_ms)?;
        Ok(())
    }

    /// Re-emit the queue task for a pending decision, after a task loss.
    pub fn refresh_tasks(
        &self,
        token: &CancellationToken,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: RunId,
    ) -> Result<(), ReplicationError> {
        let namespace = self.namespace_cache.get_namespace_by_id(namespace_id)?;
        let key = WorkflowKey::new(namespace_id.clone(), workflow_id.clone(), run_id);
        let context = self.cache.get_or_create(&key);
        let mut guard = context.lock(token, &self.limits)?;
        let state = self.ops().load(&mut guard, &namespace)?;
        if !state.regenerate_pending_decision_task() {
            return Ok(());
        }
        let now_ms = WallClock::now().ms();
        self.ops().update_as_passive(&mut guard, now_ms)?;
        Ok(())
    }

    /// Snapshot of the run's poll-visible state.
    pub fn read_mutable_state(
        &self,
        token: &CancellationToken,
        key: &WorkflowKey,
    ) -> Result<MutableStateView, ReplicationError> {
        let namespace = self.namespace_cache.get_namespace_by_id(&key.namespace_id)?;
        let context = self.cache.get_or_create(key);
        let mut guard = context.lock(token, &self.limits)?;
        let state = self.ops().load(&mut guard, &namespace)?;
        Ok(MutableStateView {
            next_event_id: state.next_event_id(),
            last_event_task_id: state.execution_info().last_event_task_id,
            workflow_state: state.execution_info().state,
            branch_token: state.current_branch_token().clone(),
            last_write_version: state.last_write_version(),
        })
    }
}

/// Poll-visible projection of a run's mutable state.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableStateView {
    pub next_event_id: EventId,
    pub last_event_task_id: crate::core::TaskId,
    pub workflow_state: WorkflowState,
    pub branch_token: bytes::Bytes,
    pub last_write_version: Version,
}

fn optional_batch(events: &[HistoryEvent]) -> Result<Option<HistoryBatch>, ReplicationError> {
    if events.is_empty() {
        Ok(None)
    } else {
        Ok(Some(HistoryBatch::new(events.to_vec())?))
    }
}

/// The freshest `(version, event_id)` fact provable by either side's
/// replication info; the conflict-resolution cut point.
fn latest_checkpoint(
    remote: Option<ReplicationInfo>,
    local: Option<ReplicationInfo>,
) -> Option<ReplicationInfo> {
    match (remote, local) {
        (Some(a), Some(b)) => Some(if b.version > a.version { b } else { a }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: i64, event_id: i64) -> ReplicationInfo {
        ReplicationInfo::new(Version::new(version), EventId::new(event_id))
    }

    #[test]
    fn latest_checkpoint_prefers_higher_version() {
        assert_eq!(
            latest_checkpoint(Some(info(90, 945)), Some(info(100, 965))),
            Some(info(100, 965))
        );
        assert_eq!(
            latest_checkpoint(Some(info(100, 965)), Some(info(90, 945))),
            Some(info(100, 965))
        );
        assert_eq!(latest_checkpoint(None, Some(info(1, 2))), Some(info(1, 2)));
        assert_eq!(latest_checkpoint(Some(info(1, 2)), None), Some(info(1, 2)));
        assert_eq!(latest_checkpoint(None, None), None);
    }
}
