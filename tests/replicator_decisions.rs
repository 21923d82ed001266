//! Reconciliation decision tables: missing mutable state, version checking,
//! duplicate/gap handling, and conflict resolution.

mod fixtures;

use fixtures::*;
use strand::core::{EventId, EventType, RunId, Version, WorkflowState};
use strand::history::{
    DlqStore, ERR_RETRY_BUFFER_EVENTS, ERR_WORKFLOW_NOT_FOUND, ReplicationError,
};

#[test]
fn unknown_workflow_asks_for_start_event() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();

    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(5, 2, 10, EventType::DecisionTaskScheduled)],
    )
    .build();
    let err = rig
        .service
        .replicate_events(&rig.token, &request)
        .unwrap_err();

    let ReplicationError::RetryTask(retry) = err else {
        panic!("expected retry task, got {err:?}");
    };
    assert_eq!(retry.message, ERR_WORKFLOW_NOT_FOUND);
    assert_eq!(retry.next_event_id, Some(EventId::FIRST));
}

#[test]
fn unknown_run_with_stale_version_drops_non_signal_events() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let current_run = RunId::generate();
    rig.seed_run(&workflow, current_run, &[started_event(12, 1)]);

    let unknown_run = RunId::generate();
    let request = RequestBuilder::new(
        &workflow,
        unknown_run,
        vec![plain_event(5, 2, 10, EventType::WorkflowExecutionCanceled)],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    // current untouched
    let state = rig.stored_state(&workflow, current_run);
    assert_eq!(state.next_event_id(), EventId::new(2));
}

#[test]
fn unknown_run_with_stale_signals_reapplies_into_current() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let current_run = RunId::generate();
    // running, lastWriteVersion 12, no pending decision
    rig.seed_run(
        &workflow,
        current_run,
        &[
            started_event(12, 1),
            plain_event(2, 12, 2, EventType::DecisionTaskScheduled),
            plain_event(3, 12, 3, EventType::DecisionTaskStarted),
            plain_event(4, 12, 4, EventType::DecisionTaskCompleted),
        ],
    );

    let unknown_run = RunId::generate();
    let request = RequestBuilder::new(
        &workflow,
        unknown_run,
        vec![signal_event(5, 2, "cancel", "alice")],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    // signal + decision-scheduled landed on the current run
    let state = rig.stored_state(&workflow, current_run);
    assert_eq!(state.next_event_id(), EventId::new(7));
    assert!(state.has_pending_decision());
}

#[test]
fn unknown_run_with_equal_version_gets_hint_at_current_tail() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let current_run = RunId::generate();
    rig.seed_run(&workflow, current_run, &[started_event(12, 5)]);

    let unknown_run = RunId::generate();
    let request = RequestBuilder::new(
        &workflow,
        unknown_run,
        vec![plain_event(5, 12, 50, EventType::DecisionTaskScheduled)],
    )
    .build();
    let err = rig
        .service
        .replicate_events(&rig.token, &request)
        .unwrap_err();

    let ReplicationError::RetryTask(retry) = err else {
        panic!("expected retry task, got {err:?}");
    };
    assert_eq!(retry.message, ERR_WORKFLOW_NOT_FOUND);
    assert_eq!(retry.run_id, Some(current_run));
    assert_eq!(retry.next_event_id, Some(EventId::new(2)));
}

#[test]
fn unknown_run_with_equal_version_out_of_order_is_dropped() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let current_run = RunId::generate();
    rig.seed_run(&workflow, current_run, &[started_event(12, 50)]);

    let unknown_run = RunId::generate();
    // task id 5 is behind the current run's last task id 50
    let request = RequestBuilder::new(
        &workflow,
        unknown_run,
        vec![plain_event(5, 12, 5, EventType::DecisionTaskScheduled)],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();
}

#[test]
fn unknown_run_with_higher_version_terminates_current_and_retries() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let current_run = RunId::generate();
    rig.seed_run(&workflow, current_run, &[started_event(2, 1)]);

    let unknown_run = RunId::generate();
    let request = RequestBuilder::new(
        &workflow,
        unknown_run,
        vec![plain_event(5, 12, 10, EventType::DecisionTaskScheduled)],
    )
    .build();
    let err = rig
        .service
        .replicate_events(&rig.token, &request)
        .unwrap_err();

    let ReplicationError::RetryTask(retry) = err else {
        panic!("expected retry task, got {err:?}");
    };
    assert_eq!(retry.message, ERR_WORKFLOW_NOT_FOUND);
    assert_eq!(retry.run_id, Some(unknown_run));
    assert_eq!(retry.next_event_id, Some(EventId::FIRST));

    // the current run was terminated on the way out
    let state = rig.stored_state(&workflow, current_run);
    assert_eq!(state.execution_info().state, WorkflowState::Completed);
}

#[test]
fn reset_request_routes_to_resetor_when_current_closed() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let current_run = RunId::generate();
    rig.seed_run(
        &workflow,
        current_run,
        &[
            started_event(2, 1),
            plain_event(2, 2, 2, EventType::WorkflowExecutionCompleted),
        ],
    );

    let unknown_run = RunId::generate();
    let request = RequestBuilder::new(
        &workflow,
        unknown_run,
        vec![plain_event(5, 12, 10, EventType::DecisionTaskScheduled)],
    )
    .reset_workflow()
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    assert_eq!(
        rig.resetor.reset_requests.lock().unwrap().as_slice(),
        &[current_run]
    );
}

#[test]
fn duplicate_batch_is_dropped() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    rig.seed_run(
        &workflow,
        run,
        &[started_event(2, 1), plain_event(2, 2, 2, EventType::DecisionTaskScheduled)],
    );

    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(2, 2, 2, EventType::DecisionTaskScheduled)],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let state = rig.stored_state(&workflow, run);
    assert_eq!(state.next_event_id(), EventId::new(3));
}

#[test]
fn gap_in_events_returns_buffer_hint() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    rig.seed_run(&workflow, run, &[started_event(2, 1)]);

    // local next is 2; events 60..65 leave a gap
    let request = RequestBuilder::new(
        &workflow,
        run,
        (60..65)
            .map(|id| plain_event(id, 2, id, EventType::ActivityTaskScheduled))
            .collect(),
    )
    .build();
    let err = rig
        .service
        .replicate_events(&rig.token, &request)
        .unwrap_err();

    let ReplicationError::RetryTask(retry) = err else {
        panic!("expected retry task, got {err:?}");
    };
    assert_eq!(retry.message, ERR_RETRY_BUFFER_EVENTS);
    assert_eq!(retry.run_id, Some(run));
    assert_eq!(retry.next_event_id, Some(EventId::new(2)));
}

#[test]
fn gap_against_closed_run_is_dropped() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    rig.seed_run(
        &workflow,
        run,
        &[
            started_event(2, 1),
            plain_event(2, 2, 2, EventType::WorkflowExecutionCompleted),
        ],
    );

    let mut request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(9, 2, 9, EventType::DecisionTaskScheduled)],
    )
    .build();
    request.force_buffer_events = true;
    rig.service.replicate_events(&rig.token, &request).unwrap();
}

#[test]
fn contiguous_batch_appends_and_advances() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    rig.seed_run(&workflow, run, &[started_event(2, 1)]);

    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![
            plain_event(2, 2, 5, EventType::DecisionTaskScheduled),
            plain_event(3, 2, 6, EventType::DecisionTaskStarted),
            plain_event(4, 2, 7, EventType::DecisionTaskCompleted),
        ],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let state = rig.stored_state(&workflow, run);
    assert_eq!(state.next_event_id(), EventId::new(5));
    assert_eq!(
        state.replication_state().last_write_event_id,
        EventId::new(4)
    );
    // invariant 1 after commit
    assert_eq!(
        state.next_event_id().get() - 1,
        state.replication_state().last_write_event_id.get()
    );

    // replaying the identical request is a no-op (idempotence)
    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![
            plain_event(2, 2, 5, EventType::DecisionTaskScheduled),
            plain_event(3, 2, 6, EventType::DecisionTaskStarted),
            plain_event(4, 2, 7, EventType::DecisionTaskCompleted),
        ],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();
    let replayed = rig.stored_state(&workflow, run);
    assert_eq!(replayed.next_event_id(), EventId::new(5));
}

#[test]
fn stale_known_run_signal_reapplies_into_itself_while_running() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    rig.seed_run(
        &workflow,
        run,
        &[
            started_event(12, 1),
            plain_event(2, 12, 2, EventType::DecisionTaskScheduled),
            plain_event(3, 12, 3, EventType::DecisionTaskStarted),
            plain_event(4, 12, 4, EventType::DecisionTaskCompleted),
        ],
    );

    // stale version 2 carrying a signal for the same (running) run
    let request =
        RequestBuilder::new(&workflow, run, vec![signal_event(9, 2, "nudge", "bob")]).build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let state = rig.stored_state(&workflow, run);
    assert_eq!(state.next_event_id(), EventId::new(7));
    assert!(state.has_pending_decision());

    // signals have no dedup key: a second delivery appends again
    rig.service.replicate_events(&rig.token, &request).unwrap();
    let state = rig.stored_state(&workflow, run);
    assert_eq!(state.next_event_id(), EventId::new(8));
}

#[test]
fn stale_signals_for_closed_non_current_run_target_the_current_run() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let old_run = RunId::generate();
    rig.seed_run(
        &workflow,
        old_run,
        &[
            started_event(12, 1),
            plain_event(2, 12, 2, EventType::WorkflowExecutionContinuedAsNew),
        ],
    );
    let current_run = RunId::generate();
    rig.seed_run_reuse(
        &workflow,
        current_run,
        &[
            started_event(12, 3),
            plain_event(2, 12, 4, EventType::DecisionTaskScheduled),
            plain_event(3, 12, 5, EventType::DecisionTaskStarted),
            plain_event(4, 12, 6, EventType::DecisionTaskCompleted),
        ],
        old_run,
        Version::new(12),
    );

    // stale signal addressed to the closed historical run
    let request = RequestBuilder::new(
        &workflow,
        old_run,
        vec![signal_event(9, 2, "cancel", "alice")],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    // old run untouched, current run received signal + decision
    let old_state = rig.stored_state(&workflow, old_run);
    assert_eq!(old_state.next_event_id(), EventId::new(3));
    let current_state = rig.stored_state(&workflow, current_run);
    assert_eq!(current_state.next_event_id(), EventId::new(7));
    assert!(current_state.has_pending_decision());
}

#[test]
fn three_way_conflict_is_diverted_to_dlq() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    // last write authored by standby (version 2)
    rig.seed_run(&workflow, run, &[started_event(2, 1)]);

    // incoming version 11 belongs to `active` (us), so the bump cannot be
    // the same remote continuing; with standby as previous authority this
    // reads as a third writer.
    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(2, 11, 10, EventType::DecisionTaskScheduled)],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let (messages, _) = rig
        .dlq
        .read(SHARD, &standby(), None, 10, None)
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].failure.contains("two active clusters"));
}

#[test]
fn same_remote_continuing_across_failover_is_accepted() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    rig.seed_run(&workflow, run, &[started_event(2, 1)]);

    // standby bumped 2 -> 12 without us ever being active; same residue
    // class, no conflict.
    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(2, 12, 10, EventType::DecisionTaskScheduled)],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let state = rig.stored_state(&workflow, run);
    assert_eq!(state.next_event_id(), EventId::new(3));
    assert_eq!(state.last_write_version(), Version::new(12));
}

#[test]
fn divergent_local_tail_is_reset_to_confirmed_checkpoint() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    // Events 1-2 authored by standby (version 2) and confirmed; events 3-4
    // written under our authority (version 11) after a failover the peer
    // never saw.
    rig.seed_run(
        &workflow,
        run,
        &[
            started_event(2, 1),
            plain_event(2, 2, 2, EventType::DecisionTaskScheduled),
            plain_event(3, 11, 3, EventType::DecisionTaskStarted),
            plain_event(4, 11, 4, EventType::DecisionTaskTimedOut),
        ],
    );
    let before = rig.stored_state(&workflow, run);
    assert_eq!(before.last_write_version(), Version::new(11));

    // Standby takes over at version 12; its replication info says it saw us
    // only up to (11, 2)... no: it claims our version 11 never reached it,
    // carrying (version 2, event 2) as the last cross-confirmed point. The
    // local entry for standby also stops at event 2.
    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(3, 12, 30, EventType::ActivityTaskScheduled)],
    )
    .replication_info(active(), 2, 2)
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let state = rig.stored_state(&workflow, run);
    // diverged events 3-4 are gone; the incoming event 3 (version 12) wins
    assert_eq!(state.next_event_id(), EventId::new(4));
    assert_eq!(state.last_write_version(), Version::new(12));
    assert_eq!(
        state.replication_state().last_write_event_id,
        EventId::new(3)
    );
}

#[test]
fn equal_claim_with_shorter_confirmed_prefix_truncates_tail() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    // Four local events under our version 1; the peer confirmed only the
    // first two before failing over.
    rig.seed_run(
        &workflow,
        run,
        &[
            started_event(1, 1),
            plain_event(2, 1, 2, EventType::DecisionTaskScheduled),
            plain_event(3, 1, 3, EventType::DecisionTaskStarted),
            plain_event(4, 1, 4, EventType::DecisionTaskCompleted),
        ],
    );

    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(3, 12, 30, EventType::ActivityTaskScheduled)],
    )
    .replication_info(active(), 1, 2)
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    // events 3-4 truncated; the peer's event 3 replaces them
    let state = rig.stored_state(&workflow, run);
    assert_eq!(state.next_event_id(), EventId::new(4));
    assert_eq!(state.last_write_version(), Version::new(12));
    assert!(
        state.has_pending_decision(),
        "replay to event 2 restores the scheduled decision"
    );
}

#[test]
fn missing_replication_info_resets_to_local_watermark() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    // Standby authored events 1-2; we took over at version 11 for event 3.
    rig.seed_run(
        &workflow,
        run,
        &[
            started_event(2, 1),
            plain_event(2, 2, 2, EventType::DecisionTaskScheduled),
            plain_event(3, 11, 3, EventType::DecisionTaskStarted),
        ],
    );

    // Standby resumes at version 12 with no replication info at all; the
    // reset falls back to our own record of what standby last sent: (2, 2).
    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(3, 12, 30, EventType::ActivityTaskScheduled)],
    )
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let state = rig.stored_state(&workflow, run);
    assert_eq!(state.next_event_id(), EventId::new(4));
    assert_eq!(state.last_write_version(), Version::new(12));
}

#[test]
fn peer_claiming_unseen_version_is_conflict() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    rig.seed_run(
        &workflow,
        run,
        &[started_event(1, 1), plain_event(2, 1, 2, EventType::DecisionTaskScheduled)],
    );

    // our last write is version 1; the peer claims it saw version 11 from us
    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(3, 12, 30, EventType::ActivityTaskScheduled)],
    )
    .replication_info(active(), 11, 2)
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let (messages, _) = rig.dlq.read(SHARD, &standby(), None, 10, None).unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].failure.contains("claims it observed"));
}

#[test]
fn replication_info_beyond_our_tail_is_corrupted() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    rig.seed_run(
        &workflow,
        run,
        &[started_event(1, 1), plain_event(2, 1, 2, EventType::DecisionTaskScheduled)],
    );

    // claim matches our version (1) but points past our last event (2)
    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(3, 12, 30, EventType::ActivityTaskScheduled)],
    )
    .replication_info(active(), 1, 12)
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let (messages, _) = rig.dlq.read(SHARD, &standby(), None, 10, None).unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].failure.contains("beyond our last write"));
}

#[test]
fn matching_claim_with_no_divergence_appends_directly() {
    let rig = ReplicationRig::new();
    let workflow = wf_id("w");
    let run = RunId::generate();
    // two local events under version 1 (ours)
    rig.seed_run(
        &workflow,
        run,
        &[started_event(1, 1), plain_event(2, 1, 2, EventType::DecisionTaskScheduled)],
    );

    // peer fails over to 12 having seen exactly our tail (1, 2)
    let request = RequestBuilder::new(
        &workflow,
        run,
        vec![plain_event(3, 12, 30, EventType::DecisionTaskStarted)],
    )
    .replication_info(active(), 1, 2)
    .build();
    rig.service.replicate_events(&rig.token, &request).unwrap();

    let state = rig.stored_state(&workflow, run);
    assert_eq!(state.next_event_id(), EventId::new(4));
    assert_eq!(state.last_write_version(), Version::new(12));
}
