//! History-event notifier: long-poll fan-out keyed by run.
//!
//! A waiter registry with fire-on-event-append semantics, bounded per
//! shard. Not in the commit path: a notification that finds no waiters is
//! dropped on the floor.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::core::{EventId, Limits, TaskId, WorkflowKey, WorkflowState};

use super::metrics;

#[derive(Clone, Debug, PartialEq)]
pub struct EventNotification {
    pub key: WorkflowKey,
    pub next_event_id: EventId,
    pub last_event_task_id: TaskId,
    pub workflow_state: WorkflowState,
}

impl EventNotification {
    pub fn is_workflow_running(&self) -> bool {
        self.workflow_state.is_running()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifierError {
    #[error("too many waiters registered ({max})")]
    TooManyWaiters { max: usize },
}

#[derive(Debug)]
pub struct Subscription {
    key: WorkflowKey,
    receiver: Receiver<EventNotification>,
}

impl Subscription {
    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    pub fn receiver(&self) -> &Receiver<EventNotification> {
        &self.receiver
    }
}

#[derive(Default)]
struct NotifierInner {
    waiters: BTreeMap<WorkflowKey, Vec<Sender<EventNotification>>>,
    waiter_count: usize,
}

pub struct HistoryEventNotifier {
    inner: Mutex<NotifierInner>,
    limits: Limits,
}

impl HistoryEventNotifier {
    pub fn new(limits: Limits) -> Self {
        Self {
            inner: Mutex::new(NotifierInner::default()),
            limits,
        }
    }

    /// Register interest in a run's next appended event. The subscription
    /// ends when the receiver is dropped; the notifier prunes dead senders
    /// on the next notify.
    pub fn watch(&self, key: &WorkflowKey) -> Result<Subscription, NotifierError> {
        let mut inner = self.inner.lock().expect("notifier lock poisoned");
        if inner.waiter_count >= self.limits.notifier_max_waiters_per_shard {
            return Err(NotifierError::TooManyWaiters {
                max: self.limits.notifier_max_waiters_per_shard,
            });
        }
        let (sender, receiver) =
            crossbeam::channel::bounded(self.limits.notifier_channel_depth);
        inner.waiters.entry(key.clone()).or_default().push(sender);
        inner.waiter_count += 1;
        metrics::notifier_waiters(inner.waiter_count);
        Ok(Subscription {
            key: key.clone(),
            receiver,
        })
    }

    /// Fan a committed append out to that run's waiters. Slow waiters whose
    /// channels are full simply miss the notification; they re-check state
    /// on their own timeout.
    pub fn notify(&self, notification: EventNotification) {
        let mut inner = self.inner.lock().expect("notifier lock poisoned");
        let Some(senders) = inner.waiters.get_mut(&notification.key) else {
            return;
        };
        let mut dropped = 0usize;
        senders.retain(|sender| match sender.try_send(notification.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => {
                dropped += 1;
                false
            }
        });
        if senders.is_empty() {
            inner.waiters.remove(&notification.key);
        }
        inner.waiter_count -= dropped;
        if dropped > 0 {
            metrics::notifier_waiters(inner.waiter_count);
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.inner
            .lock()
            .expect("notifier lock poisoned")
            .waiter_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NamespaceId, RunId, WorkflowId};

    fn key() -> WorkflowKey {
        WorkflowKey::new(
            NamespaceId::new("ns1").unwrap(),
            WorkflowId::new("wf1").unwrap(),
            RunId::generate(),
        )
    }

    fn notification(key: &WorkflowKey, next_event_id: i64) -> EventNotification {
        EventNotification {
            key: key.clone(),
            next_event_id: EventId::new(next_event_id),
            last_event_task_id: TaskId(0),
            workflow_state: WorkflowState::Running,
        }
    }

    #[test]
    fn watch_receives_notifications_for_its_key() {
        let notifier = HistoryEventNotifier::new(Limits::default());
        let watched = key();
        let other = key();
        let subscription = notifier.watch(&watched).unwrap();

        notifier.notify(notification(&other, 5));
        assert!(subscription.receiver().try_recv().is_err());

        notifier.notify(notification(&watched, 7));
        let received = subscription.receiver().try_recv().unwrap();
        assert_eq!(received.next_event_id, EventId::new(7));
        assert!(received.is_workflow_running());
    }

    #[test]
    fn waiter_bound_is_enforced() {
        let mut limits = Limits::default();
        limits.notifier_max_waiters_per_shard = 2;
        let notifier = HistoryEventNotifier::new(limits);
        let k = key();
        let _a = notifier.watch(&k).unwrap();
        let _b = notifier.watch(&k).unwrap();
        assert_eq!(
            notifier.watch(&k).unwrap_err(),
            NotifierError::TooManyWaiters { max: 2 }
        );
    }

    #[test]
    fn dropped_receivers_are_pruned_on_notify() {
        let notifier = HistoryEventNotifier::new(Limits::default());
        let k = key();
        let subscription = notifier.watch(&k).unwrap();
        drop(subscription);
        assert_eq!(notifier.waiter_count(), 1);

        notifier.notify(notification(&k, 3));
        assert_eq!(notifier.waiter_count(), 0);
    }
}
