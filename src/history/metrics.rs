//! Minimal metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test sink
//! can be installed to capture emissions in unit tests.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value)
            | MetricValue::Gauge(value)
            | MetricValue::Histogram(value) => {
                tracing::info!(
                    target: "metrics",
                    metric = event.name,
                    value,
                    labels = ?event.labels
                );
            }
        }
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent {
        name,
        value,
        labels,
    });
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn repl_events_applied(count: usize) {
    emit(
        "repl_events_applied",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn repl_events_dropped_stale(count: usize) {
    emit(
        "repl_events_dropped_stale",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn repl_retry_emitted(kind: &'static str) {
    emit(
        "repl_retry_emitted",
        MetricValue::Counter(1),
        vec![MetricLabel {
            key: "kind",
            value: kind.to_string(),
        }],
    );
}

pub fn repl_conflict_resolved() {
    emit("repl_conflict_resolved", MetricValue::Counter(1), Vec::new());
}

pub fn repl_workflow_terminated() {
    emit(
        "repl_workflow_terminated",
        MetricValue::Counter(1),
        Vec::new(),
    );
}

pub fn repl_signals_reapplied(count: usize) {
    emit(
        "repl_signals_reapplied",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn repl_dlq_enqueued() {
    emit("repl_dlq_enqueued", MetricValue::Counter(1), Vec::new());
}

pub fn repl_apply_duration(duration: Duration) {
    emit(
        "repl_apply_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn execution_cache_evicted(count: usize) {
    emit(
        "execution_cache_evicted",
        MetricValue::Counter(count as u64),
        Vec::new(),
    );
}

pub fn notifier_waiters(count: usize) {
    emit(
        "notifier_waiters",
        MetricValue::Gauge(count as u64),
        Vec::new(),
    );
}
