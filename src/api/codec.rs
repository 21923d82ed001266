//! CBOR codec for raw history blobs.
//!
//! `ReplicateRawEvents` and the V2 request carry event batches as opaque
//! blobs; this is their encoding. Scalar stamps are CBOR fields; the typed
//! attributes payload travels as embedded JSON.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{EventAttributes, EventId, EventType, HistoryEvent, Limits, TaskId, Version};

const BLOB_VERSION_V1: u32 = 1;

#[derive(Debug, Error)]
pub enum BlobEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
    #[error("attributes encode: {0}")]
    Attributes(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BlobDecodeError {
    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u32),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("trailing bytes after blob body")]
    TrailingBytes,
    #[error("event batch too large: {got} events over limit {max}")]
    BatchTooLarge { max: usize, got: usize },
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

fn event_type_str(event_type: EventType) -> &'static str {
    match event_type {
        EventType::WorkflowExecutionStarted => "wf_started",
        EventType::WorkflowExecutionCompleted => "wf_completed",
        EventType::WorkflowExecutionFailed => "wf_failed",
        EventType::WorkflowExecutionTimedOut => "wf_timed_out",
        EventType::WorkflowExecutionTerminated => "wf_terminated",
        EventType::WorkflowExecutionCanceled => "wf_canceled",
        EventType::WorkflowExecutionContinuedAsNew => "wf_continued_as_new",
        EventType::WorkflowExecutionSignaled => "wf_signaled",
        EventType::DecisionTaskScheduled => "decision_scheduled",
        EventType::DecisionTaskStarted => "decision_started",
        EventType::DecisionTaskCompleted => "decision_completed",
        EventType::DecisionTaskFailed => "decision_failed",
        EventType::DecisionTaskTimedOut => "decision_timed_out",
        EventType::ActivityTaskScheduled => "activity_scheduled",
        EventType::ActivityTaskStarted => "activity_started",
        EventType::ActivityTaskCompleted => "activity_completed",
        EventType::ActivityTaskFailed => "activity_failed",
        EventType::ActivityTaskTimedOut => "activity_timed_out",
        EventType::TimerStarted => "timer_started",
        EventType::TimerFired => "timer_fired",
    }
}

fn parse_event_type(raw: &str) -> Option<EventType> {
    Some(match raw {
        "wf_started" => EventType::WorkflowExecutionStarted,
        "wf_completed" => EventType::WorkflowExecutionCompleted,
        "wf_failed" => EventType::WorkflowExecutionFailed,
        "wf_timed_out" => EventType::WorkflowExecutionTimedOut,
        "wf_terminated" => EventType::WorkflowExecutionTerminated,
        "wf_canceled" => EventType::WorkflowExecutionCanceled,
        "wf_continued_as_new" => EventType::WorkflowExecutionContinuedAsNew,
        "wf_signaled" => EventType::WorkflowExecutionSignaled,
        "decision_scheduled" => EventType::DecisionTaskScheduled,
        "decision_started" => EventType::DecisionTaskStarted,
        "decision_completed" => EventType::DecisionTaskCompleted,
        "decision_failed" => EventType::DecisionTaskFailed,
        "decision_timed_out" => EventType::DecisionTaskTimedOut,
        "activity_scheduled" => EventType::ActivityTaskScheduled,
        "activity_started" => EventType::ActivityTaskStarted,
        "activity_completed" => EventType::ActivityTaskCompleted,
        "activity_failed" => EventType::ActivityTaskFailed,
        "activity_timed_out" => EventType::ActivityTaskTimedOut,
        "timer_started" => EventType::TimerStarted,
        "timer_fired" => EventType::TimerFired,
        _ => return None,
    })
}

pub fn encode_history_blob(events: &[HistoryEvent]) -> Result<Bytes, BlobEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("v")?;
    enc.u32(BLOB_VERSION_V1)?;
    enc.str("events")?;
    enc.array(events.len() as u64)?;
    for event in events {
        let attributes = serde_json::to_vec(&event.attributes)?;
        enc.map(6)?;
        enc.str("id")?;
        enc.i64(event.event_id.get())?;
        enc.str("ver")?;
        enc.i64(event.version.get())?;
        enc.str("task")?;
        enc.i64(event.task_id.get())?;
        enc.str("ts")?;
        enc.u64(event.timestamp_ms)?;
        enc.str("type")?;
        enc.str(event_type_str(event.event_type))?;
        enc.str("attrs")?;
        enc.bytes(&attributes)?;
    }
    Ok(Bytes::from(buf))
}

pub fn decode_history_blob(
    bytes: &[u8],
    limits: &Limits,
) -> Result<Vec<HistoryEvent>, BlobDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = definite_map_len(&mut dec)?;

    let mut version = None;
    let mut events = None;

    for _ in 0..map_len {
        let key = dec.str()?;
        match key {
            "v" => version = Some(dec.u32()?),
            "events" => events = Some(decode_events(&mut dec, limits)?),
            _ => dec.skip()?,
        }
    }

    if dec.datatype().is_ok() {
        return Err(BlobDecodeError::TrailingBytes);
    }

    let version = version.ok_or(BlobDecodeError::MissingField("v"))?;
    if version != BLOB_VERSION_V1 {
        return Err(BlobDecodeError::UnsupportedVersion(version));
    }
    events.ok_or(BlobDecodeError::MissingField("events"))
}

fn decode_events(
    dec: &mut Decoder<'_>,
    limits: &Limits,
) -> Result<Vec<HistoryEvent>, BlobDecodeError> {
    let len = dec
        .array()?
        .ok_or(BlobDecodeError::IndefiniteLength)? as usize;
    if len > limits.max_replication_batch_events {
        return Err(BlobDecodeError::BatchTooLarge {
            max: limits.max_replication_batch_events,
            got: len,
        });
    }

    let mut events = Vec::with_capacity(len);
    for _ in 0..len {
        events.push(decode_event(dec)?);
    }
    Ok(events)
}

fn decode_event(dec: &mut Decoder<'_>) -> Result<HistoryEvent, BlobDecodeError> {
    let map_len = definite_map_len(dec)?;

    let mut event_id = None;
    let mut version = None;
    let mut task_id = None;
    let mut timestamp_ms = None;
    let mut event_type = None;
    let mut attributes = None;

    for _ in 0..map_len {
        let key = dec.str()?;
        match key {
            "id" => event_id = Some(EventId::new(dec.i64()?)),
            "ver" => version = Some(Version::new(dec.i64()?)),
            "task" => task_id = Some(TaskId(dec.i64()?)),
            "ts" => timestamp_ms = Some(dec.u64()?),
            "type" => {
                let raw = dec.str()?;
                event_type =
                    Some(
                        parse_event_type(raw).ok_or_else(|| BlobDecodeError::InvalidField {
                            field: "type",
                            reason: format!("unknown event type {raw}"),
                        })?,
                    );
            }
            "attrs" => {
                let raw = dec.bytes()?;
                let decoded: EventAttributes = serde_json::from_slice(raw).map_err(|err| {
                    BlobDecodeError::InvalidField {
                        field: "attrs",
                        reason: err.to_string(),
                    }
                })?;
                attributes = Some(decoded);
            }
            _ => dec.skip()?,
        }
    }

    Ok(HistoryEvent {
        event_id: event_id.ok_or(BlobDecodeError::MissingField("id"))?,
        version: version.ok_or(BlobDecodeError::MissingField("ver"))?,
        task_id: task_id.ok_or(BlobDecodeError::MissingField("task"))?,
        timestamp_ms: timestamp_ms.ok_or(BlobDecodeError::MissingField("ts"))?,
        event_type: event_type.ok_or(BlobDecodeError::MissingField("type"))?,
        attributes: attributes.ok_or(BlobDecodeError::MissingField("attrs"))?,
    })
}

fn definite_map_len(dec: &mut Decoder<'_>) -> Result<u64, BlobDecodeError> {
    if dec.datatype()? == Type::MapIndef {
        return Err(BlobDecodeError::IndefiniteLength);
    }
    dec.map()?.ok_or(BlobDecodeError::IndefiniteLength)
}
