//! Server-sent events adapter.
//!
//! One HTTP response per subscriber; the subscription is fixed at request
//! time. Supports plain live streams, multi-tick-type streams, and the
//! buffer+live handoff where a recent window is replayed before live
//! delivery starts.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SelectAll;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::api::envelope::{new_stream_id, Envelope};
use crate::api::routes::parse_tick_types;
use crate::api::AppState;
use crate::error::ServiceError;
use crate::models::{StreamKey, TickType};
use crate::storage::{QueryOptions, TimeRange};
use crate::stream::{Multiplexer, QueueSink, StreamEvent, Subscription};

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub tick_types: Option<String>,
    /// Max ticks before the stream auto-completes.
    pub limit: Option<u64>,
    /// Max stream lifetime in seconds.
    pub timeout: Option<u64>,
    /// Buffer window for the with-buffer form (`last_30m`, `us_regular`,
    /// ...). Defaults to the tracked buffer window, then `last_1h`.
    pub buffer: Option<String>,
}

/// Unsubscribes everything it owns when the response stream is dropped,
/// whether by completion or client disconnect.
pub(crate) struct SubscriptionGuard {
    mux: Arc<Multiplexer>,
    subs: Vec<Subscription>,
}

impl SubscriptionGuard {
    pub(crate) fn new(mux: Arc<Multiplexer>) -> Self {
        Self {
            mux,
            subs: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, sub: Subscription) {
        self.subs.push(sub);
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mux = self.mux.clone();
        let subs = std::mem::take(&mut self.subs);
        if subs.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for sub in subs {
                mux.unsubscribe(sub).await;
            }
        });
    }
}

/// One subscriber attachment: sink registered, events tagged with the
/// subscriber-facing stream id.
struct Attachment {
    merged: SelectAll<futures_util::stream::BoxStream<'static, (usize, StreamEvent)>>,
    stream_ids: Vec<String>,
    keys: Vec<StreamKey>,
    guard: SubscriptionGuard,
}

async fn attach(
    state: &AppState,
    contract_id: i32,
    tick_types: &[TickType],
) -> Result<Attachment, ServiceError> {
    let mut merged = SelectAll::new();
    let mut stream_ids = Vec::new();
    let mut keys = Vec::new();
    let mut guard = SubscriptionGuard::new(state.mux.clone());

    for (idx, tick_type) in tick_types.iter().enumerate() {
        let key = StreamKey::new(contract_id, *tick_type);
        let (sink, rx) = QueueSink::channel(state.config.subscriber_queue_capacity);
        let sub = state.mux.subscribe(key, Box::new(sink), false).await?;
        guard.push(sub);
        stream_ids.push(new_stream_id(key));
        keys.push(key);
        merged.push(rx.map(move |event| (idx, event)).boxed());
    }

    Ok(Attachment {
        merged,
        stream_ids,
        keys,
        guard,
    })
}

fn sse_event(envelope: &Envelope) -> Event {
    Event::default().event(envelope.msg_type).data(envelope.to_json())
}

fn error_sse(error: &ServiceError) -> Response {
    let envelope = Envelope::error("", error.code(), &error.to_string(), error.recoverable());
    let stream = futures_util::stream::once(async move { Ok::<_, Infallible>(sse_event(&envelope)) });
    Sse::new(stream).into_response()
}

pub async fn stream_single(
    Path((contract_id, tick_type)): Path<(i32, String)>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    let tick_type = match TickType::from_label(&tick_type) {
        Ok(tt) => tt,
        Err(e) => return error_sse(&e),
    };
    run_stream(state, contract_id, vec![tick_type], params, false).await
}

pub async fn stream_multi(
    Path(contract_id): Path<i32>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    let tick_types = match parse_tick_types(params.tick_types.as_deref()) {
        Ok(tts) => tts,
        Err(e) => return error_sse(&e),
    };
    run_stream(state, contract_id, tick_types, params, false).await
}

pub async fn stream_with_buffer(
    Path(contract_id): Path<i32>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    let tick_types = match parse_tick_types(params.tick_types.as_deref()) {
        Ok(tts) => tts,
        Err(e) => return error_sse(&e),
    };
    run_stream(state, contract_id, tick_types, params, true).await
}

/// Default buffer window: the tracked window if configured, else one hour.
fn buffer_range(state: &AppState, contract_id: i32, params: &StreamParams) -> Result<TimeRange, ServiceError> {
    match params.buffer.as_deref() {
        Some(spec) => spec.parse(),
        None => Ok(state
            .tracker
            .buffer_hours(contract_id)
            .map(|hours| TimeRange::last_hours(u64::from(hours)))
            .unwrap_or_else(|| TimeRange::last_hours(1))),
    }
}

async fn run_stream(
    state: AppState,
    contract_id: i32,
    tick_types: Vec<TickType>,
    params: StreamParams,
    with_buffer: bool,
) -> Response {
    // Subscribe before any historical read: live records queue in the
    // bounded sinks and are flushed after the buffer replay.
    let attachment = match attach(&state, contract_id, &tick_types).await {
        Ok(attachment) => attachment,
        Err(e) => return error_sse(&e),
    };

    let historical = if with_buffer {
        let range = match buffer_range(&state, contract_id, &params) {
            Ok(range) => range,
            Err(e) => return error_sse(&e),
        };
        match state.query.query(
            contract_id,
            &tick_types,
            range,
            QueryOptions {
                include_open_file: true,
                include_tail: true,
                limit: None,
            },
        ) {
            Ok(records) => Some(records),
            Err(e) => return error_sse(&e),
        }
    } else {
        None
    };

    let limit = params.limit;
    let deadline = params
        .timeout
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

    let stream = async_stream::stream! {
        let Attachment { mut merged, stream_ids, keys, guard } = attachment;
        let _guard = guard;
        let mut sent = 0u64;

        if let Some(records) = historical {
            let count = records.len();
            for record in records {
                let idx = keys
                    .iter()
                    .position(|k| k.tick_type == record.tick_type)
                    .unwrap_or(0);
                yield sse_event(&Envelope::tick(&stream_ids[idx], &record, true));
            }
            yield sse_event(&Envelope::info(
                &stream_ids[0],
                "buffer_complete",
                json!({ "historical_ticks": count }),
            ));
        }

        loop {
            let polled = if let Some(deadline) = deadline {
                tokio::select! {
                    event = merged.next() => Some(event),
                    _ = tokio::time::sleep_until(deadline) => None,
                }
            } else {
                Some(merged.next().await)
            };
            let Some(next) = polled else {
                yield sse_event(&Envelope::complete(&stream_ids[0], "timeout", sent));
                break;
            };

            match next {
                Some((idx, StreamEvent::Tick(record))) => {
                    yield sse_event(&Envelope::tick(&stream_ids[idx], &record, false));
                    sent += 1;
                    if limit.is_some_and(|l| sent >= l) {
                        yield sse_event(&Envelope::complete(&stream_ids[idx], "limit_reached", sent));
                        break;
                    }
                }
                Some((idx, StreamEvent::Error { code, message, recoverable })) => {
                    yield sse_event(&Envelope::error(&stream_ids[idx], code, &message, recoverable));
                    break;
                }
                Some((idx, StreamEvent::Complete { reason })) => {
                    yield sse_event(&Envelope::complete(&stream_ids[idx], &reason, sent));
                    break;
                }
                None => {
                    debug!(contract_id, "all subscription channels ended");
                    yield sse_event(&Envelope::complete(&stream_ids[0], "stream ended", sent));
                    break;
                }
            }
        }
    };

    Sse::new(stream.map(Ok::<_, Infallible>))
        .keep_alive(KeepAlive::default())
        .into_response()
}
