//! WebSocket adapter.
//!
//! One socket carries many subscriptions, each addressed by its
//! subscriber-facing stream id. Client messages: `subscribe`,
//! `unsubscribe`, `ping`. Server messages: `connected`, `subscribed`,
//! `tick`, `error`, `complete`, `pong`. Per-IP connection and
//! per-connection subscription caps are enforced here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{BoxStream, SelectAll};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::envelope::{new_stream_id, Envelope};
use crate::api::AppState;
use crate::error::ServiceError;
use crate::models::{StreamKey, TickType};
use crate::storage::{QueryOptions, TimeRange};
use crate::stream::{QueueSink, StreamEvent, Subscription};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        contract_id: i32,
        tick_types: Option<Vec<String>>,
        limit: Option<u64>,
        timeout: Option<u64>,
        #[serde(default)]
        with_buffer: bool,
        buffer: Option<String>,
    },
    Unsubscribe {
        stream_id: String,
    },
    Ping {
        #[serde(default)]
        data: Value,
    },
}

enum WsItem {
    Event(StreamEvent),
    /// The subscription's event stream finished (deadline or channel end).
    Ended,
}

struct SubEntry {
    sub: Subscription,
    sent: u64,
    limit: Option<u64>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let Some(guard) = state.ws_limits.try_acquire(addr.ip()) else {
        warn!(ip = %addr.ip(), "websocket connection limit reached");
        return (StatusCode::TOO_MANY_REQUESTS, "connection limit reached").into_response();
    };
    ws.on_upgrade(move |socket| async move {
        let _guard = guard;
        handle_socket(socket, state).await;
    })
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let hello = Envelope::connected(json!({
        "max_subscriptions": state.config.max_subscriptions_per_connection,
        "tick_types": TickType::ALL,
        "supports_buffer": true,
    }));
    if socket.send(Message::Text(hello.to_json())).await.is_err() {
        return;
    }

    let mut entries: HashMap<String, SubEntry> = HashMap::new();
    let mut merged: SelectAll<BoxStream<'static, (String, WsItem)>> = SelectAll::new();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_message(&text, &state, &mut socket, &mut entries, &mut merged)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            item = merged.next(), if !merged.is_empty() => {
                let Some((stream_id, item)) = item else { continue };
                if handle_stream_item(stream_id, item, &state, &mut socket, &mut entries)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    // Connection gone: release every subscription.
    for (_, entry) in entries.drain() {
        state.mux.unsubscribe(entry.sub).await;
    }
}

async fn send(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), ()> {
    socket
        .send(Message::Text(envelope.to_json()))
        .await
        .map_err(|_| ())
}

async fn handle_client_message(
    text: &str,
    state: &AppState,
    socket: &mut WebSocket,
    entries: &mut HashMap<String, SubEntry>,
    merged: &mut SelectAll<BoxStream<'static, (String, WsItem)>>,
) -> Result<(), ()> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            let envelope = Envelope::error("", "bad_request", &format!("unparseable message: {e}"), true);
            return send(socket, &envelope).await;
        }
    };

    match message {
        ClientMessage::Ping { data } => send(socket, &Envelope::pong(data)).await,
        ClientMessage::Unsubscribe { stream_id } => {
            match entries.remove(&stream_id) {
                Some(entry) => {
                    state.mux.unsubscribe(entry.sub).await;
                    send(
                        socket,
                        &Envelope::complete(&stream_id, "unsubscribed", entry.sent),
                    )
                    .await
                }
                None => {
                    send(
                        socket,
                        &Envelope::error(&stream_id, "unknown_stream", "no such stream id", true),
                    )
                    .await
                }
            }
        }
        ClientMessage::Subscribe {
            contract_id,
            tick_types,
            limit,
            timeout,
            with_buffer,
            buffer,
        } => {
            let labels = tick_types.unwrap_or_else(|| vec!["last".to_string()]);
            let parsed: Result<Vec<TickType>, _> =
                labels.iter().map(|l| TickType::from_label(l)).collect();
            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    let envelope =
                        Envelope::error("", e.code(), &e.to_string(), false);
                    return send(socket, &envelope).await;
                }
            };

            if entries.len() + parsed.len() > state.config.max_subscriptions_per_connection {
                let e = ServiceError::RateLimitExceeded(format!(
                    "subscription cap is {}",
                    state.config.max_subscriptions_per_connection
                ));
                return send(socket, &Envelope::error("", e.code(), &e.to_string(), true)).await;
            }

            for tick_type in parsed {
                subscribe_one(
                    state,
                    socket,
                    entries,
                    merged,
                    contract_id,
                    tick_type,
                    limit,
                    timeout,
                    with_buffer,
                    buffer.as_deref(),
                )
                .await?;
            }
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn subscribe_one(
    state: &AppState,
    socket: &mut WebSocket,
    entries: &mut HashMap<String, SubEntry>,
    merged: &mut SelectAll<BoxStream<'static, (String, WsItem)>>,
    contract_id: i32,
    tick_type: TickType,
    limit: Option<u64>,
    timeout: Option<u64>,
    with_buffer: bool,
    buffer: Option<&str>,
) -> Result<(), ()> {
    let key = StreamKey::new(contract_id, tick_type);
    let (sink, rx) = QueueSink::channel(state.config.subscriber_queue_capacity);
    let sub = match state.mux.subscribe(key, Box::new(sink), false).await {
        Ok(sub) => sub,
        Err(e) => {
            return send(socket, &Envelope::error("", e.code(), &e.to_string(), false)).await;
        }
    };

    let stream_id = new_stream_id(key);
    send(
        socket,
        &Envelope {
            msg_type: "subscribed",
            stream_id: stream_id.clone(),
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
            data: json!({ "contract_id": contract_id, "tick_type": tick_type }),
            metadata: None,
        },
    )
    .await?;

    // Buffer replay happens before the receiver joins the select set, so
    // live records queue in the sink and flush afterwards.
    if with_buffer {
        let range = match buffer {
            Some(spec) => match spec.parse::<TimeRange>() {
                Ok(range) => range,
                Err(e) => {
                    state.mux.unsubscribe(sub).await;
                    return send(
                        socket,
                        &Envelope::error(&stream_id, e.code(), &e.to_string(), false),
                    )
                    .await;
                }
            },
            None => state
                .tracker
                .buffer_hours(contract_id)
                .map(|hours| TimeRange::last_hours(u64::from(hours)))
                .unwrap_or_else(|| TimeRange::last_hours(1)),
        };
        match state.query.query(
            contract_id,
            &[tick_type],
            range,
            QueryOptions {
                include_open_file: true,
                include_tail: true,
                limit: None,
            },
        ) {
            Ok(records) => {
                let count = records.len();
                for record in &records {
                    send(socket, &Envelope::tick(&stream_id, record, true)).await?;
                }
                send(
                    socket,
                    &Envelope::info(
                        &stream_id,
                        "buffer_complete",
                        json!({ "historical_ticks": count }),
                    ),
                )
                .await?;
            }
            Err(e) => {
                state.mux.unsubscribe(sub).await;
                return send(
                    socket,
                    &Envelope::error(&stream_id, e.code(), &e.to_string(), false),
                )
                .await;
            }
        }
    }

    let events = {
        let sid = stream_id.clone();
        let base = rx.map(move |event| (sid.clone(), WsItem::Event(event)));
        let bounded: BoxStream<'static, (String, WsItem)> = match timeout {
            Some(secs) => base
                .take_until(Box::pin(tokio::time::sleep(Duration::from_secs(secs))))
                .boxed(),
            None => base.boxed(),
        };
        let sid = stream_id.clone();
        bounded
            .chain(futures_util::stream::once(async move {
                (sid, WsItem::Ended)
            }))
            .boxed()
    };
    merged.push(events);

    entries.insert(
        stream_id,
        SubEntry {
            sub,
            sent: 0,
            limit,
        },
    );
    Ok(())
}

async fn handle_stream_item(
    stream_id: String,
    item: WsItem,
    state: &AppState,
    socket: &mut WebSocket,
    entries: &mut HashMap<String, SubEntry>,
) -> Result<(), ()> {
    match item {
        WsItem::Event(StreamEvent::Tick(record)) => {
            let Some(entry) = entries.get_mut(&stream_id) else {
                return Ok(());
            };
            send(socket, &Envelope::tick(&stream_id, &record, false)).await?;
            entry.sent += 1;
            if entry.limit.is_some_and(|l| entry.sent >= l) {
                let entry = entries.remove(&stream_id).expect("entry present");
                state.mux.unsubscribe(entry.sub).await;
                send(
                    socket,
                    &Envelope::complete(&stream_id, "limit_reached", entry.sent),
                )
                .await?;
            }
            Ok(())
        }
        WsItem::Event(StreamEvent::Error {
            code,
            message,
            recoverable,
        }) => {
            if let Some(entry) = entries.remove(&stream_id) {
                state.mux.unsubscribe(entry.sub).await;
                send(
                    socket,
                    &Envelope::error(&stream_id, code, &message, recoverable),
                )
                .await?;
            }
            Ok(())
        }
        WsItem::Event(StreamEvent::Complete { reason }) => {
            if let Some(entry) = entries.remove(&stream_id) {
                state.mux.unsubscribe(entry.sub).await;
                send(
                    socket,
                    &Envelope::complete(&stream_id, &reason, entry.sent),
                )
                .await?;
            }
            Ok(())
        }
        WsItem::Ended => {
            // Deadline elapsed or the channel closed underneath us.
            if let Some(entry) = entries.remove(&stream_id) {
                state.mux.unsubscribe(entry.sub).await;
                send(
                    socket,
                    &Envelope::complete(&stream_id, "timeout", entry.sent),
                )
                .await?;
            }
            Ok(())
        }
    }
}
