//! Thin TWS/IB Gateway socket adapter.
//!
//! Speaks just enough of the gateway framing to run tick-by-tick streams:
//! `[4-byte big-endian length][NUL-terminated ASCII fields]` frames, the
//! `API\0` + version-range handshake, `START_API`, and the tick-by-tick
//! request/cancel/data messages. Everything else the gateway sends is
//! ignored. All writes are serialized behind one lock; the gateway client
//! object is not safe for concurrent use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{TickFields, UpstreamTimestamp};
use crate::error::GatewayError;
use crate::models::TickType;
use crate::upstream::{Gateway, GatewayEvent, GatewayEventSender};

/// Supported server version range advertised during the handshake.
const MIN_CLIENT_VER: i32 = 100;
const MAX_CLIENT_VER: i32 = 187;

/// Outgoing message ids.
const START_API: i32 = 71;
const REQ_TICK_BY_TICK_DATA: i32 = 97;
const CANCEL_TICK_BY_TICK_DATA: i32 = 98;

/// Incoming message ids.
const ERR_MSG: i32 = 4;
const NEXT_VALID_ID: i32 = 9;
const TICK_BY_TICK: i32 = 99;

/// Gateway error codes that mean the transport itself is gone.
const CONNECTIVITY_LOST_CODES: [i32; 3] = [1100, 1300, 2110];

const MAX_FRAME_LEN: u32 = 0xFF_FFFF;

pub struct TwsGateway {
    events: GatewayEventSender,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    connect_timeout: Duration,
}

impl TwsGateway {
    pub fn new(events: GatewayEventSender, connect_timeout: Duration) -> Self {
        Self {
            events,
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            connect_timeout,
        }
    }

    async fn send_fields(&self, fields: &[String]) -> Result<(), GatewayError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(GatewayError::NotConnected)?;
        let mut payload = Vec::with_capacity(64);
        for field in fields {
            payload.extend_from_slice(field.as_bytes());
            payload.push(0);
        }
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        writer.write_all(&frame).await?;
        Ok(())
    }
}

#[async_trait]
impl Gateway for TwsGateway {
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<(), GatewayError> {
        self.disconnect().await;

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| GatewayError::Handshake(format!("connect timeout to {host}:{port}")))??;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        // API signature, then the supported version range as one frame.
        write_half.write_all(b"API\0").await?;
        let range = format!("v{MIN_CLIENT_VER}..{MAX_CLIENT_VER}");
        let mut frame = Vec::with_capacity(range.len() + 4);
        frame.extend_from_slice(&(range.len() as u32).to_be_bytes());
        frame.extend_from_slice(range.as_bytes());
        write_half.write_all(&frame).await?;

        // First frame back: server version and connection time.
        let ack = tokio::time::timeout(self.connect_timeout, read_frame(&mut read_half))
            .await
            .map_err(|_| GatewayError::Handshake("handshake timeout".to_string()))??
            .ok_or_else(|| GatewayError::Handshake("gateway closed during handshake".to_string()))?;
        let server_version: i32 = ack
            .first()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| GatewayError::Handshake("missing server version".to_string()))?;
        info!(server_version, host, port, "gateway handshake complete");

        *self.writer.lock().await = Some(write_half);
        self.send_fields(&[
            START_API.to_string(),
            "2".to_string(),
            client_id.to_string(),
            String::new(), // optional capabilities
        ])
        .await?;

        self.connected.store(true, Ordering::SeqCst);
        let events = self.events.clone();
        let connected = self.connected.clone();
        let task = tokio::spawn(async move {
            read_loop(read_half, events, connected, server_version, client_id).await;
        });
        *self.reader_task.lock().await = Some(task);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request_ticks(
        &self,
        request_id: i32,
        contract_id: i32,
        tick_type: TickType,
    ) -> Result<(), GatewayError> {
        // Contract is addressed by conId alone; lookup of the remaining
        // fields is a separate service's concern.
        let fields = vec![
            REQ_TICK_BY_TICK_DATA.to_string(),
            request_id.to_string(),
            contract_id.to_string(), // conId
            String::new(),           // symbol
            String::new(),           // secType
            String::new(),           // lastTradeDateOrContractMonth
            "0".to_string(),         // strike
            String::new(),           // right
            String::new(),           // multiplier
            "SMART".to_string(),     // exchange
            String::new(),           // primaryExchange
            String::new(),           // currency
            String::new(),           // localSymbol
            String::new(),           // tradingClass
            super::tick_type_request_label(tick_type).to_string(),
            "0".to_string(), // numberOfTicks: streaming
            "0".to_string(), // ignoreSize
        ];
        debug!(request_id, contract_id, %tick_type, "requesting tick-by-tick stream");
        self.send_fields(&fields).await
    }

    async fn cancel_ticks(&self, request_id: i32) -> Result<(), GatewayError> {
        self.send_fields(&[
            CANCEL_TICK_BY_TICK_DATA.to_string(),
            request_id.to_string(),
        ])
        .await
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<Vec<String>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized gateway frame",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let fields = payload
        .split(|b| *b == 0)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect::<Vec<_>>();
    Ok(Some(fields))
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: GatewayEventSender,
    connected: Arc<AtomicBool>,
    server_version: i32,
    client_id: i32,
) {
    loop {
        let fields = match read_frame(&mut reader).await {
            Ok(Some(fields)) => fields,
            Ok(None) => {
                connected.store(false, Ordering::SeqCst);
                let _ = events
                    .send(GatewayEvent::Disconnected {
                        reason: "gateway closed the connection".to_string(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                let _ = events
                    .send(GatewayEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let Some(msg_id) = fields.first().and_then(|v| v.parse::<i32>().ok()) else {
            continue;
        };
        match msg_id {
            NEXT_VALID_ID => {
                let _ = events
                    .send(GatewayEvent::Connected {
                        server_version,
                        client_id,
                    })
                    .await;
            }
            ERR_MSG => {
                // version, id, code, message
                let request_id = fields.get(2).and_then(|v| v.parse::<i32>().ok());
                let code = fields
                    .get(3)
                    .and_then(|v| v.parse::<i32>().ok())
                    .unwrap_or(0);
                let message = fields.get(4).cloned().unwrap_or_default();
                if CONNECTIVITY_LOST_CODES.contains(&code) {
                    connected.store(false, Ordering::SeqCst);
                    let _ = events
                        .send(GatewayEvent::Disconnected {
                            reason: format!("{code}: {message}"),
                        })
                        .await;
                } else {
                    let _ = events
                        .send(GatewayEvent::Error {
                            request_id: request_id.filter(|id| *id > 0),
                            code,
                            message,
                        })
                        .await;
                }
            }
            TICK_BY_TICK => {
                if let Some(event) = parse_tick_by_tick(&fields) {
                    let _ = events.send(event).await;
                }
            }
            other => {
                debug!(msg_id = other, "ignoring gateway message");
            }
        }
    }
}

/// Decode one tick-by-tick data message into a gateway tick event.
///
/// Layout: `99, reqId, tickKind, unixSeconds, <per-kind fields>` where kind
/// 1/2 is Last/AllLast (`price, size, mask, exchange, conditions`), kind 3
/// is BidAsk (`bidPrice, askPrice, bidSize, askSize, mask`), kind 4 is
/// MidPoint (`midPoint`).
fn parse_tick_by_tick(fields: &[String]) -> Option<GatewayEvent> {
    let request_id = fields.get(1)?.parse::<i32>().ok()?;
    let kind = fields.get(2)?.parse::<i32>().ok()?;
    let time_secs = fields.get(3)?.parse::<i64>().ok()?;
    let event_ts = Some(UpstreamTimestamp::Seconds(time_secs));

    let parse_f64 = |idx: usize| fields.get(idx).and_then(|v| v.parse::<f64>().ok());
    let parse_mask = |idx: usize| {
        fields
            .get(idx)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
    };

    match kind {
        1 | 2 => {
            let mask = parse_mask(6);
            Some(GatewayEvent::Tick {
                request_id,
                tick_type_label: if kind == 1 { "last" } else { "all_last" },
                fields: TickFields {
                    event_ts,
                    price: parse_f64(4),
                    size: parse_f64(5),
                    unreported: mask & 0x2 != 0,
                    ..Default::default()
                },
            })
        }
        3 => {
            let mask = parse_mask(8);
            Some(GatewayEvent::Tick {
                request_id,
                tick_type_label: "bid_ask",
                fields: TickFields {
                    event_ts,
                    bid_price: parse_f64(4),
                    ask_price: parse_f64(5),
                    bid_size: parse_f64(6),
                    ask_size: parse_f64(7),
                    bid_past_low: mask & 0x1 != 0,
                    ask_past_high: mask & 0x2 != 0,
                    ..Default::default()
                },
            })
        }
        4 => Some(GatewayEvent::Tick {
            request_id,
            tick_type_label: "mid_point",
            fields: TickFields {
                event_ts,
                mid_price: parse_f64(4),
                ..Default::default()
            },
        }),
        other => {
            warn!(kind = other, "unknown tick-by-tick kind");
            None
        }
    }
}
