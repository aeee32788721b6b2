//! Subscriber sinks.
//!
//! A sink is the multiplexer's only view of a subscriber: a non-blocking
//! offer backed by a bounded queue. Transports own the receiving end and
//! drain it at their own pace; the multiplexer never waits on a subscriber.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ServiceError;
use crate::models::TickRecord;

/// Result of offering one record to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    /// Queue full; the record was not delivered to this subscriber.
    Dropped,
    /// The subscriber is gone; the slot should be removed.
    Closed,
}

/// What flows from the multiplexer to a transport.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Tick(TickRecord),
    /// Terminal error; no further events follow.
    Error {
        code: &'static str,
        message: String,
        recoverable: bool,
    },
    /// Upstream signalled the end of the stream.
    Complete { reason: String },
}

/// Non-blocking per-subscriber delivery target.
pub trait TickSink: Send + Sync {
    fn try_offer(&self, record: &TickRecord) -> OfferOutcome;

    /// Deliver a terminal notice. Must not block: if the queue is full the
    /// notice is parked and surfaces once the queue drains.
    fn close(&self, error: Option<&ServiceError>);
}

/// Standard sink over a bounded tokio channel. The paired
/// [`SinkReceiver`] is held by the transport; leaving it un-drained is how
/// the buffer+live handoff pauses delivery without losing records.
pub struct QueueSink {
    tx: mpsc::Sender<StreamEvent>,
    terminal: Arc<Mutex<Option<StreamEvent>>>,
}

impl QueueSink {
    pub fn channel(capacity: usize) -> (Self, SinkReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let terminal = Arc::new(Mutex::new(None));
        (
            Self {
                tx,
                terminal: terminal.clone(),
            },
            SinkReceiver {
                rx,
                terminal,
                finished: false,
            },
        )
    }
}

impl TickSink for QueueSink {
    fn try_offer(&self, record: &TickRecord) -> OfferOutcome {
        match self.tx.try_send(StreamEvent::Tick(record.clone())) {
            Ok(()) => OfferOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => OfferOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => OfferOutcome::Closed,
        }
    }

    fn close(&self, error: Option<&ServiceError>) {
        let event = match error {
            Some(e) => StreamEvent::Error {
                code: e.code(),
                message: e.to_string(),
                recoverable: e.recoverable(),
            },
            None => StreamEvent::Complete {
                reason: "stream ended".to_string(),
            },
        };
        // A saturated queue cannot take the notice; park it so the receiver
        // still sees it after draining the backlog.
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            *self.terminal.lock() = Some(event);
        }
    }
}

/// Receiving half of a [`QueueSink`]. Yields queued events in order, then
/// any parked terminal notice once the sender side is gone.
pub struct SinkReceiver {
    rx: mpsc::Receiver<StreamEvent>,
    terminal: Arc<Mutex<Option<StreamEvent>>>,
    finished: bool,
}

impl SinkReceiver {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => Some(event),
            None => {
                self.finished = true;
                self.terminal.lock().take()
            }
        }
    }
}

impl futures_util::Stream for SinkReceiver {
    type Item = StreamEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<StreamEvent>> {
        use std::task::Poll;
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(self.terminal.lock().take())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sink for storage-only background streams: accepts and discards
/// everything. Persistence and the tail ring are fed upstream of fan-out,
/// so discarding here loses nothing.
pub struct NullSink;

impl TickSink for NullSink {
    fn try_offer(&self, _record: &TickRecord) -> OfferOutcome {
        OfferOutcome::Accepted
    }

    fn close(&self, _error: Option<&ServiceError>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickType;

    fn record() -> TickRecord {
        TickRecord {
            event_ts_us: 1,
            sys_ts_us: 1,
            contract_id: 1,
            tick_type: TickType::Last,
            request_id: 1,
            price: Some(1.0),
            size: Some(1.0),
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            mid_price: None,
            bid_past_low: false,
            ask_past_high: false,
            unreported: false,
        }
    }

    #[tokio::test]
    async fn offer_reports_queue_pressure() {
        let (sink, mut rx) = QueueSink::channel(2);
        assert_eq!(sink.try_offer(&record()), OfferOutcome::Accepted);
        assert_eq!(sink.try_offer(&record()), OfferOutcome::Accepted);
        assert_eq!(sink.try_offer(&record()), OfferOutcome::Dropped);

        // Draining one slot makes room again.
        assert!(matches!(rx.recv().await, Some(StreamEvent::Tick(_))));
        assert_eq!(sink.try_offer(&record()), OfferOutcome::Accepted);
    }

    #[tokio::test]
    async fn offer_detects_closed_subscriber() {
        let (sink, rx) = QueueSink::channel(2);
        drop(rx);
        assert_eq!(sink.try_offer(&record()), OfferOutcome::Closed);
    }

    #[tokio::test]
    async fn close_delivers_terminal_error() {
        let (sink, mut rx) = QueueSink::channel(2);
        sink.close(Some(&ServiceError::SlowConsumer));
        let Some(StreamEvent::Error {
            code, recoverable, ..
        }) = rx.recv().await
        else {
            panic!("expected error event");
        };
        assert_eq!(code, "slow_consumer");
        assert!(!recoverable);
    }

    #[tokio::test]
    async fn terminal_error_survives_a_full_queue() {
        let (sink, mut rx) = QueueSink::channel(1);
        assert_eq!(sink.try_offer(&record()), OfferOutcome::Accepted);
        sink.close(Some(&ServiceError::SlowConsumer));
        drop(sink);

        assert!(matches!(rx.recv().await, Some(StreamEvent::Tick(_))));
        let Some(StreamEvent::Error { code, .. }) = rx.recv().await else {
            panic!("expected parked error event");
        };
        assert_eq!(code, "slow_consumer");
        assert!(rx.recv().await.is_none());
    }
}
