//! Stream multiplexing: one upstream subscription per `(contract, tick
//! type)`, fanned out to any number of downstream sinks with per-subscriber
//! backpressure.

pub mod multiplexer;
pub mod sink;

pub use multiplexer::{Multiplexer, StreamInfo, StreamState, Subscription};
pub use sink::{NullSink, OfferOutcome, QueueSink, SinkReceiver, StreamEvent, TickSink};
