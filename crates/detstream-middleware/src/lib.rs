//! `detstream-middleware` – Wire Protocol and Transports
//!
//! Moves frames from the acquisition loop to consumers without ever letting
//! a consumer slow the producer down.
//!
//! # Modules
//!
//! - [`protocol`] – [`WireMessage`] multipart encoding of headers, frames,
//!   footers and monitor replies.
//! - [`bus`] – in-process broadcast transport built on Tokio broadcast
//!   channels.
//! - [`publisher`] – [`FramePublisher`]: emits the ordered series framing
//!   onto any [`DataSink`].
//! - [`monitor`] – [`MonitorResponder`]: strict request/reply snapshot
//!   service, plus its in-process channel.
//! - [`receiver`] – consumer side: [`SeriesDecoder`] and [`PrintReceiver`].
//! - `zmq` – ZeroMQ PUB/REP transports (feature `zmq-transport`).

pub mod bus;
pub mod monitor;
pub mod protocol;
pub mod publisher;
pub mod receiver;
#[cfg(feature = "zmq-transport")]
pub mod zmq;

pub use bus::{BusSubscriber, WireBus};
pub use monitor::{
    InprocMonitorClient, InprocReplySocket, MonitorPolicy, MonitorResponder, ReplySocket,
    monitor_channel,
};
pub use protocol::{DecodedMessage, MonitorSnapshot, WireMessage};
pub use publisher::{DataSink, FramePublisher, PublisherStats};
pub use receiver::{MessageSource, PrintReceiver, ReceiverSummary, SeriesDecoder, SeriesEvent};
