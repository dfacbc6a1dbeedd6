//! ZeroMQ transports (feature `zmq-transport`).
//!
//! | socket | role | notes |
//! |---|---|---|
//! | PUB | data stream | `DONTWAIT`; a full send queue drops the message |
//! | REP | monitor server | polled with `DONTWAIT` once per loop iteration; a reply refused with `EAGAIN` is retried on the next poll |
//! | REQ | monitor client | relaxed + correlated so a timed-out request can be retried |
//! | SUB | consumer | subscribes to everything |

use std::time::Duration;

use bytes::Bytes;
use detstream_types::StreamError;
use tracing::{debug, info};

use crate::monitor::ReplySocket;
use crate::protocol::WireMessage;
use crate::publisher::DataSink;
use crate::receiver::MessageSource;

fn transport(e: zmq::Error) -> StreamError {
    StreamError::Transport(e.to_string())
}

fn to_message(parts: Vec<Vec<u8>>) -> WireMessage {
    WireMessage::from_parts(parts.into_iter().map(Bytes::from).collect())
}

fn timeout_ms(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

/// `tcp://*:<port>` for servers.
pub fn bind_endpoint(port: u16) -> String {
    format!("tcp://*:{port}")
}

/// `tcp://<host>:<port>` for clients.
pub fn connect_endpoint(host: &str, port: u16) -> String {
    format!("tcp://{host}:{port}")
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// PUB socket carrying the data stream.
pub struct ZmqPublisher {
    socket: zmq::Socket,
}

impl ZmqPublisher {
    pub fn bind(context: &zmq::Context, endpoint: &str, send_hwm: i32) -> Result<Self, StreamError> {
        let socket = context.socket(zmq::PUB).map_err(transport)?;
        socket.set_linger(0).map_err(transport)?;
        socket.set_sndhwm(send_hwm).map_err(transport)?;
        socket.bind(endpoint).map_err(transport)?;
        info!(endpoint, send_hwm, "data stream publisher bound");
        Ok(Self { socket })
    }
}

impl DataSink for ZmqPublisher {
    fn send(&mut self, message: WireMessage) -> Result<bool, StreamError> {
        let parts: Vec<&[u8]> = message.parts().iter().map(|p| &p[..]).collect();
        match self.socket.send_multipart(parts, zmq::DONTWAIT) {
            Ok(()) => Ok(true),
            Err(zmq::Error::EAGAIN) => Ok(false),
            Err(e) => Err(transport(e)),
        }
    }
}

/// REP socket serving monitor snapshots.
pub struct ZmqReplySocket {
    socket: zmq::Socket,
    /// A reply the socket refused; REP must send it before the next receive.
    unsent: Option<WireMessage>,
}

impl ZmqReplySocket {
    pub fn bind(context: &zmq::Context, endpoint: &str) -> Result<Self, StreamError> {
        let socket = context.socket(zmq::REP).map_err(transport)?;
        socket.set_linger(0).map_err(transport)?;
        socket.bind(endpoint).map_err(transport)?;
        info!(endpoint, "monitor responder bound");
        Ok(Self {
            socket,
            unsent: None,
        })
    }
}

impl ReplySocket for ZmqReplySocket {
    fn try_recv_request(&mut self) -> Result<Option<Bytes>, StreamError> {
        if let Some(reply) = self.unsent.take() {
            self.send_reply(reply)?;
            if self.unsent.is_some() {
                return Ok(None);
            }
        }
        match self.socket.recv_multipart(zmq::DONTWAIT) {
            Ok(parts) => Ok(Some(Bytes::from(parts.concat()))),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(transport(e)),
        }
    }

    fn send_reply(&mut self, reply: WireMessage) -> Result<(), StreamError> {
        let parts: Vec<&[u8]> = reply.parts().iter().map(|p| &p[..]).collect();
        match self.socket.send_multipart(parts, zmq::DONTWAIT) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) => {
                debug!("monitor: reply queue full, retrying next poll");
                self.unsent = Some(reply);
                Ok(())
            }
            Err(e) => Err(transport(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// REQ client for the monitor channel.
pub struct ZmqMonitorClient {
    socket: zmq::Socket,
}

impl ZmqMonitorClient {
    pub fn connect(context: &zmq::Context, endpoint: &str) -> Result<Self, StreamError> {
        let socket = context.socket(zmq::REQ).map_err(transport)?;
        socket.set_linger(0).map_err(transport)?;
        socket.set_req_relaxed(true).map_err(transport)?;
        socket.set_req_correlate(true).map_err(transport)?;
        socket.connect(endpoint).map_err(transport)?;
        Ok(Self { socket })
    }

    pub fn request(&self, request: &str, timeout: Duration) -> Result<WireMessage, StreamError> {
        self.socket
            .set_rcvtimeo(timeout_ms(timeout))
            .map_err(transport)?;
        self.socket.send(request, 0).map_err(transport)?;
        let parts = self.socket.recv_multipart(0).map_err(transport)?;
        Ok(to_message(parts))
    }
}

/// SUB consumer of the data stream.
pub struct ZmqSubscriber {
    socket: zmq::Socket,
}

impl ZmqSubscriber {
    pub fn connect(context: &zmq::Context, endpoint: &str) -> Result<Self, StreamError> {
        let socket = context.socket(zmq::SUB).map_err(transport)?;
        socket.set_subscribe(b"").map_err(transport)?;
        socket.connect(endpoint).map_err(transport)?;
        Ok(Self { socket })
    }
}

impl MessageSource for ZmqSubscriber {
    fn next_message(&mut self, timeout: Duration) -> Result<Option<WireMessage>, StreamError> {
        self.socket
            .set_rcvtimeo(timeout_ms(timeout))
            .map_err(transport)?;
        match self.socket.recv_multipart(0) {
            Ok(parts) => Ok(Some(to_message(parts))),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(transport(e)),
        }
    }
}
