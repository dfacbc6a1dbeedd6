//! On-demand snapshot service for live views.
//!
//! The responder is strictly request-then-reply: it polls its socket once
//! per loop iteration, never blocks, and never sends a reply that was not
//! asked for.
//!
//! | policy | behaviour after a reply |
//! |---|---|
//! | [`MonitorPolicy::Latest`] | the next request is answered immediately, possibly with the same frame |
//! | [`MonitorPolicy::FreshOnly`] | the next request waits until a new frame has been published |
//!
//! Under `FreshOnly` the placeholder counts as served: before the first frame
//! one request gets the placeholder and every later one waits for frame 0.
//!
//! A reply the client never collected (it timed out) is overwritten by the
//! next one.  A slow or vanished client never produces an error here.

use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use detstream_types::StreamError;
use tracing::{debug, trace};

use crate::protocol::{MonitorSnapshot, WireMessage};

/// Server half of a request/reply transport.
pub trait ReplySocket: Send {
    /// Take one pending request, if any, without blocking.
    fn try_recv_request(&mut self) -> Result<Option<Bytes>, StreamError>;

    /// Answer the request most recently taken.
    fn send_reply(&mut self, reply: WireMessage) -> Result<(), StreamError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MonitorPolicy {
    #[default]
    Latest,
    FreshOnly,
}

pub struct MonitorResponder {
    socket: Box<dyn ReplySocket>,
    policy: MonitorPolicy,
    latest: MonitorSnapshot,
    latest_served: bool,
    pending: bool,
    replies: u64,
}

impl MonitorResponder {
    pub fn new(socket: Box<dyn ReplySocket>, policy: MonitorPolicy) -> Self {
        Self {
            socket,
            policy,
            latest: MonitorSnapshot::placeholder(),
            latest_served: false,
            pending: false,
            replies: 0,
        }
    }

    /// Record the most recently published frame.
    pub fn update(&mut self, snapshot: MonitorSnapshot) {
        self.latest = snapshot;
        self.latest_served = false;
    }

    /// Serve at most one pending request.  Returns `true` if a reply was sent.
    pub fn poll(&mut self) -> Result<bool, StreamError> {
        if !self.pending {
            match self.socket.try_recv_request()? {
                Some(request) => {
                    trace!(bytes = request.len(), "monitor request");
                    self.pending = true;
                }
                None => return Ok(false),
            }
        }
        if self.policy == MonitorPolicy::FreshOnly && self.latest_served {
            return Ok(false);
        }
        self.socket.send_reply(WireMessage::monitor_reply(&self.latest)?)?;
        self.pending = false;
        self.latest_served = true;
        self.replies += 1;
        Ok(true)
    }

    pub fn replies(&self) -> u64 {
        self.replies
    }

    /// `true` while a request has been taken but not yet answered.
    pub fn has_pending_request(&self) -> bool {
        self.pending
    }
}

// ---------------------------------------------------------------------------
// In-process channel
// ---------------------------------------------------------------------------

/// Create a connected in-process reply socket and its client.
///
/// Both directions hold at most one message, so at most one request is
/// ever in flight.
pub fn monitor_channel() -> (InprocReplySocket, InprocMonitorClient) {
    let (request_tx, request_rx) = channel::bounded(1);
    let (reply_tx, reply_rx) = channel::bounded(1);
    (
        InprocReplySocket {
            requests: request_rx,
            replies: reply_tx,
            unread: reply_rx.clone(),
        },
        InprocMonitorClient {
            requests: request_tx,
            replies: reply_rx,
        },
    )
}

pub struct InprocReplySocket {
    requests: Receiver<Bytes>,
    replies: Sender<WireMessage>,
    /// Lets the server evict a reply its client abandoned.
    unread: Receiver<WireMessage>,
}

impl ReplySocket for InprocReplySocket {
    fn try_recv_request(&mut self) -> Result<Option<Bytes>, StreamError> {
        match self.requests.try_recv() {
            Ok(request) => Ok(Some(request)),
            // A vanished client is not the loop's problem.
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn send_reply(&mut self, reply: WireMessage) -> Result<(), StreamError> {
        let reply = match self.replies.try_send(reply) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => return Ok(()),
            Err(TrySendError::Full(reply)) => reply,
        };
        if self.unread.try_recv().is_ok() {
            debug!("monitor: replacing a reply the client never read");
        }
        // The client may have refilled the slot in between; it then has a
        // reply and this one is dropped.
        let _ = self.replies.try_send(reply);
        Ok(())
    }
}

/// Client half of the in-process monitor channel.
#[derive(Clone)]
pub struct InprocMonitorClient {
    requests: Sender<Bytes>,
    replies: Receiver<WireMessage>,
}

impl InprocMonitorClient {
    /// Send `request` and wait up to `timeout` for the snapshot.
    pub fn request(&self, request: &str, timeout: Duration) -> Result<WireMessage, StreamError> {
        // Discard a late reply to an earlier request that timed out.
        while self.replies.try_recv().is_ok() {}

        self.requests
            .try_send(Bytes::copy_from_slice(request.as_bytes()))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    StreamError::Transport("a monitor request is already in flight".into())
                }
                TrySendError::Disconnected(_) => StreamError::LoopDead,
            })?;
        self.replies
            .recv_timeout(timeout)
            .map_err(|e| StreamError::Transport(format!("monitor reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DecodedMessage;
    use detstream_types::FrameImage;

    fn snapshot(frame: u64) -> MonitorSnapshot {
        MonitorSnapshot {
            frame,
            image: FrameImage::from_u32([1, 1], &[frame as u32]).unwrap(),
            exptime: Some(0.5),
        }
    }

    fn reply_frame(msg: &WireMessage) -> u64 {
        match msg.decode().unwrap() {
            DecodedMessage::Image { frame, .. } => frame,
            other => panic!("expected image reply, got {other:?}"),
        }
    }

    #[test]
    fn no_request_means_no_reply() {
        let (socket, client) = monitor_channel();
        let mut responder = MonitorResponder::new(Box::new(socket), MonitorPolicy::Latest);
        for _ in 0..10 {
            assert!(!responder.poll().unwrap());
        }
        assert_eq!(responder.replies(), 0);
        assert!(client.replies.try_recv().is_err());
    }

    #[test]
    fn placeholder_served_before_first_frame() {
        let (socket, client) = monitor_channel();
        let mut responder = MonitorResponder::new(Box::new(socket), MonitorPolicy::Latest);
        client.requests.send(Bytes::from_static(b"ping")).unwrap();
        assert!(responder.poll().unwrap());

        let reply = client.replies.try_recv().unwrap();
        let DecodedMessage::Image { frame, image, .. } = reply.decode().unwrap() else {
            panic!("expected image");
        };
        assert_eq!(frame, 0);
        assert_eq!(image.to_u32_vec(), Some(vec![0; 4]));
    }

    #[test]
    fn one_reply_per_request() {
        let (socket, client) = monitor_channel();
        let mut responder = MonitorResponder::new(Box::new(socket), MonitorPolicy::Latest);
        responder.update(snapshot(3));

        client.requests.send(Bytes::from_static(b"a")).unwrap();
        assert!(responder.poll().unwrap());
        assert!(!responder.poll().unwrap());
        assert_eq!(reply_frame(&client.replies.try_recv().unwrap()), 3);

        client.requests.send(Bytes::from_static(b"b")).unwrap();
        assert!(responder.poll().unwrap());
        assert_eq!(reply_frame(&client.replies.try_recv().unwrap()), 3);
        assert_eq!(responder.replies(), 2);
    }

    #[test]
    fn fresh_only_holds_request_until_new_frame() {
        let (socket, client) = monitor_channel();
        let mut responder = MonitorResponder::new(Box::new(socket), MonitorPolicy::FreshOnly);
        responder.update(snapshot(1));

        client.requests.send(Bytes::from_static(b"a")).unwrap();
        assert!(responder.poll().unwrap());
        client.replies.try_recv().unwrap();

        client.requests.send(Bytes::from_static(b"b")).unwrap();
        assert!(!responder.poll().unwrap());
        assert!(responder.has_pending_request());

        responder.update(snapshot(2));
        assert!(responder.poll().unwrap());
        assert_eq!(reply_frame(&client.replies.try_recv().unwrap()), 2);
    }

    #[test]
    fn unread_reply_is_replaced_by_the_newer_one() {
        let (socket, client) = monitor_channel();
        let mut responder = MonitorResponder::new(Box::new(socket), MonitorPolicy::Latest);
        responder.update(snapshot(1));
        client.requests.send(Bytes::from_static(b"a")).unwrap();
        assert!(responder.poll().unwrap());

        // The reply to "a" is never collected.
        client.requests.send(Bytes::from_static(b"b")).unwrap();
        responder.update(snapshot(2));
        assert!(responder.poll().unwrap());

        assert_eq!(reply_frame(&client.replies.try_recv().unwrap()), 2);
        assert!(client.replies.try_recv().is_err());
    }

    #[test]
    fn fresh_only_serves_placeholder_once_then_waits_for_frame_zero() {
        let (socket, client) = monitor_channel();
        let mut responder = MonitorResponder::new(Box::new(socket), MonitorPolicy::FreshOnly);
        client.requests.send(Bytes::from_static(b"a")).unwrap();
        assert!(responder.poll().unwrap());
        assert_eq!(reply_frame(&client.replies.try_recv().unwrap()), 0);

        client.requests.send(Bytes::from_static(b"b")).unwrap();
        assert!(!responder.poll().unwrap());
        responder.update(snapshot(0));
        assert!(responder.poll().unwrap());
    }

    #[test]
    fn timed_out_requests_never_make_poll_fail() {
        let (socket, client) = monitor_channel();
        let mut responder = MonitorResponder::new(Box::new(socket), MonitorPolicy::FreshOnly);
        let timeout = Duration::from_millis(1);

        assert!(client.request("a", timeout).is_err());
        assert!(responder.poll().unwrap()); // placeholder, never read
        assert!(client.request("b", timeout).is_err());
        assert!(!responder.poll().unwrap()); // holds "b" for a fresh frame
        assert!(client.request("c", timeout).is_err());

        responder.update(snapshot(0));
        assert!(responder.poll().unwrap()); // answers "b"
        assert!(!responder.poll().unwrap()); // holds "c"
        responder.update(snapshot(1));
        assert!(responder.poll().unwrap()); // answers "c" over the unread reply

        assert_eq!(reply_frame(&client.replies.try_recv().unwrap()), 1);
        assert_eq!(responder.replies(), 3);
    }

    #[test]
    fn client_round_trip_on_another_thread() {
        let (socket, client) = monitor_channel();
        let mut responder = MonitorResponder::new(Box::new(socket), MonitorPolicy::Latest);
        responder.update(snapshot(9));

        let handle = std::thread::spawn(move || client.request("snapshot", Duration::from_secs(5)));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !responder.poll().unwrap() {
            assert!(std::time::Instant::now() < deadline, "request never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
        let reply = handle.join().unwrap().unwrap();
        assert_eq!(reply_frame(&reply), 9);
    }

    #[test]
    fn request_times_out_without_a_responder_poll() {
        let (_socket, client) = monitor_channel();
        let err = client.request("x", Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, StreamError::Transport(_)));
    }

    #[test]
    fn request_to_dropped_responder_reports_dead_loop() {
        let (socket, client) = monitor_channel();
        drop(socket);
        let err = client.request("x", Duration::from_millis(5)).unwrap_err();
        assert_eq!(err, StreamError::LoopDead);
    }
}
