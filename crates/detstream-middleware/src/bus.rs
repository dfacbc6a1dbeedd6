//! In-process broadcast transport for wire messages.
//!
//! Uses [`tokio::sync::broadcast`] under the hood so that every subscriber
//! receives every message without any single subscriber blocking the
//! producer.  A subscriber that falls more than `capacity` messages behind
//! loses the oldest ones and sees a gap; the producer never waits.

use std::time::{Duration, Instant};

use detstream_types::StreamError;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

use crate::protocol::WireMessage;
use crate::publisher::DataSink;
use crate::receiver::MessageSource;

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 1024;

/// Shared data-stream bus. Clone it cheaply – all clones share the same
/// underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct WireBus {
    sender: broadcast::Sender<WireMessage>,
}

impl WireBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `message` to every current subscriber.
    ///
    /// Returns the number of subscribers handed the message.  `0` when
    /// nobody is listening, which is a normal condition.
    pub fn publish(&self, message: WireMessage) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> BusSubscriber {
        BusSubscriber {
            receiver: self.sender.subscribe(),
            lagged: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WireBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DataSink for WireBus {
    fn send(&mut self, message: WireMessage) -> Result<bool, StreamError> {
        self.publish(message);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// A receiver bound to a [`WireBus`].
pub struct BusSubscriber {
    receiver: broadcast::Receiver<WireMessage>,
    lagged: u64,
}

impl BusSubscriber {
    /// Wait for the next message.  Returns `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered message without waiting.
    ///
    /// `Ok(None)` when nothing is buffered; an error once the bus is closed.
    pub fn try_recv(&mut self) -> Result<Option<WireMessage>, StreamError> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Ok(Some(message)),
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Closed) => {
                    return Err(StreamError::Transport("wire bus closed".into()));
                }
            }
        }
    }

    /// Messages this subscriber missed by falling behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    fn record_lag(&mut self, n: u64) {
        warn!(lagged_by = n, "BusSubscriber lagged");
        self.lagged += n;
    }
}

impl MessageSource for BusSubscriber {
    fn next_message(&mut self, timeout: Duration) -> Result<Option<WireMessage>, StreamError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_recv()? {
                return Ok(Some(message));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
