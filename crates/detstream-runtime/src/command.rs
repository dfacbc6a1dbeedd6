//! Non-blocking command inbox for the acquisition loop.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use detstream_types::{Command, StreamError};

/// Default number of commands that may wait for the loop.
pub const DEFAULT_COMMAND_CAPACITY: usize = 16;

/// Bounded, lock-free command queue.  Clones share the same queue.
///
/// Neither side ever blocks: `push` fails fast when the queue is full and
/// `pop_nonblocking` returns `None` when it is empty.
#[derive(Clone)]
pub struct CommandChannel {
    queue: Arc<ArrayQueue<Command>>,
}

impl CommandChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn push(&self, command: Command) -> Result<(), StreamError> {
        self.queue
            .push(command)
            .map_err(|_| StreamError::CommandQueueFull)
    }

    pub fn pop_nonblocking(&self) -> Option<Command> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_come_out_in_order() {
        let channel = CommandChannel::default();
        channel.push(Command::start("a", false, 1)).unwrap();
        channel.push(Command::Stop).unwrap();
        assert!(matches!(channel.pop_nonblocking(), Some(Command::Start(_))));
        assert_eq!(channel.pop_nonblocking(), Some(Command::Stop));
        assert_eq!(channel.pop_nonblocking(), None);
    }

    #[test]
    fn full_channel_rejects_instead_of_blocking() {
        let channel = CommandChannel::new(2);
        channel.push(Command::Stop).unwrap();
        channel.push(Command::Stop).unwrap();
        assert_eq!(channel.push(Command::Terminate), Err(StreamError::CommandQueueFull));
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn clones_share_the_queue() {
        let producer = CommandChannel::default();
        let consumer = producer.clone();
        std::thread::spawn(move || producer.push(Command::Terminate).unwrap())
            .join()
            .unwrap();
        assert_eq!(consumer.pop_nonblocking(), Some(Command::Terminate));
        assert!(consumer.is_empty());
    }
}
