//! Single-slot fault record.
//!
//! The loop side holds a [`FaultReporter`], the supervising side a
//! [`FaultMonitor`].  Only the first fault is kept; neither side ever
//! blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::ArrayQueue;
use detstream_types::{FaultRecord, StreamError};
use tracing::error;

struct FaultShared {
    alive: AtomicBool,
    recorded: AtomicBool,
    slot: ArrayQueue<FaultRecord>,
}

/// Create a connected reporter/monitor pair for one loop instance.
pub fn fault_slot() -> (FaultReporter, FaultMonitor) {
    let shared = Arc::new(FaultShared {
        alive: AtomicBool::new(true),
        recorded: AtomicBool::new(false),
        slot: ArrayQueue::new(1),
    });
    (
        FaultReporter {
            shared: Arc::clone(&shared),
        },
        FaultMonitor { shared },
    )
}

#[derive(Clone)]
pub struct FaultReporter {
    shared: Arc<FaultShared>,
}

impl FaultReporter {
    /// Record `error` as the fault that killed the loop and mark it dead.
    ///
    /// Returns `false` if a fault was already recorded; the first one wins.
    ///
    /// The record is in the slot before the loop reads as dead, so a monitor
    /// that sees `!is_alive()` after a fault always finds it.
    pub fn record(&self, error: StreamError, sent_frames: u64) -> bool {
        if self.shared.recorded.swap(true, Ordering::AcqRel) {
            self.shared.alive.store(false, Ordering::Release);
            return false;
        }
        error!(error = %error, sent_frames, "acquisition loop faulted");
        // The slot is empty: `recorded` guards the only push.
        let _ = self.shared.slot.push(FaultRecord::new(error, sent_frames));
        self.shared.alive.store(false, Ordering::Release);
        true
    }

    /// Mark the loop as exited without a fault (clean terminate).
    pub fn mark_exited(&self) {
        self.shared.alive.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct FaultMonitor {
    shared: Arc<FaultShared>,
}

impl FaultMonitor {
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// `true` if a fault was ever recorded, even if already taken.
    pub fn has_faulted(&self) -> bool {
        self.shared.recorded.load(Ordering::Acquire)
    }

    /// Drain the fault record.  Returns it at most once.
    pub fn take(&self) -> Option<FaultRecord> {
        self.shared.slot.pop()
    }
}
