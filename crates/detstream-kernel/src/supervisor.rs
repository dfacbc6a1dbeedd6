//! One health verdict for one acquisition loop.
//!
//! | verdict | meaning |
//! |---|---|
//! | [`LoopHealth::Alive`] | running and making progress |
//! | [`LoopHealth::Stalled`] | running but its heartbeat stopped (hung SDK call) |
//! | [`LoopHealth::Exited`] | exited cleanly on Terminate |
//! | [`LoopHealth::Faulted`] | dead; carries the fault that killed it |

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use detstream_types::{FaultRecord, StreamError};
use tracing::{error, warn};

use crate::fault::FaultMonitor;
use crate::watchdog::{ComponentHealth, Watchdog};

const LOOP_COMPONENT: &str = "acquisition-loop";

#[derive(Debug, Clone, PartialEq)]
pub enum LoopHealth {
    Alive,
    Stalled { silent_for: Duration },
    Exited,
    Faulted(FaultRecord),
}

pub struct Supervisor {
    monitor: FaultMonitor,
    watchdog: Watchdog,
    fault: Option<FaultRecord>,
    stall_reported: bool,
}

impl Supervisor {
    pub fn new(monitor: FaultMonitor, heartbeat: Arc<AtomicU64>, stall_timeout: Duration) -> Self {
        let mut watchdog = Watchdog::new();
        watchdog.register(LOOP_COMPONENT, heartbeat, stall_timeout);
        Self {
            monitor,
            watchdog,
            fault: None,
            stall_reported: false,
        }
    }

    /// Check the loop.  A drained fault is kept, so repeated polls keep
    /// returning [`LoopHealth::Faulted`] with the same record.
    ///
    /// A loop that faulted is never reported as [`LoopHealth::Exited`]: if
    /// another monitor handle drained the record first, the verdict carries
    /// a [`StreamError::LoopDead`] record instead.
    pub fn poll(&mut self) -> LoopHealth {
        if !self.monitor.is_alive() {
            if let Some(record) = self.monitor.take() {
                let json = serde_json::to_string(&record).unwrap_or_default();
                error!(fault = %json, "supervisor: acquisition loop is dead");
                self.fault = Some(record);
            } else if self.fault.is_none() && self.monitor.has_faulted() {
                warn!("supervisor: loop faulted but its record was taken elsewhere");
                self.fault = Some(FaultRecord::new(StreamError::LoopDead, 0));
            }
            return match &self.fault {
                Some(record) => LoopHealth::Faulted(record.clone()),
                None => LoopHealth::Exited,
            };
        }

        match self.watchdog.health(LOOP_COMPONENT) {
            ComponentHealth::Stalled { silent_for } => {
                if !self.stall_reported {
                    warn!(?silent_for, "supervisor: acquisition loop stalled");
                    self.stall_reported = true;
                }
                LoopHealth::Stalled { silent_for }
            }
            _ => {
                self.stall_reported = false;
                LoopHealth::Alive
            }
        }
    }

    /// The fault that killed the loop, once observed by [`poll`][Self::poll].
    pub fn fault(&self) -> Option<&FaultRecord> {
        self.fault.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::fault_slot;
    use std::sync::atomic::Ordering;

    #[test]
    fn running_loop_is_alive() {
        let (_reporter, monitor) = fault_slot();
        let mut sup = Supervisor::new(monitor, Arc::new(AtomicU64::new(0)), Duration::from_secs(5));
        assert_eq!(sup.poll(), LoopHealth::Alive);
    }

    #[test]
    fn fault_is_reported_on_every_poll() {
        let (reporter, monitor) = fault_slot();
        let mut sup = Supervisor::new(monitor, Arc::new(AtomicU64::new(0)), Duration::from_secs(5));
        reporter.record(StreamError::Overrun { sent_frames: 2 }, 2);

        for _ in 0..2 {
            let LoopHealth::Faulted(record) = sup.poll() else {
                panic!("expected Faulted");
            };
            assert_eq!(record.error, StreamError::Overrun { sent_frames: 2 });
        }
        assert!(sup.fault().is_some());
    }

    #[test]
    fn clean_exit_is_not_a_fault() {
        let (reporter, monitor) = fault_slot();
        let mut sup = Supervisor::new(monitor, Arc::new(AtomicU64::new(0)), Duration::from_secs(5));
        reporter.mark_exited();
        assert_eq!(sup.poll(), LoopHealth::Exited);
        assert!(sup.fault().is_none());
    }

    #[test]
    fn fault_drained_elsewhere_is_still_a_fault() {
        let (reporter, monitor) = fault_slot();
        let other = monitor.clone();
        let mut sup = Supervisor::new(monitor, Arc::new(AtomicU64::new(0)), Duration::from_secs(5));
        reporter.record(StreamError::Panic("boom".into()), 0);
        assert!(other.take().is_some());

        let LoopHealth::Faulted(record) = sup.poll() else {
            panic!("expected Faulted");
        };
        assert_eq!(record.error, StreamError::LoopDead);
    }

    #[test]
    fn racing_fault_is_never_seen_as_a_clean_exit() {
        for _ in 0..200 {
            let (reporter, monitor) = fault_slot();
            let mut sup =
                Supervisor::new(monitor, Arc::new(AtomicU64::new(0)), Duration::from_secs(5));
            let thread = std::thread::spawn(move || {
                reporter.record(StreamError::Overrun { sent_frames: 3 }, 3);
            });
            let verdict = loop {
                match sup.poll() {
                    LoopHealth::Alive | LoopHealth::Stalled { .. } => std::hint::spin_loop(),
                    other => break other,
                }
            };
            let LoopHealth::Faulted(record) = verdict else {
                panic!("fault reported as {verdict:?}");
            };
            assert_eq!(record.error, StreamError::Overrun { sent_frames: 3 });
            thread.join().unwrap();
        }
    }

    #[test]
    fn silent_heartbeat_is_a_stall_until_it_moves() {
        let (_reporter, monitor) = fault_slot();
        let hb = Arc::new(AtomicU64::new(0));
        let mut sup = Supervisor::new(monitor, Arc::clone(&hb), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(sup.poll(), LoopHealth::Stalled { .. }));
        hb.fetch_add(1, Ordering::Relaxed);
        assert_eq!(sup.poll(), LoopHealth::Alive);
    }
}
