//! [`Watchdog`] – loop progress monitor.
//!
//! Each watched component exposes a shared counter that it bumps once per
//! unit of work (one loop iteration for the acquisition poller).  The
//! watchdog samples those counters and considers a component *stalled* when
//! its counter has not moved within the component's timeout.  This catches
//! a loop stuck inside a blocking SDK call, which a fault record cannot.
//!
//! Call [`Watchdog::check_all`] from a supervisor to obtain the list of
//! stalled component IDs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentHealth {
    /// The component's counter advanced within its timeout.
    Healthy,
    /// The counter has not moved for longer than the timeout.
    Stalled { silent_for: Duration },
    Unknown,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct ComponentEntry {
    counter: Arc<AtomicU64>,
    last_value: u64,
    last_progress: Instant,
    timeout: Duration,
}

impl ComponentEntry {
    fn sample(&mut self) -> ComponentHealth {
        let now = self.counter.load(Ordering::Relaxed);
        if now != self.last_value {
            self.last_value = now;
            self.last_progress = Instant::now();
        }
        let silent_for = self.last_progress.elapsed();
        if silent_for <= self.timeout {
            ComponentHealth::Healthy
        } else {
            ComponentHealth::Stalled { silent_for }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::AtomicU64;
/// use std::time::Duration;
/// use detstream_kernel::watchdog::{ComponentHealth, Watchdog};
///
/// let heartbeat = Arc::new(AtomicU64::new(0));
/// let mut wd = Watchdog::new();
/// wd.register("poller", Arc::clone(&heartbeat), Duration::from_secs(1));
///
/// assert_eq!(wd.health("poller"), ComponentHealth::Healthy);
/// ```
#[derive(Default)]
pub struct Watchdog {
    components: HashMap<String, ComponentEntry>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `counter` under `component_id`.
    ///
    /// The component starts healthy.  Re-registering resets its deadline.
    pub fn register(&mut self, component_id: &str, counter: Arc<AtomicU64>, timeout: Duration) {
        let last_value = counter.load(Ordering::Relaxed);
        self.components.insert(
            component_id.to_string(),
            ComponentEntry {
                counter,
                last_value,
                last_progress: Instant::now(),
                timeout,
            },
        );
    }

    pub fn unregister(&mut self, component_id: &str) {
        self.components.remove(component_id);
    }

    /// Sample `component_id` and report its health.
    pub fn health(&mut self, component_id: &str) -> ComponentHealth {
        match self.components.get_mut(component_id) {
            Some(entry) => entry.sample(),
            None => ComponentHealth::Unknown,
        }
    }

    /// Sample every component and return the IDs of the stalled ones.  The
    /// order of the returned list is unspecified.
    pub fn check_all(&mut self) -> Vec<String> {
        self.components
            .iter_mut()
            .filter_map(|(id, entry)| match entry.sample() {
                ComponentHealth::Stalled { .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}
