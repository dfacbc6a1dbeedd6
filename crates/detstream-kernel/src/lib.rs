//! `detstream-kernel` – Fault Capture & Supervision
//!
//! The acquisition loop never retries.  When it fails, this crate holds the
//! evidence and tells whoever is watching.
//!
//! # Modules
//!
//! - [`fault`] – [`fault_slot`][fault::fault_slot]: a single-slot, lock-free
//!   fault record shared between the loop ([`FaultReporter`]) and its
//!   supervisor ([`FaultMonitor`]).
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: detects loops whose
//!   heartbeat counter stopped advancing.
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: combines both
//!   into one [`LoopHealth`] verdict.

pub mod fault;
pub mod supervisor;
pub mod watchdog;

pub use fault::{FaultMonitor, FaultReporter, fault_slot};
pub use supervisor::{LoopHealth, Supervisor};
pub use watchdog::{ComponentHealth, Watchdog};
