//! `detstream-hal` – Instrument Abstraction
//!
//! The streaming loop never talks to a detector SDK directly.  It drives an
//! [`Instrument`], which exposes exactly the primitives needed to drain a
//! hardware circular buffer safely.
//!
//! # Modules
//!
//! - [`instrument`] – the [`Instrument`] trait.
//! - [`scalers`] – [`RawScalers`]: raw per-channel hardware counters and the
//!   dead-time correction / output count rate derived from them.
//! - [`sim`] – [`SimInstrument`]: an in-process detector with a finite
//!   circular buffer for headless runs and tests.

pub mod instrument;
pub mod scalers;
pub mod sim;

pub use instrument::Instrument;
pub use scalers::{CLOCK_FREQUENCY_HZ, RawScalers, scalar_bundle};
pub use sim::{SimCall, SimConfig, SimInstrument};
