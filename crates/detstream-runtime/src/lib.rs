//! `detstream-runtime` – The Acquisition Loop
//!
//! Drains a detector's circular buffer onto the data stream, one frame per
//! iteration, without ever waiting on a consumer.
//!
//! # Modules
//!
//! - [`command`] – [`CommandChannel`][command::CommandChannel]: the bounded,
//!   lock-free inbox for Start / Stop / Terminate.
//! - [`poller`] – [`AcquisitionPoller`][poller::AcquisitionPoller]: owns all
//!   session state; command → monitor → frame → overrun per iteration.
//! - [`streamer`] – [`Streamer`][streamer::Streamer]: runs the poller on a
//!   dedicated thread and hands back a [`StreamerHandle`].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod command;
pub mod poller;
pub mod streamer;
pub mod telemetry;

pub use command::CommandChannel;
pub use poller::{AcquisitionPoller, LoopStatus, PollerConfig, StatusSnapshot, StepOutcome};
pub use streamer::{Streamer, StreamerConfig, StreamerHandle};
pub use telemetry::{TracerProviderGuard, init_tracing};

// Supervisors only need the runtime crate to interpret a handle's health.
pub use detstream_kernel::LoopHealth;
