//! [`Streamer`] – runs an [`AcquisitionPoller`] on its own thread.
//!
//! The returned [`StreamerHandle`] is the only way in: it pushes commands,
//! reads status, and asks the [`Supervisor`] for a health verdict.  Dropping
//! the handle terminates the loop and joins the thread.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use detstream_hal::{SimConfig, SimInstrument};
//! use detstream_middleware::{WireBus, monitor_channel};
//! use detstream_runtime::{Streamer, StreamerConfig};
//!
//! let sim = SimInstrument::new(SimConfig::default());
//! let (reply_socket, _monitor) = monitor_channel();
//! let handle = Streamer::spawn(
//!     sim.clone(),
//!     Box::new(WireBus::default()),
//!     Box::new(reply_socket),
//!     StreamerConfig::default(),
//! )
//! .unwrap();
//!
//! sim.arm(3, Duration::ZERO);
//! handle.start("none", false, 3).unwrap();
//! while handle.status().completed_series == 0 {
//!     std::thread::sleep(Duration::from_millis(1));
//! }
//! assert!(handle.join().is_none());
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use detstream_hal::Instrument;
use detstream_kernel::{FaultMonitor, LoopHealth, Supervisor, fault_slot};
use detstream_middleware::{DataSink, FramePublisher, MonitorResponder, ReplySocket};
use detstream_types::{Command, FaultRecord, StreamError};
use tracing::{error, info};
use uuid::Uuid;

use crate::command::{CommandChannel, DEFAULT_COMMAND_CAPACITY};
use crate::poller::{AcquisitionPoller, LoopStatus, PollerConfig, StatusSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct StreamerConfig {
    pub poller: PollerConfig,
    pub command_capacity: usize,
    /// Heartbeat silence after which the loop is reported as stalled.
    pub stall_timeout: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            stall_timeout: Duration::from_secs(2),
        }
    }
}

pub struct Streamer;

impl Streamer {
    /// Build the poller around `instrument` and the two transports, then
    /// start it on a dedicated thread.
    pub fn spawn<I: Instrument + 'static>(
        instrument: I,
        sink: Box<dyn DataSink>,
        reply_socket: Box<dyn ReplySocket>,
        config: StreamerConfig,
    ) -> Result<StreamerHandle, StreamError> {
        let commands = CommandChannel::new(config.command_capacity);
        let monitor = MonitorResponder::new(reply_socket, config.poller.monitor_policy);
        let poller = AcquisitionPoller::new(
            instrument,
            commands.clone(),
            FramePublisher::new(sink),
            monitor,
            config.poller,
        );
        let status = poller.status();
        let (reporter, faults) = fault_slot();
        let supervisor = Supervisor::new(faults.clone(), status.heartbeat(), config.stall_timeout);

        let thread = std::thread::Builder::new()
            .name("detstream-poller".into())
            .spawn(move || poller.run(&reporter))
            .map_err(|e| StreamError::Spawn(e.to_string()))?;
        info!("streamer spawned");

        Ok(StreamerHandle {
            commands,
            status,
            faults,
            supervisor,
            thread: Some(thread),
        })
    }
}

pub struct StreamerHandle {
    commands: CommandChannel,
    status: Arc<LoopStatus>,
    faults: FaultMonitor,
    supervisor: Supervisor,
    thread: Option<JoinHandle<()>>,
}

impl StreamerHandle {
    /// Queue a Start and return the new series id.
    pub fn start(
        &self,
        destination: &str,
        overwritable: bool,
        expected_frames: u64,
    ) -> Result<Uuid, StreamError> {
        let command = Command::start(destination, overwritable, expected_frames);
        let id = match &command {
            Command::Start(info) => info.id,
            _ => Uuid::nil(),
        };
        self.send(command)?;
        Ok(id)
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        self.send(Command::Stop)
    }

    pub fn terminate(&self) -> Result<(), StreamError> {
        self.send(Command::Terminate)
    }

    /// Queue `command`.  Refused once the loop has exited.
    pub fn send(&self, command: Command) -> Result<(), StreamError> {
        if !self.faults.is_alive() {
            return Err(StreamError::LoopDead);
        }
        self.commands.push(command)
    }

    pub fn is_alive(&self) -> bool {
        self.faults.is_alive()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn health(&mut self) -> LoopHealth {
        self.supervisor.poll()
    }

    /// The fault that killed the loop, if it died of one.
    pub fn fault(&mut self) -> Option<FaultRecord> {
        self.supervisor.poll();
        self.supervisor.fault().cloned()
    }

    /// Terminate the loop, wait for the thread, and return its fault if any.
    pub fn join(mut self) -> Option<FaultRecord> {
        self.shutdown();
        self.fault()
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        while self.faults.is_alive() {
            match self.commands.push(Command::Terminate) {
                Ok(()) => break,
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        if thread.join().is_err() {
            error!("acquisition thread panicked outside the loop");
        }
    }
}

impl Drop for StreamerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
