//! One running streamer plus everything the shell needs to drive it.
//!
//! A [`Session`] owns the simulated instrument, the [`StreamerHandle`], a
//! monitor client, and an optional "tap": a [`PrintReceiver`] on its own
//! thread that consumes the data stream and logs what it sees.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use detstream_hal::SimInstrument;
use detstream_middleware::{
    DecodedMessage, InprocMonitorClient, MessageSource, PrintReceiver, WireBus, monitor_channel,
};
use detstream_runtime::{LoopHealth, StatusSnapshot, Streamer, StreamerHandle};
use detstream_types::{FaultRecord, FrameImage, LoopState, StreamError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, Transport};

/// How long `/snapshot` waits for the loop to answer.
pub const MONITOR_TIMEOUT: Duration = Duration::from_secs(2);

enum MonitorClient {
    Inproc(InprocMonitorClient),
    #[cfg(feature = "zmq-transport")]
    Zmq(detstream_middleware::zmq::ZmqMonitorClient),
}

/// Where a tap reads the data stream from.
enum DataFeed {
    Inproc(WireBus),
    #[cfg(feature = "zmq-transport")]
    Zmq {
        context: zmq::Context,
        endpoint: String,
    },
}

struct Tap {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// What `/snapshot` shows.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorView {
    pub frame: u64,
    pub image: FrameImage,
    pub exptime: Option<f64>,
}

pub struct Session {
    sim: SimInstrument,
    handle: StreamerHandle,
    monitor: MonitorClient,
    feed: DataFeed,
    tap: Option<Tap>,
    progress_interval: Duration,
    default_frame_time: Duration,
    /// Starts this session has queued; compared against completed series.
    series_started: u64,
}

impl Session {
    /// Build the instrument and transports named by `config` and spawn the
    /// acquisition loop.
    pub fn launch(config: &Config) -> Result<Self, StreamError> {
        let sim = SimInstrument::new(config.sim_config());
        let streamer_config = config.streamer_config();
        let progress_interval = streamer_config.poller.progress_interval;
        let default_frame_time = Duration::try_from_secs_f64(config.sim.exposure_s)
            .map_err(|e| StreamError::Config(format!("sim.exposure_s: {e}")))?;

        let (handle, monitor, feed) = match config.transport {
            Transport::Inproc => {
                let bus = WireBus::default();
                let (socket, client) = monitor_channel();
                let handle = Streamer::spawn(
                    sim.clone(),
                    Box::new(bus.clone()),
                    Box::new(socket),
                    streamer_config,
                )?;
                (handle, MonitorClient::Inproc(client), DataFeed::Inproc(bus))
            }
            #[cfg(feature = "zmq-transport")]
            Transport::Zmq => {
                use detstream_middleware::zmq::{
                    ZmqMonitorClient, ZmqPublisher, ZmqReplySocket, bind_endpoint,
                    connect_endpoint,
                };
                let context = zmq::Context::new();
                let publisher =
                    ZmqPublisher::bind(&context, &bind_endpoint(config.data_port), config.send_hwm)?;
                let reply = ZmqReplySocket::bind(&context, &bind_endpoint(config.monitor_port))?;
                let handle = Streamer::spawn(
                    sim.clone(),
                    Box::new(publisher),
                    Box::new(reply),
                    streamer_config,
                )?;
                let client = ZmqMonitorClient::connect(
                    &context,
                    &connect_endpoint("localhost", config.monitor_port),
                )?;
                let feed = DataFeed::Zmq {
                    endpoint: connect_endpoint("localhost", config.data_port),
                    context,
                };
                (handle, MonitorClient::Zmq(client), feed)
            }
            #[cfg(not(feature = "zmq-transport"))]
            Transport::Zmq => {
                return Err(StreamError::Config(
                    "transport 'zmq' needs a build with the zmq-transport feature".into(),
                ));
            }
        };
        info!(transport = %config.transport, "session launched");

        Ok(Self {
            sim,
            handle,
            monitor,
            feed,
            tap: None,
            progress_interval,
            default_frame_time,
            series_started: 0,
        })
    }

    /// Arm the simulated detector and queue a Start.
    ///
    /// `n_frames == 0` streams until `/stop`.  Refused with
    /// [`StreamError::SeriesOpen`] while an earlier series is open or still
    /// queued; re-arming would restart the hardware under it.
    pub fn start(
        &mut self,
        destination: &str,
        n_frames: u64,
        overwritable: bool,
        frame_time: Option<Duration>,
    ) -> Result<Uuid, StreamError> {
        if !self.handle.is_alive() {
            return Err(StreamError::LoopDead);
        }
        if self.series_in_progress() {
            return Err(StreamError::SeriesOpen);
        }
        let hardware_frames = if n_frames == 0 { u64::MAX } else { n_frames };
        self.sim
            .arm(hardware_frames, frame_time.unwrap_or(self.default_frame_time));
        let id = self.handle.start(destination, overwritable, n_frames)?;
        self.series_started += 1;
        Ok(id)
    }

    fn series_in_progress(&self) -> bool {
        let status = self.handle.status();
        status.state == LoopState::Streaming || self.series_started > status.completed_series
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        self.sim.stop();
        self.handle.stop()
    }

    pub fn status(&mut self) -> (LoopHealth, StatusSnapshot) {
        (self.handle.health(), self.handle.status())
    }

    /// Ask the loop for its latest frame over the monitor channel.
    pub fn snapshot(&self) -> Result<MonitorView, StreamError> {
        let reply = match &self.monitor {
            MonitorClient::Inproc(client) => client.request("snapshot", MONITOR_TIMEOUT)?,
            #[cfg(feature = "zmq-transport")]
            MonitorClient::Zmq(client) => client.request("snapshot", MONITOR_TIMEOUT)?,
        };
        match reply.decode()? {
            DecodedMessage::Image {
                frame,
                image,
                exptime,
                ..
            } => Ok(MonitorView {
                frame,
                image,
                exptime,
            }),
            other => Err(StreamError::Decoding(format!(
                "unexpected monitor reply: {other:?}"
            ))),
        }
    }

    pub fn tap_enabled(&self) -> bool {
        self.tap.is_some()
    }

    /// Start or stop the tap.  Returns whether it is now running.
    pub fn toggle_tap(&mut self) -> Result<bool, StreamError> {
        if let Some(tap) = self.tap.take() {
            stop_tap(tap);
            return Ok(false);
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread = match &self.feed {
            DataFeed::Inproc(bus) => {
                spawn_tap(bus.subscribe(), self.progress_interval, stop.clone())?
            }
            #[cfg(feature = "zmq-transport")]
            DataFeed::Zmq { context, endpoint } => {
                let subscriber =
                    detstream_middleware::zmq::ZmqSubscriber::connect(context, endpoint)?;
                spawn_tap(subscriber, self.progress_interval, stop.clone())?
            }
        };
        self.tap = Some(Tap { stop, thread });
        Ok(true)
    }

    /// Stop the tap, terminate the loop, and report how it ended.
    pub fn shutdown(mut self) -> Option<FaultRecord> {
        if let Some(tap) = self.tap.take() {
            stop_tap(tap);
        }
        self.sim.stop();
        self.handle.join()
    }
}

fn spawn_tap<M: MessageSource + Send + 'static>(
    source: M,
    progress_interval: Duration,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, StreamError> {
    std::thread::Builder::new()
        .name("detstream-tap".into())
        .spawn(move || {
            let mut receiver = PrintReceiver::new(source, progress_interval);
            match receiver.run(&stop) {
                Ok(summary) => info!(
                    series = summary.series,
                    frames = summary.frames,
                    errors = summary.errors,
                    "tap stopped"
                ),
                Err(e) => warn!(error = %e, "tap stopped on a transport error"),
            }
        })
        .map_err(|e| StreamError::Spawn(e.to_string()))
}

fn stop_tap(tap: Tap) {
    tap.stop.store(true, Ordering::SeqCst);
    if tap.thread.join().is_err() {
        warn!("tap thread panicked");
    }
}
