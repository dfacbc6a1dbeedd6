//! [`AcquisitionPoller`] – the streaming loop.
//!
//! Each iteration ([`AcquisitionPoller::step`]):
//!
//! 1. **Command** – apply at most one pending command.
//! 2. **Monitor** – serve at most one pending snapshot request.
//! 3. **Frame** – while streaming, if the instrument has processed more
//!    frames than were sent: read the frame at offset `sent_frames`,
//!    publish it, acknowledge that offset, and close the series once it is
//!    complete.
//! 4. **Overrun** – a set overrun flag is fatal, idle or streaming.
//!
//! [`AcquisitionPoller::run`] repeats `step` and sleeps briefly whenever an
//! iteration did nothing.  Any error or panic ends the loop and is recorded
//! through the [`FaultReporter`]; nothing is retried.
//!
//! # Command semantics
//!
//! | command | Idle | Streaming |
//! |---|---|---|
//! | Start | header, → Streaming | rejected and counted; the open series continues |
//! | Stop | ignored | `series_end`, → Idle |
//! | Terminate | exit | `series_end`, exit |

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use detstream_hal::Instrument;
use detstream_kernel::FaultReporter;
use detstream_middleware::{FramePublisher, MonitorPolicy, MonitorResponder};
use detstream_types::{Command, Frame, LoopState, SeriesInfo, StreamError};
use tracing::{Span, debug, info, info_span, warn};

use crate::command::CommandChannel;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Pause after an iteration that found no work.
    pub idle_sleep: Duration,
    /// Minimum spacing of progress log lines.
    pub progress_interval: Duration,
    pub monitor_policy: MonitorPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(1),
            progress_interval: Duration::from_secs(1),
            monitor_policy: MonitorPolicy::Latest,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read-only status
// ─────────────────────────────────────────────────────────────────────────────

/// Loop status published for other threads.  Only the loop writes it.
#[derive(Debug)]
pub struct LoopStatus {
    state: AtomicU8,
    sent_frames: AtomicU64,
    expected_frames: AtomicU64,
    heartbeat: Arc<AtomicU64>,
    rejected_commands: AtomicU64,
    completed_series: AtomicU64,
}

/// A point-in-time copy of [`LoopStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: LoopState,
    pub sent_frames: u64,
    pub expected_frames: u64,
    pub iterations: u64,
    pub rejected_commands: u64,
    pub completed_series: u64,
}

impl LoopStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LoopState::Idle.as_u8()),
            sent_frames: AtomicU64::new(0),
            expected_frames: AtomicU64::new(0),
            heartbeat: Arc::new(AtomicU64::new(0)),
            rejected_commands: AtomicU64::new(0),
            completed_series: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn sent_frames(&self) -> u64 {
        self.sent_frames.load(Ordering::Acquire)
    }

    /// Iteration counter, bumped once per step.
    pub fn heartbeat(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.heartbeat)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            sent_frames: self.sent_frames(),
            expected_frames: self.expected_frames.load(Ordering::Acquire),
            iterations: self.heartbeat.load(Ordering::Relaxed),
            rejected_commands: self.rejected_commands.load(Ordering::Relaxed),
            completed_series: self.completed_series.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session state
// ─────────────────────────────────────────────────────────────────────────────

/// What a single [`AcquisitionPoller::step`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do; the caller should back off.
    Idle,
    /// A command, monitor request or frame was handled.
    Progress,
    /// The loop has exited and must not be stepped again.
    Terminated,
}

struct ProgressLog {
    interval: Duration,
    last_report: Instant,
    last_count: u64,
}

impl ProgressLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: Instant::now(),
            last_count: 0,
        }
    }

    fn tick(&mut self, sent: u64, expected: u64) {
        if self.last_report.elapsed() < self.interval || sent == self.last_count {
            return;
        }
        let new_frames = sent - self.last_count;
        info!(
            new_frames,
            sent, expected, "sent {} new frames (total {} / {})", new_frames, sent, expected
        );
        self.last_count = sent;
        self.last_report = Instant::now();
    }
}

struct OpenSeries {
    info: SeriesInfo,
    sent_frames: u64,
    span: Span,
    progress: ProgressLog,
}

enum Session {
    Idle,
    Streaming(OpenSeries),
    Terminated,
}

// ─────────────────────────────────────────────────────────────────────────────
// AcquisitionPoller
// ─────────────────────────────────────────────────────────────────────────────

/// Owns all session state and every socket.  Runs on exactly one thread.
pub struct AcquisitionPoller<I: Instrument> {
    instrument: I,
    commands: CommandChannel,
    publisher: FramePublisher,
    monitor: MonitorResponder,
    status: Arc<LoopStatus>,
    config: PollerConfig,
    session: Session,
}

impl<I: Instrument> AcquisitionPoller<I> {
    pub fn new(
        instrument: I,
        commands: CommandChannel,
        publisher: FramePublisher,
        monitor: MonitorResponder,
        config: PollerConfig,
    ) -> Self {
        Self {
            instrument,
            commands,
            publisher,
            monitor,
            status: Arc::new(LoopStatus::new()),
            config,
            session: Session::Idle,
        }
    }

    pub fn status(&self) -> Arc<LoopStatus> {
        Arc::clone(&self.status)
    }

    /// Frames sent in the open series, `0` when idle.
    pub fn sent_frames(&self) -> u64 {
        match &self.session {
            Session::Streaming(series) => series.sent_frames,
            _ => 0,
        }
    }

    /// Run one iteration without sleeping.
    pub fn step(&mut self) -> Result<StepOutcome, StreamError> {
        if matches!(self.session, Session::Terminated) {
            return Ok(StepOutcome::Terminated);
        }
        self.status.heartbeat.fetch_add(1, Ordering::Relaxed);
        let mut progressed = false;

        if let Some(command) = self.commands.pop_nonblocking() {
            progressed = true;
            self.apply(command)?;
            if matches!(self.session, Session::Terminated) {
                return Ok(StepOutcome::Terminated);
            }
        }

        if self.monitor.poll()? {
            progressed = true;
        }

        if matches!(self.session, Session::Streaming(_)) && self.frame_step()? {
            progressed = true;
        }

        if self.instrument.overrun_detected()? {
            let sent_frames = self.sent_frames();
            return Err(StreamError::Overrun { sent_frames });
        }

        Ok(if progressed {
            StepOutcome::Progress
        } else {
            StepOutcome::Idle
        })
    }

    /// Step until Terminate or the first fault, which is recorded through
    /// `reporter`.
    pub fn run(mut self, reporter: &FaultReporter) {
        info!("acquisition loop started");
        loop {
            match catch_unwind(AssertUnwindSafe(|| self.step())) {
                Ok(Ok(StepOutcome::Progress)) => {}
                Ok(Ok(StepOutcome::Idle)) => std::thread::sleep(self.config.idle_sleep),
                Ok(Ok(StepOutcome::Terminated)) => {
                    info!("acquisition loop terminated");
                    reporter.mark_exited();
                    break;
                }
                Ok(Err(e)) => {
                    reporter.record(e, self.status.sent_frames());
                    break;
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    reporter.record(StreamError::Panic(message), self.status.sent_frames());
                    break;
                }
            }
        }
        self.status.set_state(LoopState::Terminated);
    }

    // ── Command handling ─────────────────────────────────────────────────────

    fn apply(&mut self, command: Command) -> Result<(), StreamError> {
        match command {
            Command::Start(info) => {
                if let Session::Streaming(open) = &self.session {
                    warn!(
                        open_series = %open.info.id,
                        rejected_series = %info.id,
                        "start rejected: a series is already streaming"
                    );
                    self.status.rejected_commands.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                self.open_series(info)
            }
            Command::Stop => {
                if matches!(self.session, Session::Streaming(_)) {
                    self.close_series("stopped")
                } else {
                    debug!("stop ignored: no series open");
                    Ok(())
                }
            }
            Command::Terminate => {
                if matches!(self.session, Session::Streaming(_)) {
                    self.close_series("terminated")?;
                }
                self.session = Session::Terminated;
                self.status.set_state(LoopState::Terminated);
                Ok(())
            }
        }
    }

    fn open_series(&mut self, info: SeriesInfo) -> Result<(), StreamError> {
        let span = info_span!(
            "series",
            id = %info.id,
            destination = info.filename(),
            expected = info.expected_frames
        );
        self.publisher.header(&info)?;
        span.in_scope(|| {
            info!(
                overwritable = info.overwritable,
                expected_frames = info.expected_frames,
                "series started"
            );
        });
        self.status.sent_frames.store(0, Ordering::Release);
        self.status
            .expected_frames
            .store(info.expected_frames, Ordering::Release);
        self.status.set_state(LoopState::Streaming);
        self.session = Session::Streaming(OpenSeries {
            info,
            sent_frames: 0,
            span,
            progress: ProgressLog::new(self.config.progress_interval),
        });
        Ok(())
    }

    fn close_series(&mut self, reason: &str) -> Result<(), StreamError> {
        let previous = std::mem::replace(&mut self.session, Session::Idle);
        self.status.set_state(LoopState::Idle);
        if let Session::Streaming(series) = previous {
            self.publisher.series_end()?;
            self.status.completed_series.fetch_add(1, Ordering::Relaxed);
            let _entered = series.span.enter();
            info!(sent_frames = series.sent_frames, reason, "series closed");
        }
        Ok(())
    }

    // ── Frame transfer ───────────────────────────────────────────────────────

    /// Transfer at most one frame.  Returns `true` if a frame was sent.
    fn frame_step(&mut self) -> Result<bool, StreamError> {
        let Session::Streaming(series) = &mut self.session else {
            return Ok(false);
        };
        let complete = {
            let _entered = series.span.enter();
            let processed = self.instrument.processed_frame_count()?;
            if processed <= series.sent_frames {
                return Ok(false);
            }

            let offset = series.sent_frames;
            let (image, scalars) = self.instrument.read_frame_and_scalars(offset)?;
            let exptime = self.instrument.current_exposure_time();
            let frame = Frame {
                sequence: offset,
                image,
                scalars,
            };
            let snapshot = self.publisher.frame(frame, exptime)?;
            self.instrument.acknowledge_consumed(offset)?;
            self.monitor.update(snapshot);

            series.sent_frames += 1;
            self.status
                .sent_frames
                .store(series.sent_frames, Ordering::Release);
            series
                .progress
                .tick(series.sent_frames, series.info.expected_frames);
            series.info.is_complete(series.sent_frames)
        };
        if complete {
            self.close_series("complete")?;
        }
        Ok(true)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
