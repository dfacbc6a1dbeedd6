//! In-process detector simulation for headless runs and CI.
//!
//! [`SimInstrument`] models a detector with a finite circular buffer.  It is a
//! cheap `Clone` handle: the streaming loop owns one copy as its
//! [`Instrument`] while a test (or the operator shell) keeps another to arm
//! acquisitions, push frames, and inject faults.
//!
//! Two trigger modes are supported:
//!
//! | mode | processed count |
//! |---|---|
//! | timed ([`arm`][SimInstrument::arm]) | `min(n_frames, elapsed / frame_time)` |
//! | manual ([`arm_manual`][SimInstrument::arm_manual]) | frames added with [`push_frames`][SimInstrument::push_frames] |
//!
//! # Example
//!
//! ```rust
//! use detstream_hal::{Instrument, SimConfig, SimInstrument};
//!
//! let sim = SimInstrument::new(SimConfig::default());
//! sim.arm_manual();
//! sim.push_frames(2);
//!
//! let mut driver = sim.clone();
//! assert_eq!(driver.processed_frame_count().unwrap(), 2);
//! let (image, _scalars) = driver.read_frame_and_scalars(0).unwrap();
//! assert_eq!(image.shape(), [4, 4096]);
//! driver.acknowledge_consumed(0).unwrap();
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use detstream_types::{FrameImage, ScalarBundle, StreamError};
use parking_lot::Mutex;
use tracing::debug;

use crate::instrument::Instrument;
use crate::scalers::{CLOCK_FREQUENCY_HZ, RawScalers, scalar_bundle};

/// Event width used for channels without an explicit calibration.
const DEFAULT_EVENT_WIDTH: u32 = 6;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Shape and timing of the simulated detector.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub channels: usize,
    pub bins: usize,
    /// Capacity of the hardware circular buffer in frames.
    pub buffer_frames: u64,
    /// Exposure time reported while armed, in seconds.
    pub exposure_s: f64,
    /// Per-channel event widths; missing entries use the default width.
    pub event_widths: Vec<u32>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            bins: 4096,
            buffer_frames: 16_384,
            exposure_s: 0.1,
            event_widths: Vec::new(),
        }
    }
}

/// One buffer access made by the streaming loop, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCall {
    Read(u64),
    Ack(u64),
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Disarmed,
    Manual {
        available: u64,
    },
    Timed {
        started: Instant,
        frame_time: Duration,
        n_frames: u64,
    },
    /// Acquisition stopped; the count is frozen where it was.
    Stopped {
        available: u64,
    },
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    trigger: Trigger,
    /// Lowest offset not yet acknowledged.
    acked_through: u64,
    calls: Vec<SimCall>,
    forced_overrun: bool,
    pending_fault: Option<String>,
}

impl SimState {
    fn processed(&self) -> u64 {
        match self.trigger {
            Trigger::Disarmed => 0,
            Trigger::Manual { available } | Trigger::Stopped { available } => available,
            Trigger::Timed {
                started,
                frame_time,
                n_frames,
            } => {
                if frame_time.is_zero() {
                    return n_frames;
                }
                let elapsed = started.elapsed().as_nanos() / frame_time.as_nanos();
                u64::try_from(elapsed).unwrap_or(u64::MAX).min(n_frames)
            }
        }
    }

    fn width(&self, channel: usize) -> u32 {
        self.config
            .event_widths
            .get(channel)
            .copied()
            .unwrap_or(DEFAULT_EVENT_WIDTH)
    }

    fn reset(&mut self, trigger: Trigger) {
        self.trigger = trigger;
        self.acked_through = 0;
        self.calls.clear();
        self.forced_overrun = false;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimInstrument
// ────────────────────────────────────────────────────────────────────────────

/// Simulated circular-buffer detector.  Clones share the same hardware.
#[derive(Debug, Clone)]
pub struct SimInstrument {
    state: Arc<Mutex<SimState>>,
}

impl SimInstrument {
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                trigger: Trigger::Disarmed,
                acked_through: 0,
                calls: Vec::new(),
                forced_overrun: false,
                pending_fault: None,
            })),
        }
    }

    /// Start a timed acquisition of `n_frames` frames, one every `frame_time`.
    pub fn arm(&self, n_frames: u64, frame_time: Duration) {
        debug!(n_frames, ?frame_time, "sim: timed acquisition armed");
        self.state.lock().reset(Trigger::Timed {
            started: Instant::now(),
            frame_time,
            n_frames,
        });
    }

    /// Start a manually-triggered acquisition with no frames yet processed.
    pub fn arm_manual(&self) {
        debug!("sim: manual acquisition armed");
        self.state.lock().reset(Trigger::Manual { available: 0 });
    }

    /// Mark `n` more frames as processed.  Arms manual mode if needed.
    pub fn push_frames(&self, n: u64) {
        let mut state = self.state.lock();
        state.trigger = match state.trigger {
            Trigger::Manual { available } => Trigger::Manual {
                available: available + n,
            },
            _ => Trigger::Manual { available: n },
        };
    }

    /// Halt the acquisition, freezing the processed count.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let available = state.processed();
        state.trigger = Trigger::Stopped { available };
    }

    /// Report an overrun from now until the next arm.
    pub fn force_overrun(&self) {
        self.state.lock().forced_overrun = true;
    }

    /// Make the next frame read fail with an instrument error.
    pub fn inject_read_fault(&self, details: impl Into<String>) {
        self.state.lock().pending_fault = Some(details.into());
    }

    /// Buffer accesses since the last arm.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    /// Offsets acknowledged since the last arm, in call order.
    pub fn acknowledged(&self) -> Vec<u64> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                SimCall::Ack(offset) => Some(*offset),
                SimCall::Read(_) => None,
            })
            .collect()
    }

    pub fn config(&self) -> SimConfig {
        self.state.lock().config.clone()
    }

    fn synthesize(state: &SimState, offset: u64) -> Result<(FrameImage, ScalarBundle), StreamError> {
        let SimConfig {
            channels,
            bins,
            exposure_s,
            ..
        } = state.config;
        let seed = offset as usize;
        let samples: Vec<u32> = (0..channels)
            .flat_map(|ch| (0..bins).map(move |bin| ((seed * 7 + ch * 13 + bin) % 97) as u32))
            .collect();

        let clock_ticks = (exposure_s * CLOCK_FREQUENCY_HZ) as u32;
        let raw: Vec<RawScalers> = (0..channels)
            .map(|ch| {
                let row = &samples[ch * bins..(ch + 1) * bins];
                let half = bins / 2;
                let all_events = 1_000 + (offset as u32).wrapping_mul(10) + ch as u32;
                RawScalers {
                    clock_ticks,
                    reset_ticks: 50,
                    reset_count: 1,
                    all_events,
                    all_good: all_events / 10 * 9,
                    window0: row[..half].iter().sum(),
                    window1: row[half..].iter().sum(),
                    pileup: 0,
                    total_ticks: clock_ticks,
                }
            })
            .collect();
        let widths: Vec<u32> = (0..channels).map(|ch| state.width(ch)).collect();

        let image = FrameImage::from_u32([channels, bins], &samples)?;
        Ok((image, scalar_bundle(&raw, &widths)))
    }
}

impl Instrument for SimInstrument {
    fn processed_frame_count(&self) -> Result<u64, StreamError> {
        Ok(self.state.lock().processed())
    }

    fn read_frame_and_scalars(
        &mut self,
        offset: u64,
    ) -> Result<(FrameImage, ScalarBundle), StreamError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::Read(offset));
        if let Some(details) = state.pending_fault.take() {
            return Err(StreamError::instrument("read_frame_and_scalars", details));
        }
        let processed = state.processed();
        if offset >= processed {
            return Err(StreamError::instrument(
                "read_frame_and_scalars",
                format!("frame {offset} not yet processed ({processed} available)"),
            ));
        }
        Self::synthesize(&state, offset)
    }

    fn acknowledge_consumed(&mut self, offset: u64) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::Ack(offset));
        if offset == state.acked_through {
            state.acked_through += 1;
        }
        Ok(())
    }

    fn overrun_detected(&self) -> Result<bool, StreamError> {
        let state = self.state.lock();
        let backlog = state.processed().saturating_sub(state.acked_through);
        Ok(state.forced_overrun || backlog > state.config.buffer_frames)
    }

    fn current_exposure_time(&self) -> Option<f64> {
        let state = self.state.lock();
        match state.trigger {
            Trigger::Disarmed => None,
            _ => Some(state.config.exposure_s),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimInstrument {
        SimInstrument::new(SimConfig {
            channels: 2,
            bins: 8,
            buffer_frames: 4,
            exposure_s: 0.1,
            event_widths: vec![5],
        })
    }

    #[test]
    fn disarmed_instrument_has_no_frames() {
        let sim = small();
        assert_eq!(sim.processed_frame_count().unwrap(), 0);
        assert_eq!(sim.current_exposure_time(), None);
    }

    #[test]
    fn manual_frames_are_readable_in_order() {
        let sim = small();
        sim.arm_manual();
        sim.push_frames(3);
        let mut driver = sim.clone();
        assert_eq!(driver.processed_frame_count().unwrap(), 3);
        for offset in 0..3 {
            let (image, scalars) = driver.read_frame_and_scalars(offset).unwrap();
            assert_eq!(image.shape(), [2, 8]);
            assert_eq!(scalars.channels.len(), 2);
            driver.acknowledge_consumed(offset).unwrap();
        }
        assert_eq!(sim.acknowledged(), vec![0, 1, 2]);
        assert_eq!(
            sim.calls()[..2],
            [SimCall::Read(0), SimCall::Ack(0)]
        );
    }

    #[test]
    fn reading_ahead_of_hardware_fails() {
        let sim = small();
        sim.arm_manual();
        sim.push_frames(1);
        let mut driver = sim.clone();
        let err = driver.read_frame_and_scalars(1).unwrap_err();
        assert!(matches!(err, StreamError::Instrument { .. }));
    }

    #[test]
    fn frames_differ_between_offsets() {
        let sim = small();
        sim.push_frames(2);
        let mut driver = sim.clone();
        let (a, _) = driver.read_frame_and_scalars(0).unwrap();
        let (b, _) = driver.read_frame_and_scalars(1).unwrap();
        assert_ne!(a.to_u32_vec(), b.to_u32_vec());
    }

    #[test]
    fn scalars_use_configured_event_widths() {
        let sim = small();
        sim.push_frames(1);
        let mut driver = sim.clone();
        let (image, scalars) = driver.read_frame_and_scalars(0).unwrap();
        assert_eq!(scalars.channels[0].event_width, 5);
        assert_eq!(scalars.channels[1].event_width, DEFAULT_EVENT_WIDTH);

        let samples = image.to_u32_vec().unwrap();
        let row0: u32 = samples[..4].iter().sum();
        assert_eq!(scalars.channels[0].window_sums[0], row0);
        assert!(scalars.channels[0].dead_time_correction > 1.0);
    }

    #[test]
    fn unacknowledged_backlog_beyond_capacity_is_an_overrun() {
        let sim = small();
        sim.arm_manual();
        sim.push_frames(4);
        assert!(!sim.overrun_detected().unwrap());
        sim.push_frames(1);
        assert!(sim.overrun_detected().unwrap());

        let mut driver = sim.clone();
        driver.acknowledge_consumed(0).unwrap();
        assert!(!sim.overrun_detected().unwrap());
    }

    #[test]
    fn forced_overrun_clears_on_rearm() {
        let sim = small();
        sim.force_overrun();
        assert!(sim.overrun_detected().unwrap());
        sim.arm_manual();
        assert!(!sim.overrun_detected().unwrap());
    }

    #[test]
    fn injected_fault_hits_next_read_only() {
        let sim = small();
        sim.push_frames(1);
        sim.inject_read_fault("DMA timeout");
        let mut driver = sim.clone();
        let err = driver.read_frame_and_scalars(0).unwrap_err();
        assert!(err.to_string().contains("DMA timeout"));
        assert!(driver.read_frame_and_scalars(0).is_ok());
    }

    #[test]
    fn zero_frame_time_produces_everything_at_once() {
        let sim = small();
        sim.arm(3, Duration::ZERO);
        assert_eq!(sim.processed_frame_count().unwrap(), 3);
        assert_eq!(sim.current_exposure_time(), Some(0.1));
    }

    #[test]
    fn timed_acquisition_is_capped_at_n_frames() {
        let sim = small();
        sim.arm(2, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sim.processed_frame_count().unwrap(), 2);
    }

    #[test]
    fn stop_freezes_the_count() {
        let sim = small();
        sim.arm(1_000_000, Duration::from_secs(3600));
        sim.stop();
        assert_eq!(sim.processed_frame_count().unwrap(), 0);
        sim.push_frames(1);
        assert_eq!(sim.processed_frame_count().unwrap(), 1);
    }
}
