//! Raw hardware scalers and the quantities derived from them.
//!
//! The dead-time model follows the vendor's recommendation rather than the
//! SDK's built-in helper:
//!
//! | quantity | formula |
//! |---|---|
//! | dead ticks | `all_events × (event_width + 1) + reset_ticks` |
//! | dead-time correction | `clock_ticks / (clock_ticks − dead_ticks)` |
//! | output count rate | `all_good / (total_ticks / 80 MHz)` |

use detstream_types::{ChannelScalars, ScalarBundle};

/// Frequency of the detector's time base.
pub const CLOCK_FREQUENCY_HZ: f64 = 80e6;

/// One channel's raw scaler block, in SDK order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawScalers {
    pub clock_ticks: u32,
    pub reset_ticks: u32,
    pub reset_count: u32,
    pub all_events: u32,
    pub all_good: u32,
    pub window0: u32,
    pub window1: u32,
    pub pileup: u32,
    pub total_ticks: u32,
}

impl RawScalers {
    /// Number of scalers per channel in an SDK scaler block.
    pub const COUNT: usize = 9;

    /// Parse one channel's block.  Returns `None` if `raw` is too short.
    pub fn from_slice(raw: &[u32]) -> Option<Self> {
        if raw.len() < Self::COUNT {
            return None;
        }
        Some(Self {
            clock_ticks: raw[0],
            reset_ticks: raw[1],
            reset_count: raw[2],
            all_events: raw[3],
            all_good: raw[4],
            window0: raw[5],
            window1: raw[6],
            pileup: raw[7],
            total_ticks: raw[8],
        })
    }

    /// Dead time in clock ticks for a channel calibrated with `event_width`.
    pub fn dead_ticks(&self, event_width: u32) -> f64 {
        f64::from(self.all_events) * (f64::from(event_width) + 1.0) + f64::from(self.reset_ticks)
    }

    /// Multiplicative dead-time correction.
    ///
    /// `1.0` when no live time was recorded; `0.0` when the channel was dead
    /// for the entire frame and no correction is defined.
    pub fn dead_time_correction(&self, event_width: u32) -> f64 {
        let clock = f64::from(self.clock_ticks);
        if self.clock_ticks == 0 {
            return 1.0;
        }
        let live = clock - self.dead_ticks(event_width);
        if live <= 0.0 {
            return 0.0;
        }
        clock / live
    }

    /// Good events per second of real time.
    pub fn output_count_rate(&self) -> f64 {
        if self.total_ticks == 0 {
            return 0.0;
        }
        f64::from(self.all_good) * CLOCK_FREQUENCY_HZ / f64::from(self.total_ticks)
    }

    pub fn to_channel_scalars(&self, event_width: u32) -> ChannelScalars {
        ChannelScalars {
            output_count_rate: self.output_count_rate(),
            all_events: self.all_events,
            all_good: self.all_good,
            clock_ticks: self.clock_ticks,
            total_ticks: self.total_ticks,
            reset_ticks: self.reset_ticks,
            event_width,
            dead_time_correction: self.dead_time_correction(event_width),
            window_sums: [self.window0, self.window1],
        }
    }
}

/// Build a frame's [`ScalarBundle`] from per-channel raw blocks.
///
/// Channels without a calibrated event width fall back to a width of 0.
pub fn scalar_bundle(raw: &[RawScalers], event_widths: &[u32]) -> ScalarBundle {
    let channels = raw
        .iter()
        .enumerate()
        .map(|(ch, scalers)| {
            let width = event_widths.get(ch).copied().unwrap_or(0);
            scalers.to_channel_scalars(width)
        })
        .collect();
    ScalarBundle::new(channels)
}
