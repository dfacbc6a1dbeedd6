//! Consumer side of the data stream.
//!
//! [`SeriesDecoder`] turns a message sequence back into series events and
//! rejects anything that breaks the framing: a frame outside a series, a
//! sequence gap, a second header, a footer with no series open.
//! [`PrintReceiver`] is the simplest possible consumer; it only logs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use detstream_types::{Frame, StreamError};
use tracing::{info, warn};

use crate::protocol::{DecodedMessage, WireMessage};

/// Anything a consumer can pull wire messages from.
pub trait MessageSource {
    /// Wait up to `timeout` for the next message.  `Ok(None)` on timeout.
    fn next_message(&mut self, timeout: Duration) -> Result<Option<WireMessage>, StreamError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesEvent {
    Started { filename: String, overwritable: bool },
    Frame { frame: Frame, exptime: Option<f64> },
    Ended { frames: u64 },
}

#[derive(Debug, Default)]
pub struct SeriesDecoder {
    open: bool,
    next_sequence: u64,
}

impl SeriesDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Frames received in the open (or most recent) series.
    pub fn frames(&self) -> u64 {
        self.next_sequence
    }

    /// Forget the open series, e.g. after a gap the consumer chose to skip.
    pub fn reset(&mut self) {
        self.open = false;
        self.next_sequence = 0;
    }

    pub fn feed(&mut self, message: &WireMessage) -> Result<SeriesEvent, StreamError> {
        match message.decode()? {
            DecodedMessage::Header {
                filename,
                overwritable,
            } => {
                if self.open {
                    return Err(StreamError::Decoding(format!(
                        "header received while a series is open ({} frames in)",
                        self.next_sequence
                    )));
                }
                self.open = true;
                self.next_sequence = 0;
                Ok(SeriesEvent::Started {
                    filename,
                    overwritable,
                })
            }
            DecodedMessage::Image {
                frame,
                image,
                exptime,
                scalars,
            } => {
                if !self.open {
                    return Err(StreamError::Decoding(format!(
                        "frame {frame} received outside a series"
                    )));
                }
                if frame != self.next_sequence {
                    return Err(StreamError::Decoding(format!(
                        "expected frame {}, got {frame}",
                        self.next_sequence
                    )));
                }
                let scalars = scalars.ok_or_else(|| {
                    StreamError::Decoding(format!("frame {frame} has no scalar record"))
                })?;
                self.next_sequence += 1;
                Ok(SeriesEvent::Frame {
                    frame: Frame {
                        sequence: frame,
                        image,
                        scalars,
                    },
                    exptime,
                })
            }
            DecodedMessage::SeriesEnd => {
                if !self.open {
                    return Err(StreamError::Decoding(
                        "series_end received with no series open".into(),
                    ));
                }
                self.open = false;
                Ok(SeriesEvent::Ended {
                    frames: self.next_sequence,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Print receiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverSummary {
    pub series: u64,
    pub frames: u64,
    pub errors: u64,
}

/// Logs series boundaries and a once-per-interval frame count.
pub struct PrintReceiver<M> {
    source: M,
    decoder: SeriesDecoder,
    progress_interval: Duration,
    last_report: Instant,
    frames_since_report: u64,
    summary: ReceiverSummary,
}

impl<M: MessageSource> PrintReceiver<M> {
    pub fn new(source: M, progress_interval: Duration) -> Self {
        Self {
            source,
            decoder: SeriesDecoder::new(),
            progress_interval,
            last_report: Instant::now(),
            frames_since_report: 0,
            summary: ReceiverSummary::default(),
        }
    }

    /// Consume messages until `stop` is raised or the source fails.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<ReceiverSummary, StreamError> {
        while !stop.load(Ordering::Relaxed) {
            if let Some(message) = self.source.next_message(Duration::from_millis(50))? {
                self.handle(&message);
            }
            self.maybe_report();
        }
        Ok(self.summary)
    }

    pub fn handle(&mut self, message: &WireMessage) {
        match self.decoder.feed(message) {
            Ok(SeriesEvent::Started {
                filename,
                overwritable,
            }) => {
                self.summary.series += 1;
                info!(filename, overwritable, "receiver: series started");
            }
            Ok(SeriesEvent::Frame { .. }) => {
                self.summary.frames += 1;
                self.frames_since_report += 1;
            }
            Ok(SeriesEvent::Ended { frames }) => {
                info!(frames, "receiver: series ended");
            }
            Err(e) => {
                self.summary.errors += 1;
                warn!(error = %e, "receiver: dropping out of series");
                self.decoder.reset();
            }
        }
    }

    pub fn summary(&self) -> ReceiverSummary {
        self.summary
    }

    fn maybe_report(&mut self) {
        if self.last_report.elapsed() < self.progress_interval {
            return;
        }
        if self.frames_since_report > 0 {
            info!(
                new_frames = self.frames_since_report,
                total = self.decoder.frames(),
                "receiver: frames received"
            );
        }
        self.frames_since_report = 0;
        self.last_report = Instant::now();
    }
}
