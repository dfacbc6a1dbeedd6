//! Series framing on top of a fire-and-forget transport.

use detstream_types::{Frame, SeriesInfo, StreamError};
use tracing::{debug, trace};

use crate::protocol::{MonitorSnapshot, WireMessage};

/// A one-way data transport.
///
/// `send` must never block on a consumer.  It returns `Ok(false)` when the
/// transport discarded the message under backpressure and an error only
/// when the transport itself is broken.
pub trait DataSink: Send {
    fn send(&mut self, message: WireMessage) -> Result<bool, StreamError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Messages accepted by the transport.
    pub sent: u64,
    /// Messages the transport dropped.
    pub dropped: u64,
}

/// Emits `header` → frames → `series_end` onto a [`DataSink`].
///
/// The publisher does not track series state; ordering is the caller's
/// responsibility.  It only encodes, sends, and counts.
pub struct FramePublisher {
    sink: Box<dyn DataSink>,
    stats: PublisherStats,
}

impl FramePublisher {
    pub fn new(sink: Box<dyn DataSink>) -> Self {
        Self {
            sink,
            stats: PublisherStats::default(),
        }
    }

    pub fn header(&mut self, info: &SeriesInfo) -> Result<(), StreamError> {
        debug!(series = %info.id, filename = info.filename(), "publishing header");
        self.emit(WireMessage::header(info)?)
    }

    /// Publish one frame and hand back the snapshot the monitor should serve.
    ///
    /// The frame is consumed; the snapshot shares its payload buffer.
    pub fn frame(&mut self, frame: Frame, exptime: Option<f64>) -> Result<MonitorSnapshot, StreamError> {
        let message = WireMessage::frame(&frame, exptime)?;
        trace!(frame = frame.sequence, bytes = message.byte_len(), "publishing frame");
        self.emit(message)?;
        Ok(MonitorSnapshot {
            frame: frame.sequence,
            image: frame.image,
            exptime,
        })
    }

    pub fn series_end(&mut self) -> Result<(), StreamError> {
        debug!("publishing series_end");
        self.emit(WireMessage::series_end()?)
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    fn emit(&mut self, message: WireMessage) -> Result<(), StreamError> {
        if self.sink.send(message)? {
            self.stats.sent += 1;
        } else {
            self.stats.dropped += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::WireBus;
    use crate::protocol::DecodedMessage;
    use detstream_types::{Command, FrameImage, ScalarBundle};

    struct Refusing;

    impl DataSink for Refusing {
        fn send(&mut self, _message: WireMessage) -> Result<bool, StreamError> {
            Ok(false)
        }
    }

    fn series(n: u64) -> SeriesInfo {
        let Command::Start(info) = Command::start("run1.dat", false, n) else {
            panic!("expected Start");
        };
        info
    }

    fn frame(sequence: u64) -> Frame {
        Frame {
            sequence,
            image: FrameImage::from_u32([1, 2], &[sequence as u32, 0]).unwrap(),
            scalars: ScalarBundle::new(vec![]),
        }
    }

    #[test]
    fn emits_series_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let bus = WireBus::default();
        let mut sub = bus.subscribe();
        let mut publisher = FramePublisher::new(Box::new(bus));

        publisher.header(&series(2))?;
        publisher.frame(frame(0), Some(0.1))?;
        publisher.frame(frame(1), Some(0.1))?;
        publisher.series_end()?;

        let mut decoded = Vec::new();
        while let Some(msg) = sub.try_recv()? {
            decoded.push(msg.decode()?);
        }
        assert_eq!(decoded.len(), 4);
        assert!(matches!(decoded[0], DecodedMessage::Header { .. }));
        assert!(matches!(decoded[1], DecodedMessage::Image { frame: 0, .. }));
        assert!(matches!(decoded[2], DecodedMessage::Image { frame: 1, .. }));
        assert_eq!(decoded[3], DecodedMessage::SeriesEnd);
        assert_eq!(publisher.stats().sent, 4);
        Ok(())
    }

    #[test]
    fn snapshot_shares_frame_payload() -> Result<(), Box<dyn std::error::Error>> {
        let mut publisher = FramePublisher::new(Box::new(WireBus::default()));
        let f = frame(7);
        let ptr = f.image.data().as_ptr();
        let snapshot = publisher.frame(f, None)?;
        assert_eq!(snapshot.frame, 7);
        assert_eq!(snapshot.image.data().as_ptr(), ptr);
        Ok(())
    }

    #[test]
    fn refused_messages_are_counted_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let mut publisher = FramePublisher::new(Box::new(Refusing));
        publisher.header(&series(1))?;
        publisher.frame(frame(0), None)?;
        assert_eq!(publisher.stats(), PublisherStats { sent: 0, dropped: 2 });
        Ok(())
    }
}
