//! Generic `Instrument` trait for circular-buffer detectors.

use detstream_types::{FrameImage, ScalarBundle, StreamError};

/// A detector whose processed frames sit in a fixed-capacity hardware
/// circular buffer until they are acknowledged.
///
/// Offsets are zero-based positions within the current acquisition.  A
/// driver reports [`StreamError::Instrument`] for any SDK failure; the
/// streaming loop propagates such errors unchanged and stops.
pub trait Instrument: Send {
    /// Number of frames the hardware has finished processing so far.
    fn processed_frame_count(&self) -> Result<u64, StreamError>;

    /// Pull the histogram image and scalar record of the frame at `offset`.
    ///
    /// The returned image owns its bytes; the hardware slot may be reused
    /// as soon as [`acknowledge_consumed`][Self::acknowledge_consumed] is
    /// called for the same offset.
    fn read_frame_and_scalars(
        &mut self,
        offset: u64,
    ) -> Result<(FrameImage, ScalarBundle), StreamError>;

    /// Release the hardware slot holding the frame at `offset`.
    fn acknowledge_consumed(&mut self, offset: u64) -> Result<(), StreamError>;

    /// `true` once the hardware has overwritten an unacknowledged frame.
    fn overrun_detected(&self) -> Result<bool, StreamError>;

    /// Exposure time of the current acquisition in seconds, if armed.
    fn current_exposure_time(&self) -> Option<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use detstream_types::ScalarBundle;

    struct OneShot {
        ready: bool,
        acked: Vec<u64>,
    }

    impl Instrument for OneShot {
        fn processed_frame_count(&self) -> Result<u64, StreamError> {
            Ok(u64::from(self.ready))
        }

        fn read_frame_and_scalars(
            &mut self,
            offset: u64,
        ) -> Result<(FrameImage, ScalarBundle), StreamError> {
            if offset >= self.processed_frame_count()? {
                return Err(StreamError::instrument("read_frame_and_scalars", "not ready"));
            }
            Ok((FrameImage::from_u32([1, 2], &[5, 6])?, ScalarBundle::new(vec![])))
        }

        fn acknowledge_consumed(&mut self, offset: u64) -> Result<(), StreamError> {
            self.acked.push(offset);
            Ok(())
        }

        fn overrun_detected(&self) -> Result<bool, StreamError> {
            Ok(false)
        }

        fn current_exposure_time(&self) -> Option<f64> {
            None
        }
    }

    #[test]
    fn trait_object_drives_read_and_ack() {
        let mut instr: Box<dyn Instrument> = Box::new(OneShot {
            ready: true,
            acked: vec![],
        });
        assert_eq!(instr.processed_frame_count().unwrap(), 1);
        let (image, scalars) = instr.read_frame_and_scalars(0).unwrap();
        assert_eq!(image.to_u32_vec(), Some(vec![5, 6]));
        assert!(scalars.channels.is_empty());
        instr.acknowledge_consumed(0).unwrap();
        assert!(instr.read_frame_and_scalars(1).is_err());
    }
}
