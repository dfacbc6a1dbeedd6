//! Multipart wire encoding shared by every transport.
//!
//! | message | parts |
//! |---|---|
//! | header | `[{"type":"header","filename":…,"overwritable":…}]` |
//! | frame | `[{"type":"image","frame":…,"shape":[h,w],"dtype":…,"compression":"none","exptime":…}, raw payload, scalar JSON]` |
//! | series end | `[{"type":"series_end"}]` |
//! | monitor reply | `[{"type":"image",…}, raw payload]` |
//!
//! A frame is always a single three-part message so that its image and its
//! scalar record cannot be separated or interleaved with another frame.

use bytes::Bytes;
use detstream_types::{
    Compression, Dtype, Frame, FrameImage, MessageHeader, SCALAR_RECORD_VERSION, ScalarBundle,
    SeriesInfo, StreamError,
};
use serde::Serialize;

/// The latest published frame, as served on the monitor channel.
///
/// Shares its payload buffer with the message that was published.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSnapshot {
    pub frame: u64,
    pub image: FrameImage,
    pub exptime: Option<f64>,
}

impl MonitorSnapshot {
    /// Zero-valued 2×2 `uint32` image reported before any frame is published.
    pub fn placeholder() -> Self {
        Self {
            frame: 0,
            image: FrameImage::zeros([2, 2], Dtype::Uint32),
            exptime: None,
        }
    }
}

/// One transport message made of one or more byte parts.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    parts: Vec<Bytes>,
}

/// A [`WireMessage`] parsed back into typed values.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Header {
        filename: String,
        overwritable: bool,
    },
    /// A frame from the data stream (`scalars` present) or a monitor reply
    /// (`scalars` absent).
    Image {
        frame: u64,
        image: FrameImage,
        exptime: Option<f64>,
        scalars: Option<ScalarBundle>,
    },
    SeriesEnd,
}

impl WireMessage {
    pub fn from_parts(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<Bytes> {
        self.parts
    }

    /// Total payload size across all parts.
    pub fn byte_len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    pub fn header(info: &SeriesInfo) -> Result<Self, StreamError> {
        let header = MessageHeader::Header {
            filename: info.filename().to_string(),
            overwritable: info.overwritable,
        };
        Ok(Self::from_parts(vec![json_part(&header)?]))
    }

    pub fn frame(frame: &Frame, exptime: Option<f64>) -> Result<Self, StreamError> {
        Ok(Self::from_parts(vec![
            json_part(&image_header(frame.sequence, &frame.image, exptime))?,
            frame.image.data().clone(),
            json_part(&frame.scalars)?,
        ]))
    }

    pub fn series_end() -> Result<Self, StreamError> {
        Ok(Self::from_parts(vec![json_part(&MessageHeader::SeriesEnd)?]))
    }

    pub fn monitor_reply(snapshot: &MonitorSnapshot) -> Result<Self, StreamError> {
        Ok(Self::from_parts(vec![
            json_part(&image_header(snapshot.frame, &snapshot.image, snapshot.exptime))?,
            snapshot.image.data().clone(),
        ]))
    }

    /// Parse the message, validating part counts, payload length and the
    /// scalar record version.
    pub fn decode(&self) -> Result<DecodedMessage, StreamError> {
        let first = self
            .parts
            .first()
            .ok_or_else(|| StreamError::Decoding("empty message".into()))?;
        let header: MessageHeader =
            serde_json::from_slice(first).map_err(|e| StreamError::Decoding(e.to_string()))?;

        match header {
            MessageHeader::Header {
                filename,
                overwritable,
            } => {
                self.expect_parts("header", &[1])?;
                Ok(DecodedMessage::Header {
                    filename,
                    overwritable,
                })
            }
            MessageHeader::SeriesEnd => {
                self.expect_parts("series_end", &[1])?;
                Ok(DecodedMessage::SeriesEnd)
            }
            MessageHeader::Image {
                frame,
                shape,
                dtype,
                exptime,
                ..
            } => {
                self.expect_parts("image", &[2, 3])?;
                let image = FrameImage::new(shape, dtype, self.parts[1].clone())?;
                let scalars = match self.parts.get(2) {
                    Some(raw) => Some(decode_scalars(raw)?),
                    None => None,
                };
                Ok(DecodedMessage::Image {
                    frame,
                    image,
                    exptime,
                    scalars,
                })
            }
        }
    }

    fn expect_parts(&self, kind: &str, allowed: &[usize]) -> Result<(), StreamError> {
        if allowed.contains(&self.parts.len()) {
            Ok(())
        } else {
            Err(StreamError::Decoding(format!(
                "{kind} message has {} part(s), expected {allowed:?}",
                self.parts.len()
            )))
        }
    }
}

fn image_header(frame: u64, image: &FrameImage, exptime: Option<f64>) -> MessageHeader {
    MessageHeader::Image {
        frame,
        shape: image.shape(),
        dtype: image.dtype(),
        compression: Compression::None,
        exptime,
    }
}

fn json_part<T: Serialize>(value: &T) -> Result<Bytes, StreamError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| StreamError::Encoding(e.to_string()))
}

fn decode_scalars(raw: &[u8]) -> Result<ScalarBundle, StreamError> {
    let bundle: ScalarBundle =
        serde_json::from_slice(raw).map_err(|e| StreamError::Decoding(e.to_string()))?;
    if bundle.version != SCALAR_RECORD_VERSION {
        return Err(StreamError::Decoding(format!(
            "unsupported scalar record version {} (expected {SCALAR_RECORD_VERSION})",
            bundle.version
        )));
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use detstream_types::{ChannelScalars, Command};

    fn frame(sequence: u64) -> Frame {
        Frame {
            sequence,
            image: FrameImage::from_u32([2, 3], &[1, 2, 3, 4, 5, 6]).unwrap(),
            scalars: ScalarBundle::new(vec![ChannelScalars {
                output_count_rate: 1.5,
                all_events: 10,
                all_good: 9,
                clock_ticks: 100,
                total_ticks: 100,
                reset_ticks: 1,
                event_width: 6,
                dead_time_correction: 1.01,
                window_sums: [3, 4],
            }]),
        }
    }

    #[test]
    fn frame_is_three_parts_with_raw_payload_in_the_middle() {
        let msg = WireMessage::frame(&frame(4), Some(0.1)).unwrap();
        assert_eq!(msg.parts().len(), 3);
        assert_eq!(msg.parts()[1].len(), 24);

        let head: serde_json::Value = serde_json::from_slice(&msg.parts()[0]).unwrap();
        assert_eq!(head["type"], "image");
        assert_eq!(head["frame"], 4);
        assert_eq!(head["dtype"], "uint32");
        assert_eq!(head["compression"], "none");

        let scalars: serde_json::Value = serde_json::from_slice(&msg.parts()[2]).unwrap();
        assert_eq!(scalars["version"], 1);
        assert_eq!(scalars["channels"][0]["all_good"], 9);
        assert_eq!(scalars["channels"][0]["window_sums"], serde_json::json!([3, 4]));
    }

    #[test]
    fn frame_payload_shares_image_buffer() {
        let f = frame(0);
        let msg = WireMessage::frame(&f, None).unwrap();
        assert_eq!(msg.parts()[1].as_ptr(), f.image.data().as_ptr());
    }

    #[test]
    fn header_carries_empty_filename_when_not_persisting() {
        let Command::Start(info) = Command::start("none", true, 1) else {
            panic!("expected Start");
        };
        let msg = WireMessage::header(&info).unwrap();
        assert_eq!(
            msg.decode().unwrap(),
            DecodedMessage::Header {
                filename: String::new(),
                overwritable: true
            }
        );
    }

    #[test]
    fn decode_frame_restores_image_and_scalars() {
        let f = frame(2);
        let msg = WireMessage::frame(&f, Some(0.25)).unwrap();
        let DecodedMessage::Image {
            frame,
            image,
            exptime,
            scalars,
        } = msg.decode().unwrap()
        else {
            panic!("expected image");
        };
        assert_eq!(frame, 2);
        assert_eq!(image, f.image);
        assert_eq!(exptime, Some(0.25));
        assert_eq!(scalars, Some(f.scalars));
    }

    #[test]
    fn monitor_reply_has_no_scalar_part() {
        let msg = WireMessage::monitor_reply(&MonitorSnapshot::placeholder()).unwrap();
        assert_eq!(msg.parts().len(), 2);
        let DecodedMessage::Image { frame, image, scalars, .. } = msg.decode().unwrap() else {
            panic!("expected image");
        };
        assert_eq!(frame, 0);
        assert_eq!(image.shape(), [2, 2]);
        assert_eq!(image.to_u32_vec(), Some(vec![0, 0, 0, 0]));
        assert!(scalars.is_none());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let msg = WireMessage::frame(&frame(0), None).unwrap();
        let mut parts = msg.into_parts();
        parts[1] = parts[1].slice(..10);
        let err = WireMessage::from_parts(parts).decode().unwrap_err();
        assert!(matches!(err, StreamError::InvalidFrame(_)));
    }

    #[test]
    fn unknown_scalar_version_is_rejected() {
        let msg = WireMessage::frame(&frame(0), None).unwrap();
        let mut parts = msg.into_parts();
        parts[2] = Bytes::from_static(br#"{"version":99,"channels":[]}"#);
        let err = WireMessage::from_parts(parts).decode().unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn stray_parts_on_footer_are_rejected() {
        let mut parts = WireMessage::series_end().unwrap().into_parts();
        parts.push(Bytes::from_static(b"junk"));
        assert!(WireMessage::from_parts(parts).decode().is_err());
        assert!(WireMessage::from_parts(vec![]).decode().is_err());
    }
}
