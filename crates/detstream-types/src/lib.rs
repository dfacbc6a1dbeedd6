use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Version stamp carried by every [`ScalarBundle`] on the wire.
///
/// Bump this whenever a field is added to or removed from [`ChannelScalars`]
/// so that consumers can reject records they do not understand.
pub const SCALAR_RECORD_VERSION: u32 = 1;

/// Element type of a frame's sample array, named the way consumers expect
/// it in the `dtype` field (`"uint32"`, `"float64"`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl Dtype {
    /// Size of one sample in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::Uint8 => 1,
            Dtype::Uint16 => 2,
            Dtype::Uint32 | Dtype::Float32 => 4,
            Dtype::Uint64 | Dtype::Float64 => 8,
        }
    }

    /// Wire name of the element type.
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::Uint8 => "uint8",
            Dtype::Uint16 => "uint16",
            Dtype::Uint32 => "uint32",
            Dtype::Uint64 => "uint64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 2D sample array as pulled from the instrument.
///
/// The payload is an immutable, reference-counted byte buffer (native
/// endian, row-major).  Cloning a `FrameImage` never copies sample data.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameImage {
    shape: [usize; 2],
    dtype: Dtype,
    data: Bytes,
}

impl FrameImage {
    /// Wrap `data` as an image of `shape` (height, width) and `dtype`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidFrame`] when the buffer length does not
    /// equal `height × width × dtype.size()`.
    pub fn new(shape: [usize; 2], dtype: Dtype, data: Bytes) -> Result<Self, StreamError> {
        let expected = shape[0] * shape[1] * dtype.size();
        if data.len() != expected {
            return Err(StreamError::InvalidFrame(format!(
                "{} payload of shape {:?} needs {} bytes, got {}",
                dtype,
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// Build a `uint32` image from samples in row-major order.
    pub fn from_u32(shape: [usize; 2], samples: &[u32]) -> Result<Self, StreamError> {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        Self::new(shape, Dtype::Uint32, Bytes::from(bytes))
    }

    /// A zero-valued image, used as the monitor placeholder.
    pub fn zeros(shape: [usize; 2], dtype: Dtype) -> Self {
        Self {
            shape,
            dtype,
            data: Bytes::from(vec![0u8; shape[0] * shape[1] * dtype.size()]),
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decode the payload as `uint32` samples.  Returns `None` for any other
    /// element type.
    pub fn to_u32_vec(&self) -> Option<Vec<u32>> {
        if self.dtype != Dtype::Uint32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

/// Per-channel auxiliary counters for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelScalars {
    /// Good events per second of real time.
    pub output_count_rate: f64,
    pub all_events: u32,
    pub all_good: u32,
    pub clock_ticks: u32,
    /// Real time in 80 MHz clock ticks.
    pub total_ticks: u32,
    pub reset_ticks: u32,
    /// Calibrated event width used for the dead-time estimate.
    pub event_width: u32,
    pub dead_time_correction: f64,
    /// Raw in-window counter readings (window 0, window 1).
    pub window_sums: [u32; 2],
}

/// The scalar record that co-travels 1:1 with a frame's image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarBundle {
    pub version: u32,
    pub channels: Vec<ChannelScalars>,
}

impl ScalarBundle {
    /// Stamp `channels` with the current [`SCALAR_RECORD_VERSION`].
    pub fn new(channels: Vec<ChannelScalars>) -> Self {
        Self {
            version: SCALAR_RECORD_VERSION,
            channels,
        }
    }
}

/// One exposure: histogram image plus its scalar bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Position within the current series, starting at 0.
    pub sequence: u64,
    pub image: FrameImage,
    pub scalars: ScalarBundle,
}

/// Parameters of one acquisition run, fixed when the run is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesInfo {
    pub id: Uuid,
    /// `None` means "do not persist".
    pub destination: Option<String>,
    pub overwritable: bool,
    /// `0` means unbounded: the series only ends on Stop.
    pub expected_frames: u64,
}

impl SeriesInfo {
    /// Destination as transmitted in the header (`""` when not persisting).
    pub fn filename(&self) -> &str {
        self.destination.as_deref().unwrap_or("")
    }

    /// `true` once `sent_frames` completes a bounded series.
    pub fn is_complete(&self, sent_frames: u64) -> bool {
        self.expected_frames != 0 && sent_frames >= self.expected_frames
    }
}

/// Directives accepted by the acquisition loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(SeriesInfo),
    Stop,
    Terminate,
}

impl Command {
    /// Build a `Start` command.  A destination of `"none"` (any case) or an
    /// empty string disables persistence downstream.
    pub fn start(destination: impl Into<String>, overwritable: bool, expected_frames: u64) -> Self {
        let destination = destination.into();
        let destination = if destination.is_empty() || destination.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(destination)
        };
        Command::Start(SeriesInfo {
            id: Uuid::new_v4(),
            destination,
            overwritable,
            expected_frames,
        })
    }
}

/// Coarse state of the acquisition loop, exposed read-only to other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    Streaming,
    /// The loop has exited, either on Terminate or after a fault.
    Terminated,
}

impl LoopState {
    pub fn as_u8(self) -> u8 {
        match self {
            LoopState::Idle => 0,
            LoopState::Streaming => 1,
            LoopState::Terminated => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LoopState::Idle,
            1 => LoopState::Streaming,
            _ => LoopState::Terminated,
        }
    }
}

/// Compression applied to an image payload.  Only raw payloads are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
}

/// JSON part that leads every message on the data stream and every monitor
/// reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageHeader {
    /// Opens a series.
    Header { filename: String, overwritable: bool },
    /// Describes the raw payload that follows it.
    Image {
        frame: u64,
        shape: [usize; 2],
        dtype: Dtype,
        #[serde(default = "no_compression")]
        compression: Compression,
        #[serde(default)]
        exptime: Option<f64>,
    },
    /// Closes a series.
    SeriesEnd,
}

fn no_compression() -> Compression {
    Compression::None
}

/// Everything that can go wrong in the streaming pipeline.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamError {
    #[error("Circular buffer overrun detected after {sent_frames} frame(s)")]
    Overrun { sent_frames: u64 },

    #[error("Instrument fault during {operation}: {details}")]
    Instrument { operation: String, details: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Command queue full")]
    CommandQueueFull,

    #[error("Acquisition loop is not running")]
    LoopDead,

    #[error("A series is already open")]
    SeriesOpen,

    #[error("Acquisition loop panicked: {0}")]
    Panic(String),

    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StreamError {
    pub fn instrument(operation: impl Into<String>, details: impl Into<String>) -> Self {
        StreamError::Instrument {
            operation: operation.into(),
            details: details.into(),
        }
    }
}

/// The first failure that killed the acquisition loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub error: StreamError,
    pub timestamp: DateTime<Utc>,
    /// Frames published in the open series when the fault hit.
    pub sent_frames: u64,
}

impl FaultRecord {
    pub fn new(error: StreamError, sent_frames: u64) -> Self {
        Self {
            error,
            timestamp: Utc::now(),
            sent_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_sizes_and_names() {
        assert_eq!(Dtype::Uint32.size(), 4);
        assert_eq!(Dtype::Float64.size(), 8);
        assert_eq!(Dtype::Uint16.as_str(), "uint16");
        let json = serde_json::to_string(&Dtype::Uint32).unwrap();
        assert_eq!(json, "\"uint32\"");
    }

    #[test]
    fn frame_image_rejects_wrong_length() {
        let err = FrameImage::new([2, 3], Dtype::Uint32, Bytes::from(vec![0u8; 10])).unwrap_err();
        assert!(matches!(err, StreamError::InvalidFrame(_)));
    }

    #[test]
    fn frame_image_from_u32_preserves_samples() {
        let img = FrameImage::from_u32([2, 2], &[1, 2, 3, 4]).unwrap();
        assert_eq!(img.shape(), [2, 2]);
        assert_eq!(img.data().len(), 16);
        assert_eq!(img.to_u32_vec(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn zero_placeholder_is_zero_filled() {
        let img = FrameImage::zeros([2, 2], Dtype::Uint32);
        assert_eq!(img.data().len(), 16);
        assert!(img.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn start_with_none_destination_disables_persistence() {
        let Command::Start(info) = Command::start("NONE", false, 3) else {
            panic!("expected Start");
        };
        assert_eq!(info.destination, None);
        assert_eq!(info.filename(), "");

        let Command::Start(info) = Command::start("run1.h5", true, 3) else {
            panic!("expected Start");
        };
        assert_eq!(info.filename(), "run1.h5");
        assert!(info.overwritable);
    }

    #[test]
    fn unbounded_series_is_never_complete() {
        let Command::Start(info) = Command::start("x", false, 0) else {
            panic!("expected Start");
        };
        assert!(!info.is_complete(1_000_000));
    }

    #[test]
    fn header_json_shape() {
        let header = MessageHeader::Header {
            filename: "run1.dat".into(),
            overwritable: false,
        };
        let value: serde_json::Value = serde_json::to_value(&header).unwrap();
        assert_eq!(value["type"], "header");
        assert_eq!(value["filename"], "run1.dat");
        assert_eq!(value["overwritable"], false);

        let end = serde_json::to_value(MessageHeader::SeriesEnd).unwrap();
        assert_eq!(end, serde_json::json!({ "type": "series_end" }));
    }

    #[test]
    fn image_header_json_shape() {
        let image = MessageHeader::Image {
            frame: 7,
            shape: [4, 4096],
            dtype: Dtype::Uint32,
            compression: Compression::None,
            exptime: Some(0.1),
        };
        let value: serde_json::Value = serde_json::to_value(&image).unwrap();
        assert_eq!(value["type"], "image");
        assert_eq!(value["frame"], 7);
        assert_eq!(value["shape"], serde_json::json!([4, 4096]));
        assert_eq!(value["dtype"], "uint32");
        assert_eq!(value["compression"], "none");
    }

    #[test]
    fn loop_state_u8_conversion() {
        for state in [LoopState::Idle, LoopState::Streaming, LoopState::Terminated] {
            assert_eq!(LoopState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn stream_error_display() {
        let err = StreamError::Overrun { sent_frames: 12 };
        assert!(err.to_string().contains("overrun"));
        let err = StreamError::instrument("read_frame_and_scalars", "SDK returned -1");
        assert!(err.to_string().contains("read_frame_and_scalars"));
    }

    #[test]
    fn fault_record_serializes_for_supervisors() {
        let record = FaultRecord::new(StreamError::Overrun { sent_frames: 3 }, 3);
        let json = serde_json::to_string(&record).unwrap();
        let back: FaultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, record.error);
        assert_eq!(back.sent_frames, 3);
    }
}
