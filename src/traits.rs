//! Core types and the backend trait for V4L2 camera abstraction.

use std::fmt;
use std::time::Duration;

use crate::capture::CancelToken;
use crate::convert;
use crate::error::Result;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Decode the little-endian 32-bit code used by the kernel.
    #[must_use]
    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_le_bytes())
    }

    /// The little-endian 32-bit code used by the kernel.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Closed set of pixel encodings the crate knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, `Y0 U Y1 V`.
    Yuyv422,
    /// Motion JPEG, one compressed image per buffer.
    Mjpeg,
    /// Packed 24-bit RGB.
    Rgb24,
    /// Anything else the driver reports.
    Other(FourCC),
}

impl PixelFormat {
    /// The four-character code of this format.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Yuyv422 => FourCC::YUYV,
            Self::Mjpeg => FourCC::MJPG,
            Self::Rgb24 => FourCC::RGB3,
            Self::Other(fourcc) => fourcc,
        }
    }

    /// Bytes per pixel for packed, uncompressed formats.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::Yuyv422 => Some(2),
            Self::Rgb24 => Some(3),
            Self::Mjpeg | Self::Other(_) => None,
        }
    }
}

impl From<FourCC> for PixelFormat {
    fn from(fourcc: FourCC) -> Self {
        match &fourcc.0 {
            b"YUYV" => Self::Yuyv422,
            b"MJPG" => Self::Mjpeg,
            b"RGB3" => Self::Rgb24,
            _ => Self::Other(fourcc),
        }
    }
}

/// A rational time per frame, e.g. 1/30 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fraction {
    /// Numerator.
    pub numerator: u32,
    /// Denominator.
    pub denominator: u32,
}

impl Fraction {
    /// Create a new fraction.
    #[must_use]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Frames per second for a frame interval, if well defined.
    #[must_use]
    pub fn fps(self) -> Option<f64> {
        (self.numerator != 0).then(|| f64::from(self.denominator) / f64::from(self.numerator))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// The format currently negotiated with the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub bytes_per_line: u32,
    /// Total frame size in bytes.
    pub image_size: u32,
}

impl FormatDescriptor {
    /// Create a format descriptor for a packed format with no row padding.
    #[must_use]
    pub fn packed(width: u32, height: u32, fourcc: FourCC) -> Self {
        let bpp = PixelFormat::from(fourcc).bytes_per_pixel().unwrap_or(2);
        let bytes_per_line = width * bpp;
        Self {
            width,
            height,
            fourcc,
            bytes_per_line,
            image_size: bytes_per_line * height,
        }
    }

    /// The closed pixel format variant for this descriptor.
    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::from(self.fourcc)
    }

    /// Four-character format name, e.g. `"YUYV"`.
    #[must_use]
    pub fn format_name(&self) -> String {
        self.fourcc.to_string()
    }
}

/// One supported (format, size, interval) combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatEntry {
    /// Pixel format.
    pub fourcc: FourCC,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame interval, if the driver enumerates them.
    pub interval: Option<Fraction>,
}

impl FormatEntry {
    /// Four-character format name, e.g. `"YUYV"`.
    #[must_use]
    pub fn format_name(&self) -> String {
        self.fourcc.to_string()
    }
}

/// A pixel format reported by `VIDIOC_ENUM_FMT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    /// Pixel format.
    pub fourcc: FourCC,
    /// Driver supplied description.
    pub description: String,
}

/// A frame size reported by `VIDIOC_ENUM_FRAMESIZES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    /// A single supported size.
    Discrete {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },
    /// A range of sizes (continuous when both steps are 1).
    Stepwise {
        /// Minimum width.
        min_width: u32,
        /// Maximum width.
        max_width: u32,
        /// Width increment.
        step_width: u32,
        /// Minimum height.
        min_height: u32,
        /// Maximum height.
        max_height: u32,
        /// Height increment.
        step_height: u32,
    },
}

/// A frame interval reported by `VIDIOC_ENUM_FRAMEINTERVALS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameIntervals {
    /// A single supported interval.
    Discrete(Fraction),
    /// A range of intervals.
    Stepwise {
        /// Shortest interval.
        min: Fraction,
        /// Longest interval.
        max: Fraction,
        /// Increment.
        step: Fraction,
    },
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

impl DeviceCapabilities {
    /// Reason these capabilities rule out streaming capture, if any.
    pub fn streaming_capture_gap(&self) -> Option<String> {
        if !self.can_capture {
            Some(format!("{} has no video capture capability", self.card))
        } else if !self.can_stream {
            Some(format!("{} does not support streaming I/O", self.card))
        } else {
            None
        }
    }
}

/// Kind of a device control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Signed integer in `[minimum, maximum]`.
    Integer,
    /// On/off.
    Boolean,
    /// Index into named menu items.
    Menu,
    /// Action without a value.
    Button,
    /// 64-bit integer.
    Integer64,
    /// String value.
    String,
    /// Bit mask.
    Bitmask,
    /// Index into integer menu items.
    IntegerMenu,
    /// Compound or otherwise unsupported type.
    Other,
}

/// Control flags reported by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ControlFlags {
    /// Control is permanently disabled.
    pub disabled: bool,
    /// Control is temporarily grabbed by another user.
    pub grabbed: bool,
    /// Value can only be read.
    pub read_only: bool,
    /// Changing it may affect other controls.
    pub update: bool,
    /// Currently has no effect.
    pub inactive: bool,
    /// Best shown as a slider.
    pub slider: bool,
    /// Value can only be written.
    pub write_only: bool,
    /// Value changes on its own.
    pub volatile: bool,
}

/// One entry of a menu control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuItem {
    /// Named menu entry.
    Name(String),
    /// Integer menu entry.
    Value(i64),
}

/// A device control as reported by `VIDIOC_QUERYCTRL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    /// Control id (`V4L2_CID_*`).
    pub id: u32,
    /// Driver supplied name.
    pub name: String,
    /// Value type.
    pub kind: ControlKind,
    /// Minimum value.
    pub minimum: i64,
    /// Maximum value.
    pub maximum: i64,
    /// Step between values.
    pub step: u64,
    /// Default value.
    pub default: i64,
    /// Flags.
    pub flags: ControlFlags,
    /// Menu entries by index, for menu controls.
    pub menu: Vec<(u32, MenuItem)>,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// Result of a successful `VIDIOC_DQBUF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Index of the completed buffer.
    pub index: u32,
    /// Frame metadata.
    pub metadata: FrameMetadata,
    /// The driver flagged the buffer contents as corrupted.
    pub corrupted: bool,
}

/// Outcome of waiting for the device to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A completed buffer can be dequeued.
    Readable,
    /// The wait was cancelled by a close.
    Cancelled,
}

/// A captured frame borrowed from a mapped buffer.
///
/// The view lives only until the next call that requeues its buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Raw frame data (`bytes_used` long).
    pub data: &'a [u8],
    /// Frame metadata.
    pub metadata: &'a FrameMetadata,
}

impl Frame<'_> {
    /// Copy the frame out of the mapped buffer.
    #[must_use]
    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            data: self.data.to_vec(),
            metadata: self.metadata.clone(),
        }
    }

    /// Get RGB values for a YUYV pixel at the specified coordinates.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32, width: u32) -> Option<(u8, u8, u8)> {
        convert::yuyv_pixel_at(self.data, x, y, width)
    }
}

/// A captured frame copied out of the mapped buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl OwnedFrame {
    /// Get RGB values for a YUYV pixel at the specified coordinates.
    ///
    /// For odd `x` the Y value of the second pixel of the pair is used with the
    /// shared U/V values.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32, width: u32) -> Option<(u8, u8, u8)> {
        convert::yuyv_pixel_at(&self.data, x, y, width)
    }
}

/// The ioctl surface a camera session is built on.
///
/// [`crate::V4l2Device`] issues the real requests against a device node; tests
/// substitute an in-memory simulation. Every method maps to one kernel request
/// and reports failures tagged with that request.
pub trait VideoBackend {
    /// Process-side view of one mapped capture buffer.
    type Mapping: AsRef<[u8]>;

    /// Capabilities read at open time.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Pixel formats supported for capture.
    fn enum_formats(&self) -> Result<Vec<FormatDescription>>;

    /// Frame sizes supported for a pixel format.
    fn enum_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<FrameSize>>;

    /// Frame intervals supported for a pixel format and size.
    fn enum_frame_intervals(
        &self,
        fourcc: FourCC,
        width: u32,
        height: u32,
    ) -> Result<Vec<FrameIntervals>>;

    /// Current capture format.
    fn format(&self) -> Result<FormatDescriptor>;

    /// Ask for a capture format. Returns what the driver actually applied.
    fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<FormatDescriptor>;

    /// Current time per frame.
    fn frame_interval(&self) -> Result<Fraction>;

    /// Ask for a time per frame. Returns what the driver actually applied.
    fn set_frame_interval(&mut self, interval: Fraction) -> Result<Fraction>;

    /// Enumerate the device controls.
    fn controls(&self) -> Result<Vec<ControlDescriptor>>;

    /// Read one control value.
    fn control(&self, id: u32) -> Result<i64>;

    /// Write one control value.
    fn set_control(&mut self, id: u32, value: i64) -> Result<()>;

    /// Request `count` mmap buffers; `0` frees them. Returns the granted count.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Query and map one buffer into process memory.
    fn map_buffer(&mut self, index: u32) -> Result<Self::Mapping>;

    /// Hand a buffer to the kernel.
    fn queue_buffer(&mut self, index: u32) -> Result<()>;

    /// Take a completed buffer back without blocking.
    ///
    /// Reports [`crate::CameraError::TransientIo`] when nothing is ready yet.
    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer>;

    /// Block until a buffer can be dequeued or `cancel` fires.
    fn wait_readable(&self, cancel: &CancelToken) -> Result<Readiness>;

    /// Start streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming; the kernel drops every queued buffer.
    fn stream_off(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_capture_gap() {
        let mut caps = DeviceCapabilities {
            card: "cam".to_owned(),
            can_capture: true,
            can_stream: true,
            ..DeviceCapabilities::default()
        };
        assert_eq!(caps.streaming_capture_gap(), None);

        caps.can_stream = false;
        assert_eq!(
            caps.streaming_capture_gap().as_deref(),
            Some("cam does not support streaming I/O")
        );

        caps.can_capture = false;
        assert_eq!(
            caps.streaming_capture_gap().as_deref(),
            Some("cam has no video capture capability")
        );
    }

    #[test]
    fn test_fourcc_round_trips_kernel_code() {
        // V4L2_PIX_FMT_YUYV
        assert_eq!(FourCC::YUYV.as_u32(), 0x5659_5559);
        assert_eq!(FourCC::from_u32(0x5659_5559), FourCC::YUYV);
        assert_eq!(FourCC::MJPG.to_string(), "MJPG");
    }

    #[test]
    fn test_fourcc_display_masks_unprintable() {
        assert_eq!(FourCC([b'A', 0, b'B', 0x7f]).to_string(), "A.B.");
    }

    #[test]
    fn test_pixel_format_mapping() {
        assert_eq!(PixelFormat::from(FourCC::YUYV), PixelFormat::Yuyv422);
        assert_eq!(PixelFormat::from(FourCC::MJPG), PixelFormat::Mjpeg);
        let nv12 = FourCC::new(b"NV12");
        assert_eq!(PixelFormat::from(nv12), PixelFormat::Other(nv12));
        assert_eq!(PixelFormat::Other(nv12).fourcc(), nv12);
    }

    #[test]
    fn test_packed_descriptor_sizes() {
        let format = FormatDescriptor::packed(352, 288, FourCC::YUYV);
        assert_eq!(format.bytes_per_line, 704);
        assert_eq!(format.image_size, 704 * 288);
        assert_eq!(format.format_name(), "YUYV");
    }

    #[test]
    fn test_fraction_fps() {
        assert_eq!(Fraction::new(1, 30).fps(), Some(30.0));
        assert_eq!(Fraction::new(0, 30).fps(), None);
    }
}
