//! Error taxonomy for camera operations.
//!
//! Every failure at the kernel boundary is tagged with the [`Ioctl`] that
//! produced it, so a caller can always tell which step of the open,
//! negotiate, allocate, stream sequence went wrong.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::BufferState;
use crate::convert::ConvertError;
use crate::traits::FormatEntry;

/// Kernel control request (or companion syscall) issued against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ioctl {
    /// `open(2)` on the device node.
    Open,
    /// `VIDIOC_QUERYCAP`
    QueryCap,
    /// `VIDIOC_ENUM_FMT`
    EnumFormats,
    /// `VIDIOC_ENUM_FRAMESIZES`
    EnumFrameSizes,
    /// `VIDIOC_ENUM_FRAMEINTERVALS`
    EnumFrameIntervals,
    /// `VIDIOC_G_FMT`
    GetFormat,
    /// `VIDIOC_S_FMT`
    SetFormat,
    /// `VIDIOC_G_PARM`
    GetParams,
    /// `VIDIOC_S_PARM`
    SetParams,
    /// `VIDIOC_QUERYCTRL` / `VIDIOC_QUERYMENU`
    QueryControls,
    /// `VIDIOC_G_CTRL`
    GetControl,
    /// `VIDIOC_S_CTRL`
    SetControl,
    /// `VIDIOC_REQBUFS`
    RequestBuffers,
    /// `VIDIOC_QUERYBUF`
    QueryBuffer,
    /// `mmap(2)` of a buffer.
    Mmap,
    /// `VIDIOC_QBUF`
    QueueBuffer,
    /// `VIDIOC_DQBUF`
    DequeueBuffer,
    /// `VIDIOC_STREAMON`
    StreamOn,
    /// `VIDIOC_STREAMOFF`
    StreamOff,
    /// `poll(2)` readiness wait.
    Poll,
}

impl fmt::Display for Ioctl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::QueryCap => "VIDIOC_QUERYCAP",
            Self::EnumFormats => "VIDIOC_ENUM_FMT",
            Self::EnumFrameSizes => "VIDIOC_ENUM_FRAMESIZES",
            Self::EnumFrameIntervals => "VIDIOC_ENUM_FRAMEINTERVALS",
            Self::GetFormat => "VIDIOC_G_FMT",
            Self::SetFormat => "VIDIOC_S_FMT",
            Self::GetParams => "VIDIOC_G_PARM",
            Self::SetParams => "VIDIOC_S_PARM",
            Self::QueryControls => "VIDIOC_QUERYCTRL",
            Self::GetControl => "VIDIOC_G_CTRL",
            Self::SetControl => "VIDIOC_S_CTRL",
            Self::RequestBuffers => "VIDIOC_REQBUFS",
            Self::QueryBuffer => "VIDIOC_QUERYBUF",
            Self::Mmap => "mmap",
            Self::QueueBuffer => "VIDIOC_QBUF",
            Self::DequeueBuffer => "VIDIOC_DQBUF",
            Self::StreamOn => "VIDIOC_STREAMON",
            Self::StreamOff => "VIDIOC_STREAMOFF",
            Self::Poll => "poll",
        };
        f.write_str(name)
    }
}

/// Why a device node could not be opened as a camera.
#[derive(Debug, Error)]
pub enum OpenFailure {
    /// The device node does not exist.
    #[error("no such device")]
    NotFound,
    /// The process may not open the device node.
    #[error("permission denied, try adding the user to the 'video' group")]
    PermissionDenied,
    /// The node exists but is not a streaming V4L2 capture device.
    #[error("not a V4L2 capture device: {0}")]
    NotAV4l2Device(String),
    /// Any other open-time I/O failure.
    #[error(transparent)]
    Io(io::Error),
}

impl OpenFailure {
    /// Classify the error returned by `open(2)` or `VIDIOC_QUERYCAP`.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => match err.raw_os_error() {
                Some(libc::ENODEV | libc::ENXIO) => Self::NotFound,
                Some(libc::ENOTTY | libc::EINVAL) => {
                    Self::NotAV4l2Device("device does not answer VIDIOC_QUERYCAP".to_owned())
                }
                _ => Self::Io(err),
            },
        }
    }
}

/// Structural misuse of the capture API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Misuse {
    /// `start` called while the stream is not idle.
    #[error("stream is already running")]
    AlreadyStreaming,
    /// A capture was requested while the stream is idle.
    #[error("stream is not running")]
    NotStreaming,
    /// Format or frame interval renegotiation while streaming.
    #[error("format cannot change while streaming")]
    FormatWhileStreaming,
    /// Buffer pool release while streaming.
    #[error("buffers cannot be released while streaming")]
    ReleaseWhileStreaming,
    /// The stream hit an unrecoverable error and must be stopped first.
    #[error("stream failed, stop() is required")]
    StreamFailed,
    /// No captured frame is currently held by the caller.
    #[error("no captured frame is available")]
    NoFrame,
    /// A buffer ownership transition was attempted from the wrong state.
    #[error("buffer {index} is {actual}, expected {expected}")]
    BufferState {
        /// Buffer index.
        index: u32,
        /// Current state.
        actual: BufferState,
        /// State the transition requires.
        expected: BufferState,
    },
    /// Buffer index outside the pool.
    #[error("buffer index {0} is out of range")]
    NoSuchBuffer(u32),
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device could not be opened as a capture device.
    #[error("failed to open {}: {reason}", path.display())]
    DeviceOpenFailed {
        /// Device node path.
        path: PathBuf,
        /// Classified cause.
        reason: OpenFailure,
    },
    /// The driver rejected the requested format.
    #[error("format {requested} rejected by driver ({} supported formats)", supported.len())]
    UnsupportedFormat {
        /// Human readable description of the request.
        requested: String,
        /// What the driver reports it can do.
        supported: Vec<FormatEntry>,
    },
    /// Precondition violation (programmer error).
    #[error("operation not permitted: {0}")]
    NotStreamable(Misuse),
    /// The driver granted too few buffers for double-buffered streaming.
    #[error("driver granted {granted} of {requested} buffers, at least {required} required")]
    AllocationFailed {
        /// Buffers requested.
        requested: u32,
        /// Buffers granted by the driver.
        granted: u32,
        /// Functional minimum.
        required: u32,
    },
    /// The kernel asked to try again; only surfaced once retries run out.
    #[error("{ioctl} kept reporting try-again")]
    TransientIo {
        /// Request that reported the condition.
        ioctl: Ioctl,
    },
    /// Unrecoverable kernel error.
    #[error("{ioctl} failed: {source}")]
    FatalIo {
        /// Request that failed.
        ioctl: Ioctl,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// An outstanding capture was unblocked by a close.
    #[error("capture cancelled by close")]
    Cancelled,
    /// The device has been closed.
    #[error("device is closed")]
    Closed,
    /// Pixel conversion precondition failed.
    #[error(transparent)]
    Conversion(#[from] ConvertError),
}

impl CameraError {
    /// Map an OS error returned by `ioctl` to the taxonomy.
    pub(crate) fn ioctl(ioctl: Ioctl, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            Self::TransientIo { ioctl }
        } else {
            Self::FatalIo { ioctl, source: err }
        }
    }

    /// Whether the error indicates the device went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::FatalIo { source, .. } => matches!(
                source.raw_os_error(),
                Some(libc::ENODEV | libc::ENXIO | libc::EIO)
            ),
            _ => false,
        }
    }

    /// The request a kernel failure came from.
    pub const fn failed_ioctl(&self) -> Option<Ioctl> {
        match self {
            Self::FatalIo { ioctl, .. } | Self::TransientIo { ioctl } => Some(*ioctl),
            _ => None,
        }
    }

    /// Whether the error is a try-again condition.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

impl From<Misuse> for CameraError {
    fn from(misuse: Misuse) -> Self {
        Self::NotStreamable(misuse)
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
