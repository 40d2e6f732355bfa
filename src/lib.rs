//! v4l2-capture: userspace V4L2 camera capture.
//!
//! Negotiates a capture format with the kernel, streams frames through a
//! pool of memory-mapped buffers shared with the driver, and converts YUYV
//! frames to RGB. The ioctl surface sits behind [`VideoBackend`], so the
//! whole streaming state machine can be exercised against an in-memory
//! device in tests.
//!
//! ```no_run
//! use v4l2_capture::Camera;
//!
//! let mut camera = Camera::open("/dev/video0")?;
//! camera.set_format(640, 480)?;
//! camera.start()?;
//! let frame = camera.capture_frame()?;
//! println!("frame {} ({} bytes)", frame.metadata.sequence, frame.data.len());
//! let rgb = camera.to_rgb()?;
//! assert_eq!(rgb.len(), 640 * 480 * 3);
//! # Ok::<(), v4l2_capture::CameraError>(())
//! ```

pub mod buffer;
pub mod camera;
pub mod capture;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod format;
mod sys;
pub mod traits;
pub mod validation;
pub mod worker;

#[cfg(test)]
pub mod mock;

pub use buffer::{BufferPool, BufferState};
pub use camera::{Camera, CloseHandle};
pub use capture::{CancelToken, CaptureLoop, StreamState};
pub use config::CaptureConfig;
pub use device::V4l2Device;
pub use error::{CameraError, Ioctl, Misuse, OpenFailure, Result};
pub use traits::{
    DeviceCapabilities, FormatDescriptor, FormatEntry, FourCC, Fraction, Frame, FrameMetadata,
    OwnedFrame, PixelFormat, VideoBackend,
};
pub use worker::AsyncCamera;
