//! Capture session configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_BUFFER_COUNT;
use crate::capture::DEFAULT_TRANSIENT_RETRIES;
use crate::traits::Fraction;

const fn default_buffer_count() -> u32 {
    DEFAULT_BUFFER_COUNT
}

const fn default_transient_retries() -> u32 {
    DEFAULT_TRANSIENT_RETRIES
}

/// Settings applied by [`crate::Camera::open_with`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device node, e.g. `/dev/video0`.
    pub device: PathBuf,
    /// Requested frame width; the current height is kept if only this is set.
    #[serde(default)]
    pub width: Option<u32>,
    /// Requested frame height; the current width is kept if only this is set.
    #[serde(default)]
    pub height: Option<u32>,
    /// Buffers requested from the driver when streaming starts.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
    /// Requested time per frame.
    #[serde(default)]
    pub frame_interval: Option<Fraction>,
    /// Consecutive try-again dequeues tolerated per capture.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

impl CaptureConfig {
    /// Defaults for `device`.
    pub fn new<P: AsRef<Path>>(device: P) -> Self {
        Self {
            device: device.as_ref().to_path_buf(),
            width: None,
            height: None,
            buffer_count: DEFAULT_BUFFER_COUNT,
            frame_interval: None,
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
        }
    }

    /// Request a resolution.
    #[must_use]
    pub const fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Request a buffer count.
    #[must_use]
    pub const fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    /// Request a frame interval.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Fraction) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Tolerate `retries` consecutive try-again dequeues per capture.
    #[must_use]
    pub const fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    /// Requested size, filling a missing dimension from `current`.
    pub fn resolution(&self, current: (u32, u32)) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (None, None) => None,
            (width, height) => Some((width.unwrap_or(current.0), height.unwrap_or(current.1))),
        }
    }
}
