//! Public camera session: open, negotiate, stream, convert, close.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::buffer::{BufferPool, BufferState, DEFAULT_BUFFER_COUNT, MIN_BUFFERS};
use crate::capture::{CancelToken, CaptureLoop, StreamState};
use crate::config::CaptureConfig;
use crate::convert;
use crate::device::V4l2Device;
use crate::error::{CameraError, Misuse, OpenFailure, Result};
use crate::format::{self, FormatIter};
use crate::traits::{
    ControlDescriptor, DeviceCapabilities, FormatDescriptor, FormatEntry, Fraction, Frame,
    VideoBackend,
};

/// Closes a [`Camera`] from another thread.
///
/// A capture blocked at the time resolves with [`CameraError::Cancelled`];
/// every later call on the camera fails with [`CameraError::Closed`].
#[derive(Debug, Clone)]
pub struct CloseHandle {
    cancel: CancelToken,
}

impl CloseHandle {
    /// Request the camera to close.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether close has been requested.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One open camera.
///
/// The device is closed when the camera is dropped.
pub struct Camera<B: VideoBackend = V4l2Device> {
    path: PathBuf,
    backend: Option<B>,
    pool: Option<BufferPool<B::Mapping>>,
    capture: CaptureLoop,
    format: FormatDescriptor,
    buffer_count: u32,
}

impl<B: VideoBackend> fmt::Debug for Camera<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("path", &self.path)
            .field("open", &self.backend.is_some())
            .field("state", &self.capture.state())
            .field("format", &self.format)
            .field("buffer_count", &self.buffer_count)
            .finish_non_exhaustive()
    }
}

impl Camera<V4l2Device> {
    /// Open a V4L2 capture device, e.g. `/dev/video0`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let device = V4l2Device::open(path.as_ref())?;
        Self::with_backend(path, device)
    }

    /// Open the configured device and apply the rest of `config`.
    pub fn open_with(config: &CaptureConfig) -> Result<Self> {
        let mut camera = Self::open(&config.device)?;
        camera.configure(config)?;
        Ok(camera)
    }
}

impl<B: VideoBackend> Camera<B> {
    /// Build a camera session on top of an already opened backend.
    pub fn with_backend<P: AsRef<Path>>(path: P, backend: B) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(gap) = backend.capabilities().streaming_capture_gap() {
            return Err(CameraError::DeviceOpenFailed {
                path,
                reason: OpenFailure::NotAV4l2Device(gap),
            });
        }
        let cancel = CancelToken::new().map_err(|err| CameraError::DeviceOpenFailed {
            path: path.clone(),
            reason: OpenFailure::Io(err),
        })?;
        let format = backend.format()?;
        debug!(
            path = %path.display(),
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "initial format"
        );
        Ok(Self {
            path,
            backend: Some(backend),
            pool: None,
            capture: CaptureLoop::new(cancel),
            format,
            buffer_count: DEFAULT_BUFFER_COUNT,
        })
    }

    /// Apply buffer count, retry budget, resolution and frame interval.
    pub fn configure(&mut self, config: &CaptureConfig) -> Result<()> {
        self.set_buffer_count(config.buffer_count);
        self.capture.set_transient_retries(config.transient_retries);
        if let Some((width, height)) = config.resolution((self.format.width, self.format.height)) {
            self.set_format(width, height)?;
        }
        if let Some(interval) = config.frame_interval {
            self.set_frame_interval(interval)?;
        }
        Ok(())
    }

    fn backend(&self) -> Result<&B> {
        if self.capture.cancel_token().is_cancelled() {
            return Err(CameraError::Closed);
        }
        self.backend.as_ref().ok_or(CameraError::Closed)
    }

    /// Close on a pending close request; fail once closed.
    fn ensure_open(&mut self) -> Result<()> {
        if self.backend.is_none() {
            return Err(CameraError::Closed);
        }
        if self.capture.cancel_token().is_cancelled() {
            self.close();
            return Err(CameraError::Closed);
        }
        Ok(())
    }

    /// Device node this camera was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the camera has been closed.
    pub fn is_closed(&self) -> bool {
        self.backend.is_none() || self.capture.cancel_token().is_cancelled()
    }

    /// Handle for closing the camera from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            cancel: self.capture.cancel_token().clone(),
        }
    }

    /// Capabilities reported at open time.
    pub fn capabilities(&self) -> Result<&DeviceCapabilities> {
        Ok(self.backend()?.capabilities())
    }

    /// Streaming state.
    pub const fn state(&self) -> StreamState {
        self.capture.state()
    }

    /// Ownership state of every allocated buffer.
    pub fn buffer_states(&self) -> Vec<BufferState> {
        self.pool
            .as_ref()
            .map(|pool| pool.states().collect())
            .unwrap_or_default()
    }

    /// Lazily enumerate supported (format, size, interval) combinations.
    pub fn formats(&self) -> Result<FormatIter<'_, B>> {
        Ok(format::list_formats(self.backend()?))
    }

    /// Every supported (format, size, interval) combination.
    pub fn list_formats(&self) -> Result<Vec<FormatEntry>> {
        self.formats()?.collect()
    }

    /// Query the driver for the current format.
    pub fn format(&self) -> Result<FormatDescriptor> {
        format::current_format(self.backend()?)
    }

    /// The format last negotiated, which buffers and conversions use.
    pub const fn negotiated_format(&self) -> &FormatDescriptor {
        &self.format
    }

    /// Ask for a new resolution in the current pixel format.
    ///
    /// Only legal while idle. Buffers from an earlier session are released
    /// and reallocated for the new size on the next [`Camera::start`].
    pub fn set_format(&mut self, width: u32, height: u32) -> Result<FormatDescriptor> {
        self.ensure_open()?;
        let state = self.capture.state();
        if state != StreamState::Idle {
            return Err(Misuse::FormatWhileStreaming.into());
        }
        self.release_pool()?;

        let backend = self.backend.as_mut().ok_or(CameraError::Closed)?;
        let applied = format::set_format(backend, state, width, height)?;
        self.format = applied.clone();
        Ok(applied)
    }

    /// Current time per frame.
    pub fn frame_interval(&self) -> Result<Fraction> {
        format::frame_interval(self.backend()?)
    }

    /// Ask for a time per frame. Only legal while idle.
    pub fn set_frame_interval(&mut self, interval: Fraction) -> Result<Fraction> {
        self.ensure_open()?;
        let state = self.capture.state();
        let backend = self.backend.as_mut().ok_or(CameraError::Closed)?;
        format::set_frame_interval(backend, state, interval)
    }

    /// Device controls.
    pub fn controls(&self) -> Result<Vec<ControlDescriptor>> {
        self.backend()?.controls()
    }

    /// Read a control value.
    pub fn control(&self, id: u32) -> Result<i64> {
        self.backend()?.control(id)
    }

    /// Write a control value. Legal while streaming.
    pub fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        self.ensure_open()?;
        self.backend
            .as_mut()
            .ok_or(CameraError::Closed)?
            .set_control(id, value)
    }

    /// Number of buffers requested on the next allocation.
    ///
    /// Takes effect the next time buffers are allocated.
    pub fn set_buffer_count(&mut self, count: u32) {
        if count < MIN_BUFFERS {
            warn!(count, minimum = MIN_BUFFERS, "buffer count raised to minimum");
        }
        self.buffer_count = count.max(MIN_BUFFERS);
    }

    fn release_pool(&mut self) -> Result<()> {
        let (Some(backend), Some(pool)) = (self.backend.as_mut(), self.pool.take()) else {
            return Ok(());
        };
        pool.release(backend)
    }

    /// Allocate buffers if needed, queue them all and start streaming.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.capture.state() != StreamState::Idle {
            return Err(Misuse::AlreadyStreaming.into());
        }

        let Self {
            backend,
            pool,
            capture,
            buffer_count,
            ..
        } = self;
        let backend = backend.as_mut().ok_or(CameraError::Closed)?;
        if pool.is_none() {
            *pool = Some(BufferPool::allocate(backend, *buffer_count)?);
        }
        let pool = pool.as_mut().ok_or(CameraError::Closed)?;
        capture.start(backend, pool)
    }

    /// Stop streaming. A no-op while idle.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_open()?;
        let Self {
            backend,
            pool,
            capture,
            ..
        } = self;
        let backend = backend.as_mut().ok_or(CameraError::Closed)?;
        match pool {
            Some(pool) => capture.stop(backend, pool),
            None => Ok(()),
        }
    }

    /// Wait for the next frame.
    ///
    /// The previous frame is handed back to the driver first, so copy out
    /// anything still needed from it before calling again.
    pub fn capture_frame(&mut self) -> Result<Frame<'_>> {
        self.ensure_open()?;
        let captured = {
            let Self {
                backend,
                pool,
                capture,
                ..
            } = &mut *self;
            let backend = backend.as_mut().ok_or(CameraError::Closed)?;
            let pool = pool.as_mut().ok_or(Misuse::NotStreaming)?;
            capture.capture_index(backend, pool)
        };

        match captured {
            Ok(index) => self.view(index),
            Err(CameraError::Cancelled) => {
                self.close();
                Err(CameraError::Cancelled)
            }
            Err(err) => Err(err),
        }
    }

    /// Hand the current frame back to the driver without capturing another.
    pub fn release_frame(&mut self) -> Result<()> {
        self.ensure_open()?;
        let Self {
            backend,
            pool,
            capture,
            ..
        } = self;
        let backend = backend.as_mut().ok_or(CameraError::Closed)?;
        match pool {
            Some(pool) => capture.release_frame(backend, pool),
            None => Ok(()),
        }
    }

    fn view(&self, index: u32) -> Result<Frame<'_>> {
        self.pool
            .as_ref()
            .ok_or(Misuse::NoFrame)?
            .view(index)
    }

    /// The most recently captured frame, raw.
    pub fn frame_raw(&self) -> Result<Frame<'_>> {
        self.backend()?;
        let index = self.capture.held().ok_or(Misuse::NoFrame)?;
        self.view(index)
    }

    fn stride(&self) -> usize {
        match self.format.bytes_per_line {
            0 => {
                self.format.width as usize
                    * self.format.pixel_format().bytes_per_pixel().unwrap_or(2) as usize
            }
            stride => stride as usize,
        }
    }

    /// The most recently captured frame as packed RGB24.
    pub fn to_rgb(&self) -> Result<Vec<u8>> {
        let frame = self.frame_raw()?;
        Ok(convert::to_rgb24(
            self.format.pixel_format(),
            frame.data,
            self.format.width,
            self.format.height,
            self.stride(),
        )?)
    }

    /// The most recently captured frame as packed RGBA32, alpha 255.
    pub fn to_rgba(&self) -> Result<Vec<u8>> {
        let frame = self.frame_raw()?;
        Ok(convert::to_rgba32(
            self.format.pixel_format(),
            frame.data,
            self.format.width,
            self.format.height,
            self.stride(),
        )?)
    }

    /// Stop streaming, unmap buffers and close the device. Idempotent.
    ///
    /// Cleanup errors are logged, never returned.
    pub fn close(&mut self) {
        self.capture.cancel_token().cancel();
        let Some(mut backend) = self.backend.take() else {
            return;
        };

        if let Some(mut pool) = self.pool.take() {
            if let Err(err) = self.capture.stop(&mut backend, &mut pool) {
                warn!(error = %err, "stream-off during close failed");
            }
            if let Err(err) = pool.release(&mut backend) {
                warn!(error = %err, "buffer release during close failed");
            }
        }

        drop(backend);
        info!(path = %self.path.display(), "device closed");
    }

    #[cfg(test)]
    pub(crate) const fn backend_ref(&self) -> Option<&B> {
        self.backend.as_ref()
    }
}

impl<B: VideoBackend> Drop for Camera<B> {
    fn drop(&mut self) {
        self.close();
    }
}
