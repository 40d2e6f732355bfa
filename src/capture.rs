//! Streaming state machine and the blocking capture loop.
//!
//! A captured frame stays `FilledReadyForUser` until the next capture,
//! which requeues it before waiting for the following one. The returned
//! [`Frame`] borrows the pool mutably, so it cannot outlive that requeue.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::buffer::{BufferPool, BufferState};
use crate::error::{CameraError, Ioctl, Misuse, Result};
use crate::sys;
use crate::traits::{Frame, Readiness, VideoBackend};

/// Try-again reports tolerated per capture before giving up.
pub const DEFAULT_TRANSIENT_RETRIES: u32 = 32;

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: UnixStream,
    wake: UnixStream,
}

/// One-shot cancellation signal that also wakes a blocked `poll(2)`.
///
/// Clones share the same signal. Once fired it stays fired.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Create an unfired token.
    pub fn new() -> io::Result<Self> {
        let (notify, wake) = UnixStream::pair()?;
        notify.set_nonblocking(true)?;
        wake.set_nonblocking(true)?;
        Ok(Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify,
                wake,
            }),
        })
    }

    /// Fire the token. Later calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = (&self.inner.notify).write_all(&[1]) {
            warn!(error = %err, "failed to wake cancelled waiters");
        }
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Descriptor that becomes readable once the token fires.
    pub(crate) fn wake_fd(&self) -> RawFd {
        self.inner.wake.as_raw_fd()
    }

    /// Block until the token fires.
    pub fn wait(&self) -> io::Result<()> {
        while !self.is_cancelled() {
            sys::wait_readable(None, self.wake_fd())?;
        }
        Ok(())
    }
}

/// Streaming state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Not streaming; format and buffers may change.
    Idle,
    /// Buffers are cycling through the driver.
    Streaming,
    /// Stream-off in progress.
    Stopping,
    /// The device reported a disconnect; only `stop` is accepted.
    Failed,
}

/// Drives buffers between the pool and the driver.
#[derive(Debug)]
pub struct CaptureLoop {
    state: StreamState,
    held: Option<u32>,
    transient_retries: u32,
    cancel: CancelToken,
}

impl CaptureLoop {
    /// Create an idle loop that aborts waits when `cancel` fires.
    pub const fn new(cancel: CancelToken) -> Self {
        Self {
            state: StreamState::Idle,
            held: None,
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
            cancel,
        }
    }

    /// Override how many try-again reports one capture tolerates.
    #[must_use]
    pub const fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    pub(crate) fn set_transient_retries(&mut self, retries: u32) {
        self.transient_retries = retries;
    }

    /// Current streaming state.
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Index of the buffer currently lent to the caller.
    pub const fn held(&self) -> Option<u32> {
        self.held
    }

    /// The cancellation token waits observe.
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Queue every free buffer and turn streaming on.
    pub fn start<B: VideoBackend>(
        &mut self,
        backend: &mut B,
        pool: &mut BufferPool<B::Mapping>,
    ) -> Result<()> {
        if self.state != StreamState::Idle {
            return Err(Misuse::AlreadyStreaming.into());
        }

        let result = Self::prime(backend, pool);
        if let Err(err) = result {
            if let Err(off_err) = backend.stream_off() {
                debug!(error = %off_err, "stream-off after failed start");
            }
            pool.reset_after_stream_off();
            return Err(err);
        }

        self.state = StreamState::Streaming;
        info!(buffers = pool.len(), "streaming started");
        Ok(())
    }

    fn prime<B: VideoBackend>(backend: &mut B, pool: &mut BufferPool<B::Mapping>) -> Result<()> {
        let count = u32::try_from(pool.len()).unwrap_or(u32::MAX);
        for index in 0..count {
            if pool.state(index) == Some(BufferState::Free) {
                pool.queue(backend, index)?;
            }
        }
        backend.stream_on()
    }

    fn ensure_streaming(&self) -> Result<()> {
        match self.state {
            StreamState::Streaming => Ok(()),
            StreamState::Failed => Err(Misuse::StreamFailed.into()),
            StreamState::Idle | StreamState::Stopping => Err(Misuse::NotStreaming.into()),
        }
    }

    /// Requeue the held frame, then block for the next one.
    ///
    /// Returns the index of the filled buffer, now held by the caller.
    pub fn capture_index<B: VideoBackend>(
        &mut self,
        backend: &mut B,
        pool: &mut BufferPool<B::Mapping>,
    ) -> Result<u32> {
        self.ensure_streaming()?;
        if self.cancel.is_cancelled() {
            return Err(CameraError::Cancelled);
        }

        self.requeue_held(backend, pool)?;

        let completed = self.next_completed(backend, pool)?;
        let index = completed.index;

        if completed.corrupted {
            warn!(
                index,
                sequence = completed.metadata.sequence,
                "driver flagged buffer as corrupted"
            );
            pool.release_to_free(index)?;
            self.queue(backend, pool, index)?;
            return Err(CameraError::FatalIo {
                ioctl: Ioctl::DequeueBuffer,
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "buffer {index} (sequence {}) flagged as corrupted",
                        completed.metadata.sequence
                    ),
                ),
            });
        }

        trace!(
            index,
            sequence = completed.metadata.sequence,
            bytes = completed.metadata.bytes_used,
            "frame captured"
        );
        self.held = Some(index);
        Ok(index)
    }

    /// Requeue the held frame, then block for the next one and view it.
    pub fn capture_frame<'p, B: VideoBackend>(
        &mut self,
        backend: &mut B,
        pool: &'p mut BufferPool<B::Mapping>,
    ) -> Result<Frame<'p>> {
        let index = self.capture_index(backend, pool)?;
        pool.view(index)
    }

    /// Hand the held frame back to the driver early.
    pub fn release_frame<B: VideoBackend>(
        &mut self,
        backend: &mut B,
        pool: &mut BufferPool<B::Mapping>,
    ) -> Result<()> {
        if self.held.is_none() {
            return Ok(());
        }
        self.ensure_streaming()?;
        self.requeue_held(backend, pool)
    }

    /// Hand the held buffer back and queue every buffer left `Free`,
    /// including ones a failed earlier queue attempt stranded.
    fn requeue_held<B: VideoBackend>(
        &mut self,
        backend: &mut B,
        pool: &mut BufferPool<B::Mapping>,
    ) -> Result<()> {
        if let Some(index) = self.held.take() {
            pool.release_to_free(index)?;
        }

        let count = u32::try_from(pool.len()).unwrap_or(u32::MAX);
        for index in 0..count {
            if pool.state(index) == Some(BufferState::Free) {
                self.queue(backend, pool, index)?;
            }
        }
        Ok(())
    }

    fn queue<B: VideoBackend>(
        &mut self,
        backend: &mut B,
        pool: &mut BufferPool<B::Mapping>,
        index: u32,
    ) -> Result<()> {
        pool.queue(backend, index).inspect_err(|err| self.note_failure(err))
    }

    fn next_completed<B: VideoBackend>(
        &mut self,
        backend: &mut B,
        pool: &mut BufferPool<B::Mapping>,
    ) -> Result<crate::traits::DequeuedBuffer> {
        let mut transient = 0;
        loop {
            match backend.wait_readable(&self.cancel) {
                Ok(Readiness::Readable) => {}
                Ok(Readiness::Cancelled) => {
                    debug!("capture cancelled while waiting");
                    return Err(CameraError::Cancelled);
                }
                Err(err) => {
                    self.note_failure(&err);
                    return Err(err);
                }
            }

            match pool.dequeue(backend) {
                Ok(completed) => return Ok(completed),
                Err(err) if err.is_transient() => {
                    transient += 1;
                    if transient > self.transient_retries {
                        warn!(retries = self.transient_retries, "driver kept reporting try-again");
                        return Err(err);
                    }
                    trace!(attempt = transient, "dequeue reported try-again");
                }
                Err(err) => {
                    self.note_failure(&err);
                    return Err(err);
                }
            }
        }
    }

    fn note_failure(&mut self, err: &CameraError) {
        if err.is_disconnect() {
            warn!(error = %err, "device disconnected, stream failed");
            self.state = StreamState::Failed;
        }
    }

    /// Turn streaming off and reclaim every buffer. Idempotent.
    pub fn stop<B: VideoBackend>(
        &mut self,
        backend: &mut B,
        pool: &mut BufferPool<B::Mapping>,
    ) -> Result<()> {
        if self.state == StreamState::Idle {
            debug!("stop on idle stream");
            return Ok(());
        }

        self.state = StreamState::Stopping;
        self.held = None;

        match backend.stream_off() {
            Ok(()) => {
                pool.reset_after_stream_off();
                self.state = StreamState::Idle;
                info!("streaming stopped");
                Ok(())
            }
            Err(err) if err.is_disconnect() => {
                warn!(error = %err, "stream-off on a vanished device");
                pool.reset_after_stream_off();
                self.state = StreamState::Idle;
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "stream-off failed");
                self.state = StreamState::Failed;
                Err(err)
            }
        }
    }
}
