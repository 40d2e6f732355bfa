//! Kernel-allocated mmap buffer pool.
//!
//! Every buffer carries an ownership token:
//!
//! ```text
//!   Free ──queue()──> QueuedToKernel ──dequeue()──> FilledReadyForUser
//!     ▲                     │                              │
//!     └──── stream off ─────┘                              │
//!     └───────────────────── release_to_free() ────────────┘
//! ```
//!
//! Memory of a buffer is only reachable through [`BufferPool::view`], which
//! refuses any buffer that is not `FilledReadyForUser`.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{CameraError, Misuse, Result};
use crate::traits::{DequeuedBuffer, Frame, FrameMetadata, VideoBackend};

/// Fewest buffers that still allow double-buffered streaming.
pub const MIN_BUFFERS: u32 = 2;

/// Buffers requested when the caller does not say otherwise.
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Ownership state of one capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Owned by the process, not holding a frame, may be queued.
    Free,
    /// Owned by the kernel, which may write into it at any time.
    QueuedToKernel,
    /// Holds a completed frame the caller may read.
    FilledReadyForUser,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::QueuedToKernel => "queued to kernel",
            Self::FilledReadyForUser => "filled",
        };
        f.write_str(name)
    }
}

struct Buffer<M> {
    mapping: M,
    state: BufferState,
    metadata: FrameMetadata,
}

/// Fixed-size set of mapped capture buffers.
pub struct BufferPool<M> {
    buffers: Vec<Buffer<M>>,
}

impl<M> fmt::Debug for BufferPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("states", &self.states().collect::<Vec<_>>())
            .finish()
    }
}

impl<M: AsRef<[u8]>> BufferPool<M> {
    /// Request `count` buffers from the driver and map each of them.
    ///
    /// Fails with [`CameraError::AllocationFailed`] when the driver grants
    /// fewer than [`MIN_BUFFERS`].
    pub fn allocate<B>(backend: &mut B, count: u32) -> Result<Self>
    where
        B: VideoBackend<Mapping = M>,
    {
        let granted = backend.request_buffers(count)?;
        info!(requested = count, granted, "capture buffers granted");

        if granted < MIN_BUFFERS {
            if granted > 0 {
                if let Err(err) = backend.request_buffers(0) {
                    warn!(error = %err, "failed to free undersized buffer set");
                }
            }
            return Err(CameraError::AllocationFailed {
                requested: count,
                granted,
                required: MIN_BUFFERS,
            });
        }

        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match backend.map_buffer(index) {
                Ok(mapping) => buffers.push(Buffer {
                    mapping,
                    state: BufferState::Free,
                    metadata: FrameMetadata {
                        sequence: 0,
                        timestamp: std::time::Duration::ZERO,
                        bytes_used: 0,
                    },
                }),
                Err(err) => {
                    drop(buffers);
                    if let Err(free_err) = backend.request_buffers(0) {
                        warn!(error = %free_err, "failed to free buffers after mapping error");
                    }
                    return Err(err);
                }
            }
        }

        debug!(
            sizes = ?buffers.iter().map(|buf| buf.mapping.as_ref().len()).collect::<Vec<_>>(),
            "capture buffers mapped"
        );
        Ok(Self { buffers })
    }

    /// Number of buffers in the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn buffer(&self, index: u32) -> Result<&Buffer<M>> {
        self.buffers
            .get(index as usize)
            .ok_or(CameraError::NotStreamable(Misuse::NoSuchBuffer(index)))
    }

    fn buffer_mut(&mut self, index: u32) -> Result<&mut Buffer<M>> {
        self.buffers
            .get_mut(index as usize)
            .ok_or(CameraError::NotStreamable(Misuse::NoSuchBuffer(index)))
    }

    fn transition(&mut self, index: u32, from: BufferState, to: BufferState) -> Result<()> {
        let buffer = self.buffer_mut(index)?;
        if buffer.state != from {
            return Err(Misuse::BufferState {
                index,
                actual: buffer.state,
                expected: from,
            }
            .into());
        }
        buffer.state = to;
        Ok(())
    }

    /// State of one buffer.
    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.buffers.get(index as usize).map(|buf| buf.state)
    }

    /// Number of buffers currently in `state`.
    pub fn count_in(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|buf| buf.state == state).count()
    }

    /// `Free -> QueuedToKernel`, handing the buffer to the driver.
    pub fn queue<B>(&mut self, backend: &mut B, index: u32) -> Result<()>
    where
        B: VideoBackend<Mapping = M>,
    {
        let state = self.buffer(index)?.state;
        if state != BufferState::Free {
            return Err(Misuse::BufferState {
                index,
                actual: state,
                expected: BufferState::Free,
            }
            .into());
        }
        backend.queue_buffer(index)?;
        self.transition(index, BufferState::Free, BufferState::QueuedToKernel)
    }

    /// Take a completed buffer back from the driver without blocking.
    ///
    /// `QueuedToKernel -> FilledReadyForUser`. Reports
    /// [`CameraError::TransientIo`] when nothing has completed yet.
    pub fn dequeue<B>(&mut self, backend: &mut B) -> Result<DequeuedBuffer>
    where
        B: VideoBackend<Mapping = M>,
    {
        let completed = backend.dequeue_buffer()?;
        let index = completed.index;
        self.transition(
            index,
            BufferState::QueuedToKernel,
            BufferState::FilledReadyForUser,
        )?;
        self.buffer_mut(index)?.metadata = completed.metadata.clone();
        Ok(completed)
    }

    /// `FilledReadyForUser -> Free`, once the caller is done reading.
    pub fn release_to_free(&mut self, index: u32) -> Result<()> {
        self.transition(index, BufferState::FilledReadyForUser, BufferState::Free)
    }

    /// Read-only view of a filled buffer.
    pub fn view(&self, index: u32) -> Result<Frame<'_>> {
        let buffer = self.buffer(index)?;
        if buffer.state != BufferState::FilledReadyForUser {
            return Err(Misuse::BufferState {
                index,
                actual: buffer.state,
                expected: BufferState::FilledReadyForUser,
            }
            .into());
        }
        let data = buffer.mapping.as_ref();
        let used = (buffer.metadata.bytes_used as usize).min(data.len());
        Ok(Frame {
            data: data.get(..used).unwrap_or(data),
            metadata: &buffer.metadata,
        })
    }

    /// Stream-off returned every buffer to the process.
    pub fn reset_after_stream_off(&mut self) {
        for buffer in &mut self.buffers {
            buffer.state = BufferState::Free;
        }
    }

    /// Unmap every buffer and free them in the driver.
    ///
    /// Only legal once no buffer is owned by the kernel.
    pub fn release<B>(self, backend: &mut B) -> Result<()>
    where
        B: VideoBackend<Mapping = M>,
    {
        if self.count_in(BufferState::QueuedToKernel) > 0 {
            return Err(Misuse::ReleaseWhileStreaming.into());
        }
        let count = self.buffers.len();
        drop(self.buffers);
        backend.request_buffers(0)?;
        debug!(count, "capture buffers released");
        Ok(())
    }
}

impl<M> BufferPool<M> {
    /// Ownership state of every buffer, by index.
    pub fn states(&self) -> impl Iterator<Item = BufferState> + '_ {
        self.buffers.iter().map(|buf| buf.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Ioctl;
    use crate::mock::MockDevice;

    #[test]
    fn test_allocate_maps_every_granted_buffer() {
        let mut device = MockDevice::new();
        let pool = BufferPool::allocate(&mut device, 4).expect("allocate failed");
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.count_in(BufferState::Free), 4);
        assert_eq!(device.mapped_count(), 4);
    }

    #[test]
    fn test_allocate_rejects_single_buffer_grant() {
        let mut device = MockDevice::new().with_buffer_limit(1);
        let err = BufferPool::allocate(&mut device, 4).expect_err("allocation should fail");
        assert!(matches!(
            err,
            CameraError::AllocationFailed {
                requested: 4,
                granted: 1,
                required: 2
            }
        ));
        assert_eq!(device.granted(), 0, "undersized grant should be freed");
    }

    #[test]
    fn test_allocate_accepts_double_buffering() {
        let mut device = MockDevice::new().with_buffer_limit(2);
        let pool = BufferPool::allocate(&mut device, 4).expect("allocate failed");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_mapping_failure_frees_kernel_buffers() {
        let mut device = MockDevice::new();
        device.fail_next(Ioctl::Mmap, libc::ENOMEM);
        let err = BufferPool::allocate(&mut device, 4).expect_err("allocation should fail");
        assert!(matches!(err, CameraError::FatalIo { ioctl: Ioctl::Mmap, .. }));
        assert_eq!(device.granted(), 0);
    }

    #[test]
    fn test_queue_only_from_free() {
        let mut device = MockDevice::new();
        let mut pool = BufferPool::allocate(&mut device, 4).expect("allocate failed");
        pool.queue(&mut device, 0).expect("queue failed");
        assert_eq!(pool.state(0), Some(BufferState::QueuedToKernel));

        let err = pool.queue(&mut device, 0).expect_err("double queue accepted");
        assert!(matches!(
            err,
            CameraError::NotStreamable(Misuse::BufferState {
                index: 0,
                actual: BufferState::QueuedToKernel,
                expected: BufferState::Free
            })
        ));
    }

    #[test]
    fn test_queued_buffer_cannot_be_viewed() {
        let mut device = MockDevice::new();
        let mut pool = BufferPool::allocate(&mut device, 2).expect("allocate failed");
        assert!(pool.view(0).is_err(), "free buffer must not be readable");
        pool.queue(&mut device, 0).expect("queue failed");
        assert!(pool.view(0).is_err(), "queued buffer must not be readable");
    }

    #[test]
    fn test_dequeue_fills_and_release_frees() {
        let mut device = MockDevice::new();
        let mut pool = BufferPool::allocate(&mut device, 2).expect("allocate failed");
        pool.queue(&mut device, 0).expect("queue failed");
        pool.queue(&mut device, 1).expect("queue failed");
        device.stream_on_for_test();

        let completed = pool.dequeue(&mut device).expect("dequeue failed");
        assert_eq!(completed.index, 0, "kernel completes in FIFO order");
        assert_eq!(pool.state(0), Some(BufferState::FilledReadyForUser));

        let frame = pool.view(0).expect("view failed");
        assert_eq!(frame.data.len(), 640 * 480 * 2);
        assert_eq!(frame.metadata.sequence, completed.metadata.sequence);

        pool.release_to_free(0).expect("release failed");
        assert_eq!(pool.state(0), Some(BufferState::Free));
        assert!(pool.release_to_free(0).is_err(), "double release accepted");
    }

    #[test]
    fn test_out_of_range_index() {
        let mut device = MockDevice::new();
        let pool = BufferPool::allocate(&mut device, 2).expect("allocate failed");
        assert!(matches!(
            pool.view(7),
            Err(CameraError::NotStreamable(Misuse::NoSuchBuffer(7)))
        ));
    }

    #[test]
    fn test_release_refused_while_kernel_owns_buffers() {
        let mut device = MockDevice::new();
        let mut pool = BufferPool::allocate(&mut device, 2).expect("allocate failed");
        pool.queue(&mut device, 1).expect("queue failed");
        let err = pool.release(&mut device).expect_err("release accepted");
        assert!(matches!(
            err,
            CameraError::NotStreamable(Misuse::ReleaseWhileStreaming)
        ));
    }

    #[test]
    fn test_release_frees_driver_buffers() {
        let mut device = MockDevice::new();
        let pool = BufferPool::allocate(&mut device, 4).expect("allocate failed");
        pool.release(&mut device).expect("release failed");
        assert_eq!(device.granted(), 0);
    }
}
