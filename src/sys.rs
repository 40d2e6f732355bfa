//! Raw streaming ioctls and buffer mappings.
//!
//! This is the only module that touches kernel memory directly. Structures
//! come from the bindings shipped with the `v4l` crate; request codes are
//! derived from their sizes the same way `<linux/videodev2.h>` does.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::slice;
use std::time::Duration;

use tracing::warn;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_MEMORY_MMAP: u32 = 1;
const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((b'V' as libc::c_ulong) << 8) | nr
}

const VIDIOC_REQBUFS: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 8, mem::size_of::<v4l2_requestbuffers>());
const VIDIOC_QUERYBUF: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 9, mem::size_of::<v4l2_buffer>());
const VIDIOC_QBUF: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 15, mem::size_of::<v4l2_buffer>());
const VIDIOC_DQBUF: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 17, mem::size_of::<v4l2_buffer>());
const VIDIOC_STREAMON: libc::c_ulong = ioc(IOC_WRITE, 18, mem::size_of::<libc::c_int>());
const VIDIOC_STREAMOFF: libc::c_ulong = ioc(IOC_WRITE, 19, mem::size_of::<libc::c_int>());

/// `EINTR` retries before giving up on a request.
const MAX_INTERRUPTS: usize = 100;

/// Issue `request` with `arg`, retrying while interrupted by signals.
///
/// # Safety
///
/// `T` must be the structure `request` reads and writes.
unsafe fn xioctl<T>(fd: RawFd, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
    let mut interrupts = 0;
    loop {
        let ret = libc::ioctl(fd, request as _, ptr::from_mut(arg).cast::<libc::c_void>());
        if ret != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted && interrupts < MAX_INTERRUPTS {
            interrupts += 1;
            continue;
        }
        return Err(err);
    }
}

fn zeroed_buffer(index: u32) -> v4l2_buffer {
    // SAFETY: v4l2_buffer is a plain C struct for which all-zero is valid.
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    buf.memory = V4L2_MEMORY_MMAP;
    buf
}

/// `VIDIOC_REQBUFS`: returns how many buffers the driver granted.
pub fn request_buffers(fd: RawFd, count: u32) -> io::Result<u32> {
    // SAFETY: plain C struct, all-zero is valid.
    let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
    req.count = count;
    req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
    req.memory = V4L2_MEMORY_MMAP;
    // SAFETY: VIDIOC_REQBUFS takes a v4l2_requestbuffers.
    unsafe { xioctl(fd, VIDIOC_REQBUFS, &mut req)? };
    Ok(req.count)
}

/// `VIDIOC_QUERYBUF`: returns the mmap offset and length of a buffer.
pub fn query_buffer(fd: RawFd, index: u32) -> io::Result<(u32, usize)> {
    let mut buf = zeroed_buffer(index);
    // SAFETY: VIDIOC_QUERYBUF takes a v4l2_buffer.
    unsafe { xioctl(fd, VIDIOC_QUERYBUF, &mut buf)? };
    // SAFETY: for V4L2_MEMORY_MMAP the kernel fills the `offset` member.
    let offset = unsafe { buf.m.offset };
    Ok((offset, buf.length as usize))
}

/// A capture buffer mapped into process memory, unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain shared memory; access is serialized by the
// owning buffer pool.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of the buffer at `offset`.
    pub fn map(fd: RawFd, offset: u32, len: usize) -> io::Result<Self> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mmap offset out of range"))?;
        // SAFETY: a fresh shared mapping of the device; the kernel validates
        // offset and length.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self { ptr, len })
    }
}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: the mapping is live for `len` bytes until drop. The pool only
        // hands out views of buffers the kernel has returned.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region returned by mmap.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            warn!(error = %io::Error::last_os_error(), len = self.len, "munmap failed");
        }
    }
}

/// `VIDIOC_QBUF`
pub fn queue_buffer(fd: RawFd, index: u32) -> io::Result<()> {
    let mut buf = zeroed_buffer(index);
    // SAFETY: VIDIOC_QBUF takes a v4l2_buffer.
    unsafe { xioctl(fd, VIDIOC_QBUF, &mut buf) }
}

/// Fields of a dequeued `v4l2_buffer`.
#[derive(Debug, Clone, Copy)]
pub struct RawDequeue {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Duration,
    pub corrupted: bool,
}

/// `VIDIOC_DQBUF`; `WouldBlock` when nothing has completed yet.
pub fn dequeue_buffer(fd: RawFd) -> io::Result<RawDequeue> {
    let mut buf = zeroed_buffer(0);
    // SAFETY: VIDIOC_DQBUF takes a v4l2_buffer.
    unsafe { xioctl(fd, VIDIOC_DQBUF, &mut buf)? };

    // V4L2 timestamps are non-negative in practice
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation, clippy::unnecessary_cast)]
    let timestamp = Duration::new(
        (buf.timestamp.tv_sec as i64).max(0) as u64,
        ((buf.timestamp.tv_usec as i64).max(0) as u32).saturating_mul(1000),
    );

    Ok(RawDequeue {
        index: buf.index,
        bytes_used: buf.bytesused,
        sequence: buf.sequence,
        timestamp,
        corrupted: buf.flags & V4L2_BUF_FLAG_ERROR != 0,
    })
}

fn stream_request(fd: RawFd, request: libc::c_ulong) -> io::Result<()> {
    #[allow(clippy::cast_possible_wrap)]
    let mut buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
    // SAFETY: VIDIOC_STREAMON/OFF take an int buffer type.
    unsafe { xioctl(fd, request, &mut buf_type) }
}

/// `VIDIOC_STREAMON`
pub fn stream_on(fd: RawFd) -> io::Result<()> {
    stream_request(fd, VIDIOC_STREAMON)
}

/// `VIDIOC_STREAMOFF`
pub fn stream_off(fd: RawFd) -> io::Result<()> {
    stream_request(fd, VIDIOC_STREAMOFF)
}

/// Which descriptor woke a [`wait_readable`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Device,
    Cancel,
}

/// Block until `device` is readable or `cancel` is readable.
///
/// `device` may be `None` to wait for cancellation alone. The cancel
/// descriptor wins when both are ready.
pub fn wait_readable(device: Option<RawFd>, cancel: RawFd) -> io::Result<Wake> {
    let mut fds = [
        libc::pollfd {
            fd: cancel,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: device.unwrap_or(-1),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        // SAFETY: `fds` is a live array of two pollfd entries; negative fds are ignored.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        let [cancel_fd, device_fd] = fds;
        if cancel_fd.revents != 0 {
            return Ok(Wake::Cancel);
        }
        // POLLERR/POLLHUP included: the following dequeue reports the errno.
        if device_fd.revents != 0 {
            return Ok(Wake::Device);
        }
    }
}
