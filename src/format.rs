//! Format enumeration and negotiation.
//!
//! The driver is authoritative: a request for a size is a suggestion and the
//! descriptor it answers with is what gets streamed.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::capture::StreamState;
use crate::error::{CameraError, Misuse, Result};
use crate::traits::{
    FormatDescription, FormatDescriptor, FormatEntry, FourCC, Fraction, FrameIntervals, FrameSize,
    VideoBackend,
};

/// Sizes tried against drivers that report a size range.
pub const CANDIDATE_SIZES: [(u32, u32); 7] = [
    (640, 480),
    (800, 600),
    (1024, 768),
    (1440, 1080),
    (1024, 576),
    (1280, 720),
    (1920, 1080),
];

/// Frame rates tried against drivers that report an interval range.
pub const CANDIDATE_FPS: [u32; 5] = [5, 10, 15, 20, 30];

/// Lazily walks every (format, size, interval) combination of a device.
///
/// Each step issues at most one round of enumeration requests. A fresh
/// iterator from [`list_formats`] restarts from the first format.
pub struct FormatIter<'a, B> {
    backend: &'a B,
    formats: Option<std::vec::IntoIter<FormatDescription>>,
    pending: VecDeque<FormatEntry>,
    done: bool,
}

impl<B: VideoBackend> Iterator for FormatIter<'_, B> {
    type Item = Result<FormatEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            if self.done {
                return None;
            }
            if self.formats.is_none() {
                match self.backend.enum_formats() {
                    Ok(formats) => self.formats = Some(formats.into_iter()),
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
            }
            let Some(description) = self.formats.as_mut().and_then(Iterator::next) else {
                self.done = true;
                return None;
            };
            match expand_format(self.backend, description.fourcc) {
                Ok(entries) => self.pending.extend(entries),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Every supported (format, size, interval) combination.
pub fn list_formats<B: VideoBackend>(backend: &B) -> FormatIter<'_, B> {
    FormatIter {
        backend,
        formats: None,
        pending: VecDeque::new(),
        done: false,
    }
}

fn unsupported_request(err: &CameraError) -> bool {
    match err {
        CameraError::FatalIo { source, .. } => {
            matches!(source.raw_os_error(), Some(libc::EINVAL | libc::ENOTTY))
        }
        _ => false,
    }
}

fn fits(value: u32, min: u32, max: u32, step: u32) -> bool {
    (min..=max).contains(&value) && (value - min) % step.max(1) == 0
}

fn expand_sizes(sizes: &[FrameSize]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    for size in sizes {
        match *size {
            FrameSize::Discrete { width, height } => out.push((width, height)),
            FrameSize::Stepwise {
                min_width,
                max_width,
                step_width,
                min_height,
                max_height,
                step_height,
            } => out.extend(CANDIDATE_SIZES.iter().copied().filter(|&(w, h)| {
                fits(w, min_width, max_width, step_width) && fits(h, min_height, max_height, step_height)
            })),
        }
    }
    out
}

/// `a <= b` for two intervals, without floating point.
fn interval_le(a: Fraction, b: Fraction) -> bool {
    u64::from(a.numerator) * u64::from(b.denominator) <= u64::from(b.numerator) * u64::from(a.denominator)
}

fn expand_intervals(intervals: &[FrameIntervals]) -> Vec<Fraction> {
    let mut out = Vec::new();
    for interval in intervals {
        match *interval {
            FrameIntervals::Discrete(fraction) => out.push(fraction),
            FrameIntervals::Stepwise { min, max, .. } => out.extend(
                CANDIDATE_FPS
                    .iter()
                    .map(|&fps| Fraction::new(1, fps))
                    .filter(|&candidate| interval_le(min, candidate) && interval_le(candidate, max)),
            ),
        }
    }
    out
}

fn expand_format<B: VideoBackend>(backend: &B, fourcc: FourCC) -> Result<Vec<FormatEntry>> {
    let sizes = match backend.enum_frame_sizes(fourcc) {
        Ok(sizes) => sizes,
        Err(err) if unsupported_request(&err) => {
            debug!(%fourcc, "driver does not enumerate frame sizes");
            Vec::new()
        }
        Err(err) => return Err(err),
    };

    let mut entries = Vec::new();
    for (width, height) in expand_sizes(&sizes) {
        let intervals = match backend.enum_frame_intervals(fourcc, width, height) {
            Ok(intervals) => expand_intervals(&intervals),
            Err(err) if unsupported_request(&err) => Vec::new(),
            Err(err) => return Err(err),
        };
        if intervals.is_empty() {
            entries.push(FormatEntry {
                fourcc,
                width,
                height,
                interval: None,
            });
        } else {
            entries.extend(intervals.into_iter().map(|interval| FormatEntry {
                fourcc,
                width,
                height,
                interval: Some(interval),
            }));
        }
    }
    Ok(entries)
}

/// The format the driver is configured with right now.
pub fn current_format<B: VideoBackend>(backend: &B) -> Result<FormatDescriptor> {
    backend.format()
}

fn ensure_idle(state: StreamState) -> Result<()> {
    if state == StreamState::Idle {
        Ok(())
    } else {
        Err(Misuse::FormatWhileStreaming.into())
    }
}

fn rejected<B: VideoBackend>(backend: &B, requested: String) -> CameraError {
    let supported = list_formats(backend).filter_map(Result::ok).collect();
    CameraError::UnsupportedFormat {
        requested,
        supported,
    }
}

/// Ask for `width` x `height` in the current pixel format.
///
/// Returns the descriptor the driver actually applied, which may differ from
/// the request.
pub fn set_format<B: VideoBackend>(
    backend: &mut B,
    state: StreamState,
    width: u32,
    height: u32,
) -> Result<FormatDescriptor> {
    ensure_idle(state)?;
    let requested = format!("{width}x{height}");
    if width == 0 || height == 0 {
        return Err(rejected(backend, requested));
    }

    let current = backend.format()?;
    let applied = match backend.set_format(width, height, current.fourcc) {
        Ok(applied) => applied,
        Err(err) if unsupported_request(&err) => {
            warn!(%requested, fourcc = %current.fourcc, "driver rejected format");
            return Err(rejected(backend, format!("{requested} {}", current.fourcc)));
        }
        Err(err) => return Err(err),
    };

    if applied.fourcc != current.fourcc {
        warn!(from = %current.fourcc, to = %applied.fourcc, "driver changed pixel format");
    }
    info!(
        %requested,
        width = applied.width,
        height = applied.height,
        fourcc = %applied.fourcc,
        stride = applied.bytes_per_line,
        size = applied.image_size,
        "format negotiated"
    );
    Ok(applied)
}

/// The frame interval the driver is configured with right now.
pub fn frame_interval<B: VideoBackend>(backend: &B) -> Result<Fraction> {
    backend.frame_interval()
}

/// Ask for a frame interval. Returns what the driver applied.
pub fn set_frame_interval<B: VideoBackend>(
    backend: &mut B,
    state: StreamState,
    interval: Fraction,
) -> Result<Fraction> {
    ensure_idle(state)?;
    if interval.numerator == 0 || interval.denominator == 0 {
        return Err(rejected(backend, format!("interval {interval}")));
    }
    let applied = match backend.set_frame_interval(interval) {
        Ok(applied) => applied,
        Err(err) if unsupported_request(&err) => {
            return Err(rejected(backend, format!("interval {interval}")));
        }
        Err(err) => return Err(err),
    };
    info!(requested = %interval, applied = %applied, "frame interval negotiated");
    Ok(applied)
}
