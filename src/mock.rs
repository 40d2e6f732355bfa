//! In-memory device simulation for testing without hardware.
//!
//! The mock keeps the kernel side of the streaming contract: a FIFO of queued
//! buffers, a sequence counter and `EBUSY` for format changes while buffers
//! are allocated. Failures can be injected per request.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;

use crate::capture::CancelToken;
use crate::error::{CameraError, Ioctl, Result};
use crate::traits::{
    ControlDescriptor, ControlFlags, ControlKind, DequeuedBuffer, DeviceCapabilities,
    FormatDescription, FormatDescriptor, FourCC, Fraction, FrameIntervals, FrameMetadata,
    FrameSize, MenuItem, Readiness, VideoBackend,
};

/// Sizes the mock reports for YUYV, smallest first.
pub const YUYV_SIZES: [(u32, u32); 5] = [
    (160, 120),
    (320, 240),
    (352, 288),
    (640, 480),
    (1280, 720),
];

/// `V4L2_CID_BRIGHTNESS`
pub const CID_BRIGHTNESS: u32 = 0x0098_0900;
/// `V4L2_CID_POWER_LINE_FREQUENCY`
pub const CID_POWER_LINE_FREQUENCY: u32 = 0x0098_0918;

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Mock device for testing without hardware.
#[derive(Debug)]
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: FormatDescriptor,
    interval: Fraction,
    pattern: TestPattern,
    controls: Vec<(ControlDescriptor, i64)>,
    buffer_limit: Option<u32>,
    granted: u32,
    mapped: u32,
    buffer_requests: u32,
    kernel_queue: VecDeque<u32>,
    streaming: bool,
    stalled: bool,
    sequence: u32,
    transient_errors: u32,
    corrupt_next: bool,
    failures: RefCell<HashMap<Ioctl, i32>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device streaming 640x480 YUYV color bars.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: FormatDescriptor::packed(640, 480, FourCC::YUYV),
            interval: Fraction::new(1, 30),
            pattern: TestPattern::ColorBars,
            controls: default_controls(),
            buffer_limit: None,
            granted: 0,
            mapped: 0,
            buffer_requests: 0,
            kernel_queue: VecDeque::new(),
            streaming: false,
            stalled: false,
            sequence: 0,
            transient_errors: 0,
            corrupt_next: false,
            failures: RefCell::new(HashMap::new()),
        }
    }

    /// Set the current format.
    #[must_use]
    pub fn with_format(mut self, format: FormatDescriptor) -> Self {
        self.format = format;
        self
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the test pattern written into mapped buffers.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Grant at most `limit` buffers per request.
    #[must_use]
    pub const fn with_buffer_limit(mut self, limit: u32) -> Self {
        self.buffer_limit = Some(limit);
        self
    }

    /// Report try-again for the next `count` dequeues.
    #[must_use]
    pub const fn with_transient_errors(mut self, count: u32) -> Self {
        self.transient_errors = count;
        self
    }

    /// Never complete a frame.
    #[must_use]
    pub const fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Fail the next `ioctl` with `errno`.
    pub fn fail_next(&self, ioctl: Ioctl, errno: i32) {
        self.failures.borrow_mut().insert(ioctl, errno);
    }

    /// Flag the next completed buffer as corrupted.
    pub fn corrupt_next(&mut self) {
        self.corrupt_next = true;
    }

    /// Buffers currently allocated in the simulated driver.
    pub const fn granted(&self) -> u32 {
        self.granted
    }

    /// Buffers mapped since the last allocation.
    pub const fn mapped_count(&self) -> u32 {
        self.mapped
    }

    /// Non-zero `VIDIOC_REQBUFS` calls issued so far.
    pub const fn buffer_requests(&self) -> u32 {
        self.buffer_requests
    }

    /// Buffers the simulated driver currently owns, in completion order.
    pub fn kernel_queue(&self) -> Vec<u32> {
        self.kernel_queue.iter().copied().collect()
    }

    /// Whether the simulated driver is streaming.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Turn streaming on directly, bypassing the capture loop.
    pub fn stream_on_for_test(&mut self) {
        self.streaming = true;
    }

    fn check(&self, ioctl: Ioctl) -> Result<()> {
        match self.failures.borrow_mut().remove(&ioctl) {
            Some(errno) => Err(CameraError::ioctl(ioctl, io::Error::from_raw_os_error(errno))),
            None => Ok(()),
        }
    }

    fn errno(ioctl: Ioctl, errno: i32) -> CameraError {
        CameraError::ioctl(ioctl, io::Error::from_raw_os_error(errno))
    }

    fn closest_size(width: u32, height: u32) -> (u32, u32) {
        YUYV_SIZES
            .iter()
            .rev()
            .find(|&&(w, h)| w <= width && h <= height)
            .copied()
            .unwrap_or(YUYV_SIZES[0])
    }
}

fn default_controls() -> Vec<(ControlDescriptor, i64)> {
    vec![
        (
            ControlDescriptor {
                id: CID_BRIGHTNESS,
                name: "Brightness".to_owned(),
                kind: ControlKind::Integer,
                minimum: 0,
                maximum: 255,
                step: 1,
                default: 128,
                flags: ControlFlags {
                    slider: true,
                    ..ControlFlags::default()
                },
                menu: Vec::new(),
            },
            128,
        ),
        (
            ControlDescriptor {
                id: CID_POWER_LINE_FREQUENCY,
                name: "Power Line Frequency".to_owned(),
                kind: ControlKind::Menu,
                minimum: 0,
                maximum: 2,
                step: 1,
                default: 1,
                flags: ControlFlags::default(),
                menu: vec![
                    (0, MenuItem::Name("Disabled".to_owned())),
                    (1, MenuItem::Name("50 Hz".to_owned())),
                    (2, MenuItem::Name("60 Hz".to_owned())),
                ],
            },
            1,
        ),
    ]
}

impl VideoBackend for MockDevice {
    type Mapping = Vec<u8>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn enum_formats(&self) -> Result<Vec<FormatDescription>> {
        self.check(Ioctl::EnumFormats)?;
        Ok(vec![
            FormatDescription {
                fourcc: FourCC::YUYV,
                description: "YUYV 4:2:2".to_owned(),
            },
            FormatDescription {
                fourcc: FourCC::MJPG,
                description: "Motion-JPEG".to_owned(),
            },
        ])
    }

    fn enum_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<FrameSize>> {
        self.check(Ioctl::EnumFrameSizes)?;
        match fourcc {
            FourCC::YUYV => Ok(YUYV_SIZES
                .iter()
                .map(|&(width, height)| FrameSize::Discrete { width, height })
                .collect()),
            FourCC::MJPG => Ok(vec![FrameSize::Stepwise {
                min_width: 640,
                max_width: 1280,
                step_width: 16,
                min_height: 480,
                max_height: 720,
                step_height: 16,
            }]),
            _ => Err(Self::errno(Ioctl::EnumFrameSizes, libc::EINVAL)),
        }
    }

    fn enum_frame_intervals(
        &self,
        fourcc: FourCC,
        _width: u32,
        _height: u32,
    ) -> Result<Vec<FrameIntervals>> {
        self.check(Ioctl::EnumFrameIntervals)?;
        match fourcc {
            FourCC::YUYV => Ok(vec![
                FrameIntervals::Discrete(Fraction::new(1, 30)),
                FrameIntervals::Discrete(Fraction::new(1, 15)),
            ]),
            FourCC::MJPG => Ok(vec![FrameIntervals::Stepwise {
                min: Fraction::new(1, 30),
                max: Fraction::new(1, 10),
                step: Fraction::new(1, 30),
            }]),
            _ => Err(Self::errno(Ioctl::EnumFrameIntervals, libc::EINVAL)),
        }
    }

    fn format(&self) -> Result<FormatDescriptor> {
        self.check(Ioctl::GetFormat)?;
        Ok(self.format.clone())
    }

    fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<FormatDescriptor> {
        self.check(Ioctl::SetFormat)?;
        if self.granted > 0 {
            return Err(Self::errno(Ioctl::SetFormat, libc::EBUSY));
        }
        if fourcc != FourCC::YUYV {
            return Err(Self::errno(Ioctl::SetFormat, libc::EINVAL));
        }
        let (width, height) = Self::closest_size(width, height);
        self.format = FormatDescriptor::packed(width, height, fourcc);
        Ok(self.format.clone())
    }

    fn frame_interval(&self) -> Result<Fraction> {
        self.check(Ioctl::GetParams)?;
        Ok(self.interval)
    }

    fn set_frame_interval(&mut self, interval: Fraction) -> Result<Fraction> {
        self.check(Ioctl::SetParams)?;
        if self.streaming {
            return Err(Self::errno(Ioctl::SetParams, libc::EBUSY));
        }
        // Only 15 and 30 fps exist; anything slower than 1/20 s gets 15 fps.
        self.interval = if u64::from(interval.numerator) * 20 > u64::from(interval.denominator) {
            Fraction::new(1, 15)
        } else {
            Fraction::new(1, 30)
        };
        Ok(self.interval)
    }

    fn controls(&self) -> Result<Vec<ControlDescriptor>> {
        self.check(Ioctl::QueryControls)?;
        Ok(self.controls.iter().map(|(desc, _)| desc.clone()).collect())
    }

    fn control(&self, id: u32) -> Result<i64> {
        self.check(Ioctl::GetControl)?;
        self.controls
            .iter()
            .find(|(desc, _)| desc.id == id)
            .map(|&(_, value)| value)
            .ok_or_else(|| Self::errno(Ioctl::GetControl, libc::EINVAL))
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        self.check(Ioctl::SetControl)?;
        let (desc, current) = self
            .controls
            .iter_mut()
            .find(|(desc, _)| desc.id == id)
            .ok_or_else(|| Self::errno(Ioctl::SetControl, libc::EINVAL))?;
        if value < desc.minimum || value > desc.maximum {
            return Err(Self::errno(Ioctl::SetControl, libc::ERANGE));
        }
        *current = value;
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        self.check(Ioctl::RequestBuffers)?;
        if self.streaming {
            return Err(Self::errno(Ioctl::RequestBuffers, libc::EBUSY));
        }
        self.kernel_queue.clear();
        self.mapped = 0;
        if count == 0 {
            self.granted = 0;
            return Ok(0);
        }
        self.buffer_requests += 1;
        self.granted = self.buffer_limit.map_or(count, |limit| count.min(limit));
        Ok(self.granted)
    }

    fn map_buffer(&mut self, index: u32) -> Result<Vec<u8>> {
        self.check(Ioctl::QueryBuffer)?;
        if index >= self.granted {
            return Err(Self::errno(Ioctl::QueryBuffer, libc::EINVAL));
        }
        self.check(Ioctl::Mmap)?;
        self.mapped += 1;
        Ok(generate_test_frame(&self.format, self.pattern))
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        self.check(Ioctl::QueueBuffer)?;
        if index >= self.granted || self.kernel_queue.contains(&index) {
            return Err(Self::errno(Ioctl::QueueBuffer, libc::EINVAL));
        }
        self.kernel_queue.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        self.check(Ioctl::DequeueBuffer)?;
        if !self.streaming {
            return Err(Self::errno(Ioctl::DequeueBuffer, libc::EINVAL));
        }
        if self.transient_errors > 0 {
            self.transient_errors -= 1;
            return Err(Self::errno(Ioctl::DequeueBuffer, libc::EAGAIN));
        }
        if self.stalled {
            return Err(Self::errno(Ioctl::DequeueBuffer, libc::EAGAIN));
        }
        let index = self
            .kernel_queue
            .pop_front()
            .ok_or_else(|| Self::errno(Ioctl::DequeueBuffer, libc::EAGAIN))?;

        let sequence = self.sequence;
        self.sequence += 1;

        Ok(DequeuedBuffer {
            index,
            metadata: FrameMetadata {
                sequence,
                timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
                bytes_used: self.format.image_size,
            },
            corrupted: std::mem::take(&mut self.corrupt_next),
        })
    }

    fn wait_readable(&self, cancel: &CancelToken) -> Result<Readiness> {
        self.check(Ioctl::Poll)?;
        if cancel.is_cancelled() {
            return Ok(Readiness::Cancelled);
        }
        let ready = !self.streaming
            || self.transient_errors > 0
            || self.failures.borrow().contains_key(&Ioctl::DequeueBuffer)
            || (!self.stalled && !self.kernel_queue.is_empty());
        if ready {
            return Ok(Readiness::Readable);
        }
        cancel
            .wait()
            .map_err(|err| CameraError::ioctl(Ioctl::Poll, err))?;
        Ok(Readiness::Cancelled)
    }

    fn stream_on(&mut self) -> Result<()> {
        self.check(Ioctl::StreamOn)?;
        if self.granted == 0 {
            return Err(Self::errno(Ioctl::StreamOn, libc::EINVAL));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.check(Ioctl::StreamOff)?;
        self.streaming = false;
        self.kernel_queue.clear();
        Ok(())
    }
}

/// Generate test frame data based on pattern.
pub fn generate_test_frame(format: &FormatDescriptor, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; format.image_size as usize];

    match pattern {
        TestPattern::ColorBars => {
            generate_color_bars(&mut data, format.width, format.height);
        }
        TestPattern::Gradient => {
            generate_gradient(&mut data, format.width, format.height);
        }
        TestPattern::Solid(y, u, v) => {
            generate_solid(&mut data, y, u, v);
        }
    }

    data
}

fn write_pair(data: &mut [u8], offset: usize, y: u8, u: u8, v: u8) {
    if let Some(pair) = data.get_mut(offset..offset + 4) {
        pair.copy_from_slice(&[y, u, y, v]);
    }
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let (y_val, u_val, v_val) = bars[(x / bar_width).min(7) as usize];
            write_pair(data, ((y * width + x) * 2) as usize, y_val, u_val, v_val);
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            write_pair(data, ((y * width + x) * 2) as usize, y_val, 128, 128);
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for pair in data.chunks_exact_mut(4) {
        pair.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
    }

    #[test]
    fn test_mock_set_format_snaps_to_supported_size() {
        let mut device = MockDevice::new();
        let applied = device
            .set_format(1000, 700, FourCC::YUYV)
            .expect("set_format should succeed");
        assert_eq!((applied.width, applied.height), (640, 480));
        assert_eq!(device.format().expect("format"), applied);
    }

    #[test]
    fn test_mock_set_format_busy_with_buffers() {
        let mut device = MockDevice::new();
        device.request_buffers(2).expect("reqbufs");
        let err = device
            .set_format(320, 240, FourCC::YUYV)
            .expect_err("S_FMT with buffers allocated");
        assert!(matches!(err, CameraError::FatalIo { ioctl: Ioctl::SetFormat, .. }));
    }

    #[test]
    fn test_mock_kernel_queue_is_fifo() {
        let mut device = MockDevice::new();
        device.request_buffers(3).expect("reqbufs");
        device.queue_buffer(2).expect("qbuf");
        device.queue_buffer(0).expect("qbuf");
        device.stream_on().expect("streamon");
        assert_eq!(device.dequeue_buffer().expect("dqbuf").index, 2);
        assert_eq!(device.dequeue_buffer().expect("dqbuf").index, 0);
        assert!(device.dequeue_buffer().expect_err("empty queue").is_transient());
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let mut device = MockDevice::new();
        device.fail_next(Ioctl::RequestBuffers, libc::ENOMEM);
        assert!(device.request_buffers(2).is_err());
        assert_eq!(device.request_buffers(2).expect("second reqbufs"), 2);
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = FormatDescriptor::packed(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), 640 * 480 * 2);

        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = FormatDescriptor::packed(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = 479 * 640 * 2;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let format = FormatDescriptor::packed(64, 64, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 64, 192));

        assert_eq!(&data[..4], &[128, 64, 128, 192]);
    }
}
