//! V4L2 device implementation using the v4l crate.
//!
//! Negotiation and controls go through the `v4l` high-level API. The
//! streaming requests go through [`crate::sys`] so that buffer ownership
//! stays with [`crate::buffer::BufferPool`].

use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use v4l::control::{self, Control, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::capture::CancelToken;
use crate::error::{CameraError, Ioctl, OpenFailure, Result};
use crate::sys::{self, MappedRegion, Wake};
use crate::traits::{
    ControlDescriptor, ControlFlags, ControlKind, DequeuedBuffer, DeviceCapabilities,
    FormatDescription, FormatDescriptor, FourCC, Fraction, FrameIntervals, FrameMetadata,
    FrameSize, MenuItem, Readiness, VideoBackend,
};

/// V4L2 capture device opened from a device node.
pub struct V4l2Device {
    device: Device,
    fd: RawFd,
    path: PathBuf,
    capabilities: DeviceCapabilities,
}

impl std::fmt::Debug for V4l2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Device")
            .field("path", &self.path)
            .field("fd", &self.fd)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

fn io_err(ioctl: Ioctl) -> impl FnOnce(io::Error) -> CameraError {
    move |err| CameraError::ioctl(ioctl, err)
}

impl V4l2Device {
    /// Open a device node (e.g. `/dev/video0`) and check that it can stream
    /// video capture.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let failed = |reason| CameraError::DeviceOpenFailed {
            path: path.clone(),
            reason,
        };

        let device = Device::with_path(&path).map_err(|err| failed(OpenFailure::from_io(err)))?;
        let caps = device
            .query_caps()
            .map_err(|err| failed(OpenFailure::from_io(err)))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        if let Some(gap) = capabilities.streaming_capture_gap() {
            return Err(failed(OpenFailure::NotAV4l2Device(gap)));
        }

        let fd = device.handle().fd();
        info!(
            path = %path.display(),
            driver = %capabilities.driver,
            card = %capabilities.card,
            bus = %capabilities.bus_info,
            "device opened"
        );

        Ok(Self {
            device,
            fd,
            path,
            capabilities,
        })
    }

    /// Path of the device node.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn descriptor(fmt: &v4l::Format) -> FormatDescriptor {
    FormatDescriptor {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        bytes_per_line: fmt.stride,
        image_size: fmt.size,
    }
}

fn fraction(f: v4l::fraction::Fraction) -> Fraction {
    Fraction::new(f.numerator, f.denominator)
}

fn control_kind(typ: control::Type) -> ControlKind {
    match typ {
        control::Type::Integer | control::Type::U8 | control::Type::U16 | control::Type::U32 => {
            ControlKind::Integer
        }
        control::Type::Boolean => ControlKind::Boolean,
        control::Type::Menu => ControlKind::Menu,
        control::Type::Button => ControlKind::Button,
        control::Type::Integer64 => ControlKind::Integer64,
        control::Type::String => ControlKind::String,
        control::Type::Bitmask => ControlKind::Bitmask,
        control::Type::IntegerMenu => ControlKind::IntegerMenu,
        _ => ControlKind::Other,
    }
}

fn control_flags(flags: control::Flags) -> ControlFlags {
    ControlFlags {
        disabled: flags.contains(control::Flags::DISABLED),
        grabbed: flags.contains(control::Flags::GRABBED),
        read_only: flags.contains(control::Flags::READ_ONLY),
        update: flags.contains(control::Flags::UPDATE),
        inactive: flags.contains(control::Flags::INACTIVE),
        slider: flags.contains(control::Flags::SLIDER),
        write_only: flags.contains(control::Flags::WRITE_ONLY),
        volatile: flags.contains(control::Flags::VOLATILE),
    }
}

fn menu_item(item: control::MenuItem) -> MenuItem {
    match item {
        control::MenuItem::Name(name) => MenuItem::Name(name),
        control::MenuItem::Value(value) => MenuItem::Value(value),
    }
}

impl VideoBackend for V4l2Device {
    type Mapping = MappedRegion;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn enum_formats(&self) -> Result<Vec<FormatDescription>> {
        let formats = self.device.enum_formats().map_err(io_err(Ioctl::EnumFormats))?;
        Ok(formats
            .into_iter()
            .map(|desc| FormatDescription {
                fourcc: FourCC::from(desc.fourcc),
                description: desc.description,
            })
            .collect())
    }

    fn enum_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<FrameSize>> {
        let sizes = self
            .device
            .enum_framesizes(fourcc.into())
            .map_err(io_err(Ioctl::EnumFrameSizes))?;
        Ok(sizes
            .into_iter()
            .map(|size| match size.size {
                FrameSizeEnum::Discrete(d) => FrameSize::Discrete {
                    width: d.width,
                    height: d.height,
                },
                FrameSizeEnum::Stepwise(s) => FrameSize::Stepwise {
                    min_width: s.min_width,
                    max_width: s.max_width,
                    step_width: s.step_width,
                    min_height: s.min_height,
                    max_height: s.max_height,
                    step_height: s.step_height,
                },
            })
            .collect())
    }

    fn enum_frame_intervals(
        &self,
        fourcc: FourCC,
        width: u32,
        height: u32,
    ) -> Result<Vec<FrameIntervals>> {
        let intervals = self
            .device
            .enum_frameintervals(fourcc.into(), width, height)
            .map_err(io_err(Ioctl::EnumFrameIntervals))?;
        Ok(intervals
            .into_iter()
            .map(|interval| match interval.interval {
                FrameIntervalEnum::Discrete(f) => FrameIntervals::Discrete(fraction(f)),
                FrameIntervalEnum::Stepwise(s) => FrameIntervals::Stepwise {
                    min: fraction(s.min),
                    max: fraction(s.max),
                    step: fraction(s.step),
                },
            })
            .collect())
    }

    fn format(&self) -> Result<FormatDescriptor> {
        let fmt = self.device.format().map_err(io_err(Ioctl::GetFormat))?;
        Ok(descriptor(&fmt))
    }

    fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<FormatDescriptor> {
        let mut fmt = self.device.format().map_err(io_err(Ioctl::GetFormat))?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(io_err(Ioctl::SetFormat))?;
        Ok(descriptor(&fmt))
    }

    fn frame_interval(&self) -> Result<Fraction> {
        let params = self.device.params().map_err(io_err(Ioctl::GetParams))?;
        Ok(fraction(params.interval))
    }

    fn set_frame_interval(&mut self, interval: Fraction) -> Result<Fraction> {
        let requested = Parameters::new(v4l::fraction::Fraction::new(
            interval.numerator,
            interval.denominator,
        ));
        let applied = self
            .device
            .set_params(&requested)
            .map_err(io_err(Ioctl::SetParams))?;
        Ok(fraction(applied.interval))
    }

    fn controls(&self) -> Result<Vec<ControlDescriptor>> {
        let descriptions = self
            .device
            .query_controls()
            .map_err(io_err(Ioctl::QueryControls))?;
        Ok(descriptions
            .into_iter()
            .map(|desc| ControlDescriptor {
                id: desc.id,
                name: desc.name,
                kind: control_kind(desc.typ),
                minimum: desc.minimum,
                maximum: desc.maximum,
                step: desc.step,
                default: desc.default,
                flags: control_flags(desc.flags),
                menu: desc
                    .items
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(index, item)| (index, menu_item(item)))
                    .collect(),
            })
            .collect())
    }

    fn control(&self, id: u32) -> Result<i64> {
        let ctrl = self.device.control(id).map_err(io_err(Ioctl::GetControl))?;
        match ctrl.value {
            Value::Integer(value) => Ok(value),
            Value::Boolean(value) => Ok(i64::from(value)),
            _ => Err(CameraError::FatalIo {
                ioctl: Ioctl::GetControl,
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("control {id:#x} is not an integer control"),
                ),
            }),
        }
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(io_err(Ioctl::SetControl))?;
        debug!(id = format_args!("{id:#x}"), value, "control set");
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        sys::request_buffers(self.fd, count).map_err(io_err(Ioctl::RequestBuffers))
    }

    fn map_buffer(&mut self, index: u32) -> Result<MappedRegion> {
        let (offset, len) =
            sys::query_buffer(self.fd, index).map_err(io_err(Ioctl::QueryBuffer))?;
        MappedRegion::map(self.fd, offset, len).map_err(io_err(Ioctl::Mmap))
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        sys::queue_buffer(self.fd, index).map_err(io_err(Ioctl::QueueBuffer))
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        let raw = sys::dequeue_buffer(self.fd).map_err(io_err(Ioctl::DequeueBuffer))?;
        Ok(DequeuedBuffer {
            index: raw.index,
            metadata: FrameMetadata {
                sequence: raw.sequence,
                timestamp: raw.timestamp,
                bytes_used: raw.bytes_used,
            },
            corrupted: raw.corrupted,
        })
    }

    fn wait_readable(&self, cancel: &CancelToken) -> Result<Readiness> {
        match sys::wait_readable(Some(self.fd), cancel.wake_fd()).map_err(io_err(Ioctl::Poll))? {
            Wake::Device => Ok(Readiness::Readable),
            Wake::Cancel => Ok(Readiness::Cancelled),
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        sys::stream_on(self.fd).map_err(io_err(Ioctl::StreamOn))
    }

    fn stream_off(&mut self) -> Result<()> {
        sys::stream_off(self.fd).map_err(io_err(Ioctl::StreamOff))
    }
}
