//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use crate::lock::{DeviceLock, LockError};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture size. Drivers may negotiate something else.
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

const STREAM_BUFFERS: u32 = 4;

/// Longest wait for one buffer before `capture` returns [`CameraError::Timeout`].
pub const CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Convert(#[from] FrameError),
    #[error("end of stream")]
    EndOfStream,
    /// No frame arrived in time. The source is still usable.
    #[error("no frame within {0:?}")]
    Timeout(Duration),
}

impl CameraError {
    fn from_open(path: &str, source: std::io::Error) -> Self {
        match source.kind() {
            ErrorKind::NotFound => CameraError::DeviceNotFound(format!("{path}: {source}")),
            _ if source.raw_os_error() == Some(libc::EBUSY) => {
                CameraError::DeviceBusy(path.to_string())
            }
            _ => CameraError::Open {
                path: path.to_string(),
                source,
            },
        }
    }
}

impl From<LockError> for CameraError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy(path) => CameraError::DeviceBusy(path.display().to_string()),
            LockError::Io { path, source } => {
                CameraError::from_open(&path.display().to_string(), source)
            }
        }
    }
}

/// Anything that yields RGB frames one at a time.
///
/// An `Err` means the source can produce no more frames and callers do not
/// retry, except [`CameraError::Timeout`], after which `capture` may be
/// called again.
pub trait FrameSource {
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
    /// Packed RGB24.
    Rgb24,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"RGB3" => Some(Self::Rgb24),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// Exclusively held V4L2 camera.
///
/// Opening takes a non-blocking lock on the device node; dropping the camera
/// stops streaming and releases it.
pub struct Camera {
    // Drop order: the stream must go before the device and the lock.
    stream: MmapStream<'static>,
    _device: Device,
    _lock: DeviceLock,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let path = Path::new(device_path);
        if !path.exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let lock = DeviceLock::acquire(path)?;

        let device =
            Device::with_path(device_path).map_err(|e| CameraError::from_open(device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; many webcams answer with MJPG at this size instead.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = DEFAULT_WIDTH;
        fmt.height = DEFAULT_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, RGB3 or GREY)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;
        stream.set_timeout(CAPTURE_TIMEOUT);

        Ok(Self {
            stream,
            _device: device,
            _lock: lock,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Convert a raw buffer to packed RGB based on the negotiated format.
    fn buf_to_rgb(&self, buf: &[u8]) -> Result<(Vec<u8>, u32, u32), CameraError> {
        let (w, h) = (self.width, self.height);
        match self.pixel_format {
            PixelFormat::Yuyv => Ok((frame::yuyv_to_rgb(buf, w, h)?, w, h)),
            PixelFormat::Grey => Ok((frame::gray_to_rgb(buf, w, h)?, w, h)),
            PixelFormat::Mjpeg => Ok(frame::mjpeg_to_rgb(buf)?),
            PixelFormat::Rgb24 => {
                let expected = (w * h * 3) as usize;
                if buf.len() < expected {
                    return Err(FrameError::InvalidLength {
                        format: "RGB3",
                        expected,
                        actual: buf.len(),
                    }
                    .into());
                }
                Ok((buf[..expected].to_vec(), w, h))
            }
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        // Copy out before the buffer is requeued on the next call.
        let next = self
            .stream
            .next()
            .map(|(buf, meta)| (buf.to_vec(), meta.sequence));
        let (raw, sequence) = match next {
            Ok(dequeued) => dequeued,
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                // Buffers stay queued after a timed-out dequeue; stopping the
                // stream reclaims them so the next call starts it afresh.
                self.stream.stop().map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to restart stream: {e}"))
                })?;
                tracing::debug!(device = %self.device_path, "capture timed out");
                return Err(CameraError::Timeout(CAPTURE_TIMEOUT));
            }
            Err(e) => {
                return Err(CameraError::CaptureFailed(format!(
                    "failed to dequeue buffer: {e}"
                )))
            }
        };
        let (rgb, width, height) = self.buf_to_rgb(&raw)?;
        Ok(Frame::new(rgb, width, height, sequence))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}
