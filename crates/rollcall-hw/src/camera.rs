//! V4L2 camera capture via the `v4l` crate.
//!
//! A [`Camera`] negotiates the device format; [`CameraStream`] owns the camera
//! together with its mmap buffer stream so a capture loop can pull frames
//! continuously. Every read is bounded by a poll timeout so a wedged device
//! surfaces as [`CameraError::ReadTimeout`] instead of blocking forever.

use crate::frame::{self, Frame};
use ouroboros::self_referencing;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no frame within {0:?}")]
    ReadTimeout(Duration),
}

/// Anything that yields grayscale frames one at a time.
///
/// The capture loop only ever talks to this trait, so a device stream and a
/// scripted test source are interchangeable.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
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
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle with a negotiated format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Webcams almost always offer YUYV; accept GREY/Y16 if the driver insists.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Start streaming. Each subsequent read waits at most `read_timeout`.
    pub fn into_stream(self, read_timeout: Duration) -> Result<CameraStream, CameraError> {
        let inner = CameraStreamInnerTryBuilder {
            camera: self,
            stream_builder: |camera| {
                let mut stream =
                    MmapStream::with_buffers(&camera.device, BufType::VideoCapture, STREAM_BUFFERS)
                        .map_err(|e| {
                            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                        })?;
                stream.set_timeout(read_timeout);
                Ok(stream)
            },
        }
        .try_build()?;

        tracing::debug!(timeout_ms = read_timeout.as_millis() as u64, "camera streaming");
        Ok(CameraStream { inner, read_timeout })
    }

    /// Convert a raw buffer to grayscale based on the negotiated format.
    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;

        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => {
                let expected_bytes = pixels * 2;
                if buf.len() < expected_bytes {
                    return Err(CameraError::CaptureFailed(format!(
                        "Y16 buffer too short: expected {expected_bytes}, got {}",
                        buf.len()
                    )));
                }
                // Keep the high byte of each little-endian sample.
                Ok(buf[..expected_bytes].chunks_exact(2).map(|px| px[1]).collect())
            }
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
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
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
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

/// A streaming camera. Dropping it stops the stream and closes the device.
pub struct CameraStream {
    inner: CameraStreamInner,
    read_timeout: Duration,
}

#[self_referencing]
struct CameraStreamInner {
    camera: Camera,
    #[borrows(camera)]
    #[not_covariant]
    stream: MmapStream<'this>,
}

impl CameraStream {
    /// Device path of the underlying camera.
    pub fn device_path(&self) -> &str {
        &self.inner.borrow_camera().device_path
    }
}

impl FrameSource for CameraStream {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let read_timeout = self.read_timeout;
        self.inner.with_mut(|fields| {
            let (buf, meta) = fields.stream.next().map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut => CameraError::ReadTimeout(read_timeout),
                _ => CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")),
            })?;
            let gray = fields.camera.buf_to_grayscale(buf)?;
            Ok(Frame::from_gray(
                gray,
                fields.camera.width,
                fields.camera.height,
                meta.sequence,
            ))
        })
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path(), "releasing camera");
    }
}
