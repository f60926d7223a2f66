//! rollcall-hw — Hardware abstraction for classroom camera capture.
//!
//! Provides V4L2-based streaming capture with bounded reads and the
//! grayscale frame conditioning (dark-frame check, CLAHE) applied before
//! face detection.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, FrameSource, PixelFormat};
pub use frame::Frame;
