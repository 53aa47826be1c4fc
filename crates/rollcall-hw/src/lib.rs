//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access with YUYV/MJPEG to RGB conversion, and
//! the [`FrameSource`] trait the recognition loop reads from.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource};
pub use frame::{Frame, FrameError};
