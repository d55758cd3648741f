//! rollcall-hw: V4L2 camera capture for the recognition session.
//!
//! The [`Camera`] implements [`rollcall_core::FrameSource`], converting
//! whatever the driver negotiates into grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
