//! rollcall-hw: V4L2 camera capture and RGB frame conversion.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
