//! V4L2 cameras as scanner frame sources.

use rollcall_core::{CameraProvider, CaptureError, FrameSource};
use rollcall_hw::{Camera, CameraError};
use image::RgbImage;

/// Opens `/dev/videoN` devices at a fixed requested resolution.
pub struct V4l2Cameras {
    pub width: u32,
    pub height: u32,
    pub warmup_frames: usize,
}

struct V4l2Source {
    camera: Camera,
    dark_streak: u32,
}

impl FrameSource for V4l2Source {
    fn capture(&mut self) -> Result<RgbImage, CaptureError> {
        let frame = self
            .camera
            .capture_frame()
            .map_err(|e| CaptureError(e.to_string()))?;
        if frame.is_dark {
            self.dark_streak += 1;
            if self.dark_streak == 1 || self.dark_streak % 50 == 0 {
                tracing::debug!(
                    device = %self.camera.device_path,
                    streak = self.dark_streak,
                    "dark frame"
                );
            }
        } else {
            self.dark_streak = 0;
        }
        Ok(frame.image)
    }
}

impl CameraProvider for V4l2Cameras {
    fn open(&self, camera_id: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        let path = device_path(camera_id)
            .ok_or_else(|| CaptureError(format!("unrecognized camera id {camera_id:?}")))?;
        let mut camera = Camera::open(&path, self.width, self.height).map_err(|e| match e {
            CameraError::DeviceBusy => CaptureError(format!("{path} is in use by another process")),
            other => CaptureError(other.to_string()),
        })?;
        camera.discard_frames(self.warmup_frames);
        Ok(Box::new(V4l2Source {
            camera,
            dark_streak: 0,
        }))
    }
}

/// Map a camera id to a device node.
///
/// Accepts a device path (`/dev/video2`), a bare index (`2`) or `camera_2`.
pub fn device_path(camera_id: &str) -> Option<String> {
    let id = camera_id.trim();
    if id.starts_with("/dev/") {
        return Some(id.to_string());
    }
    let index = id.strip_prefix("camera_").unwrap_or(id);
    index
        .parse::<u32>()
        .ok()
        .map(|n| format!("/dev/video{n}"))
}

/// Device node for `camera_id`, substituting `default` for a blank id.
///
/// Every alias of a device resolves to the same path, so it doubles as
/// the scanner session key.
pub fn canonical_camera_id(camera_id: &str, default: &str) -> Option<String> {
    let id = camera_id.trim();
    device_path(if id.is_empty() { default } else { id })
}
