//! Frame type and pixel conversion: YUYV/GREY/Y16/MJPG to RGB, dark-frame
//! detection, box overlays and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage};

/// A captured camera frame in RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = (self.image.width() * self.image.height()) as usize;
        if pixels == 0 {
            return 0.0;
        }
        self.image.pixels().map(luma).sum::<f32>() / pixels as f32
    }
}

/// BT.601 luma of one pixel.
fn luma(p: &Rgb<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range YCbCr → RGB, integer arithmetic.
fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> Rgb<u8> {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    Rgb([
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ])
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U and V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    if width % 2 != 0 {
        return Err(FrameError::OddWidth(width));
    }
    check_len(yuyv, (width * height * 2) as usize)?;

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let pair = ((y * width + (x & !1)) * 2) as usize;
        let luma = if x % 2 == 0 { yuyv[pair] } else { yuyv[pair + 2] };
        ycbcr_to_rgb(luma, yuyv[pair + 1], yuyv[pair + 3])
    }))
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    check_len(grey, (width * height) as usize)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let v = grey[(y * width + x) as usize];
        Rgb([v, v, v])
    }))
}

/// 16-bit little-endian grayscale, downscaled to 8 bits per channel.
pub fn y16_to_rgb(y16: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    check_len(y16, (width * height * 2) as usize)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        // High byte of the LE word.
        let v = y16[((y * width + x) * 2 + 1) as usize];
        Rgb([v, v, v])
    }))
}

/// Decode a Motion-JPEG buffer.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| FrameError::Decode(e.to_string()))
}

/// True if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = (image.width() * image.height()) as usize;
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| luma(p) < 32.0).count();
    (dark as f32 / total as f32) > threshold_pct
}

/// Outline the rectangle at (`x`, `y`) of `width` x `height` with a border
/// `thickness` pixels wide. Whatever falls outside the image is clipped.
pub fn draw_box(
    image: &mut RgbImage,
    (x, y, width, height): (f32, f32, f32, f32),
    thickness: u32,
    color: Rgb<u8>,
) {
    if ![x, y, width, height].iter().all(|v| v.is_finite()) || width <= 0.0 || height <= 0.0 {
        return;
    }
    let (w, h) = image.dimensions();
    let left = x.floor() as i64;
    let top = y.floor() as i64;
    let right = (x + width).ceil() as i64 - 1;
    let bottom = (y + height).ceil() as i64 - 1;
    let t = thickness.max(1) as i64;

    let (x0, x1) = (left.max(0), right.min(w as i64 - 1));
    let (y0, y1) = (top.max(0), bottom.min(h as i64 - 1));
    for py in y0..=y1 {
        for px in x0..=x1 {
            let on_edge = px - left < t || right - px < t || py - top < t || bottom - py < t;
            if on_edge {
                image.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

/// Encode as baseline JPEG at `quality` (1–100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("YUYV needs an even width, got {0}")]
    OddWidth(u32),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
}
