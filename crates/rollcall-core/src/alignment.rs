//! Face alignment via 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the InsightFace reference template
//! by least squares and warps the face into a 112×112 RGB crop. Alignment is
//! refused when the landmarks cannot support a faithful fit.

use crate::types::Landmarks;
use image::{Rgb, RgbImage};
use thiserror::Error;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Eyes closer than this (source pixels) carry no usable geometry.
const MIN_EYE_DISTANCE: f32 = 4.0;
/// RMS landmark error (output pixels) above which the pose is too extreme.
const MAX_FIT_RESIDUAL: f32 = 12.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("detection has no landmarks")]
    NoLandmarks,
    #[error("landmarks contain non-finite coordinates")]
    NonFinite,
    #[error("eye landmarks too close ({0:.1}px)")]
    DegenerateLandmarks(f32),
    #[error("similarity transform is singular")]
    Singular,
    #[error("pose too extreme: landmark fit residual {0:.1}px")]
    ExtremePose(f32),
}

/// 2×3 similarity transform `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
type Similarity = [f32; 6];

/// Least-squares similarity transform from `src` to `dst`.
fn estimate_similarity_transform(src: &Landmarks, dst: &Landmarks) -> Option<Similarity> {
    // Overdetermined system A * [a, b, tx, ty]^T = B, two rows per point:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];
        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb)?;
    Some([a, -b, tx, b, a, ty])
}

/// Gaussian elimination with partial pivoting. `None` when singular.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f32; 4]; 4], atb: [f32; 4]) -> Option<[f32; 4]> {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-9 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

fn apply(matrix: &Similarity, (x, y): (f32, f32)) -> (f32, f32) {
    (
        matrix[0] * x + matrix[1] * y + matrix[2],
        matrix[3] * x + matrix[4] * y + matrix[5],
    )
}

/// RMS distance between transformed `src` and `dst`.
fn fit_residual(matrix: &Similarity, src: &Landmarks, dst: &Landmarks) -> f32 {
    let sum: f32 = src
        .iter()
        .zip(dst.iter())
        .map(|(&s, &(dx, dy))| {
            let (px, py) = apply(matrix, s);
            (px - dx).powi(2) + (py - dy).powi(2)
        })
        .sum();
    (sum / src.len() as f32).sqrt()
}

/// Inverse-map every output pixel into `image` with bilinear sampling.
/// Out-of-bounds samples are black.
fn warp_affine(image: &RgbImage, matrix: &Similarity, out_size: u32) -> RgbImage {
    let (a, tx, b, ty) = (matrix[0], matrix[2], matrix[3], matrix[5]);

    // M = [[a, -b], [b, a]], det = a^2 + b^2
    let inv_det = 1.0 / (a * a + b * b);
    let ia = a * inv_det;
    let ib = b * inv_det;

    let (w, h) = (image.width() as i64, image.height() as i64);
    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let mut px = [0u8; 3];
        for (c, out) in px.iter_mut().enumerate() {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *out = val.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

/// Align a detected face to a canonical 112×112 RGB crop.
pub fn align_face(image: &RgbImage, landmarks: &Landmarks) -> Result<RgbImage, AlignmentError> {
    if landmarks.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(AlignmentError::NonFinite);
    }

    let (lx, ly) = landmarks[0];
    let (rx, ry) = landmarks[1];
    let eye_distance = ((rx - lx).powi(2) + (ry - ly).powi(2)).sqrt();
    if eye_distance < MIN_EYE_DISTANCE {
        return Err(AlignmentError::DegenerateLandmarks(eye_distance));
    }

    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112)
        .ok_or(AlignmentError::Singular)?;
    if matrix[0] * matrix[0] + matrix[3] * matrix[3] < 1e-12 {
        return Err(AlignmentError::Singular);
    }

    let residual = fit_residual(&matrix, landmarks, &REFERENCE_LANDMARKS_112);
    if residual > MAX_FIT_RESIDUAL {
        return Err(AlignmentError::ExtremePose(residual));
    }

    Ok(warp_affine(image, &matrix, ALIGNED_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts).unwrap();

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-2, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!(m[5].abs() < 1e-2, "ty = {}", m[5]);
        assert!(fit_residual(&m, &pts, &pts) < 1e-2);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → transform should have a ≈ 0.5
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((m[0] - 0.5).abs() < 0.01, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_align_is_deterministic() {
        let image = RgbImage::from_fn(200, 200, |x, y| Rgb([x as u8, y as u8, (x ^ y) as u8]));
        let lms: Landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        assert_eq!(align_face(&image, &lms).unwrap(), align_face(&image, &lms).unwrap());
    }

    #[test]
    fn test_landmark_roundtrip_preserves_color() {
        let (w, h) = (200u32, 200u32);
        let src_landmarks: Landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // Paint a 5x5 red patch at the left eye position.
        let mut image = RgbImage::new(w, h);
        let (lx, ly) = (src_landmarks[0].0 as u32, src_landmarks[0].1 as u32);
        for y in ly - 2..=ly + 2 {
            for x in lx - 2..=lx + 2 {
                image.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&image, &src_landmarks).unwrap();

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as u32;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as u32;
        let mut max_red = 0u8;
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                let p = aligned.get_pixel(x, y);
                assert_eq!(p[1], 0);
                max_red = max_red.max(p[0]);
            }
        }
        assert!(max_red > 100, "expected red patch near ({ref_x}, {ref_y}), max={max_red}");
    }

    #[test]
    fn test_collapsed_landmarks_rejected() {
        let image = RgbImage::new(100, 100);
        let lms: Landmarks = [(50.0, 50.0); 5];
        assert!(matches!(
            align_face(&image, &lms),
            Err(AlignmentError::DegenerateLandmarks(_))
        ));
    }

    #[test]
    fn test_profile_pose_rejected() {
        // Mouth corners above the eyes and nose far off to the side: no
        // similarity transform brings this close to the frontal template.
        let image = RgbImage::new(300, 300);
        let lms: Landmarks = [(100.0, 150.0), (140.0, 150.0), (260.0, 40.0), (100.0, 60.0), (140.0, 60.0)];
        assert!(matches!(align_face(&image, &lms), Err(AlignmentError::ExtremePose(_))));
    }

    #[test]
    fn test_non_finite_rejected() {
        let image = RgbImage::new(100, 100);
        let mut lms = REFERENCE_LANDMARKS_112;
        lms[2].0 = f32::NAN;
        assert_eq!(align_face(&image, &lms), Err(AlignmentError::NonFinite));
    }
}
