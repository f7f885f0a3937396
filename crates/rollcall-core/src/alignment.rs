//! Face alignment for embedding models.
//!
//! Maps five detected landmarks onto the ArcFace reference layout with a
//! least-squares similarity transform (scale, rotation, translation) and
//! resamples the face into a 112×112 crop.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::GrayImage;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit over centred point sets.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-9 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    /// Map an output (destination) pixel back into the source frame.
    fn inverse_map(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Bilinear sample; pixels outside the frame read as black.
fn sample(gray: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let at = |px: i64, py: i64| -> f32 {
        if px >= 0 && py >= 0 && (px as usize) < width && (py as usize) < height {
            gray[py as usize * width + px as usize] as f32
        } else {
            0.0
        }
    };
    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
    let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Warp the face into the canonical 112×112 layout using its landmarks.
pub fn align_face(gray: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let size = ALIGNED_SIZE as usize;
    let mut out = vec![0u8; size * size];
    let Some(transform) = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS) else {
        return out;
    };

    let (w, h) = (width as usize, height as usize);
    for oy in 0..size {
        for ox in 0..size {
            if let Some((sx, sy)) = transform.inverse_map(ox as f32, oy as f32) {
                out[oy * size + ox] = sample(gray, w, h, sx, sy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Square crop around the box, resized to 112×112. Used when the detector
/// provides no landmarks.
pub fn crop_face(gray: &[u8], width: u32, height: u32, face: &BoundingBox) -> Option<Vec<u8>> {
    let side = face.width.max(face.height);
    let square = BoundingBox {
        x: face.x + (face.width - side) / 2.0,
        y: face.y + (face.height - side) / 2.0,
        width: side,
        height: side,
        ..face.clone()
    };
    let (x, y, w, h) = square.clamp_to(width, height)?;
    let frame = GrayImage::from_raw(width, height, gray.to_vec())?;
    let crop = image::imageops::crop_imm(&frame, x, y, w, h).to_image();
    let resized = image::imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle);
    Some(resized.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_half_scale_transform() {
        let src = REFERENCE_LANDMARKS.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 + 20.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS).unwrap();
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
        let (sx, sy) = t.inverse_map(REFERENCE_LANDMARKS[2].0, REFERENCE_LANDMARKS[2].1).unwrap();
        assert!((sx - src[2].0).abs() < 1e-2 && (sy - src[2].1).abs() < 1e-2);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let pts = [(5.0, 5.0); 5];
        assert!(Similarity::estimate(&pts, &REFERENCE_LANDMARKS).is_none());
        let out = align_face(&[255u8; 100], 10, 10, &pts);
        assert!(out.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_aligned_patch_lands_on_reference_eye() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h];
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for dy in 0..5 {
            for dx in 0..5 {
                frame[(58 + dy) * w + 78 + dx] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &src);
        assert_eq!(aligned.len(), 112 * 112);
        let (rx, ry) = (38usize, 52usize);
        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned[y * 112 + x])
            .max()
            .unwrap();
        assert!(brightest > 100, "max near reference eye = {brightest}");
    }

    #[test]
    fn test_crop_face_size() {
        let frame = vec![90u8; 64 * 48];
        let face = BoundingBox {
            x: 10.0,
            y: 5.0,
            width: 20.0,
            height: 30.0,
            confidence: 0.9,
            landmarks: None,
        };
        let crop = crop_face(&frame, 64, 48, &face).unwrap();
        assert_eq!(crop.len(), 112 * 112);
        assert!(crop.iter().all(|&p| p == 90));
    }
}
