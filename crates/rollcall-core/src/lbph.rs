//! Local Binary Patterns Histograms (LBPH) face classifier.
//!
//! Each face crop is resized to a fixed square, converted to 8-neighbour
//! radius-1 LBP codes, split into a grid, and summarised as one L1-normalised
//! 256-bin histogram per cell. Prediction is the nearest training sample by
//! chi-square distance: lower is better.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::GrayImage;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FACE_SIZE: u32 = 200;
pub const DEFAULT_GRID: u32 = 8;
const BINS: usize = 256;

/// Clockwise neighbour offsets starting at the top-left pixel.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

/// One labelled training histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphSample {
    pub label: i64,
    pub histogram: Vec<f32>,
}

/// Trained LBPH model, as stored in `lbph.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    pub version: u32,
    pub face_size: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    pub samples: Vec<LbphSample>,
}

impl LbphModel {
    /// Build a model from labelled grayscale face crops of any size.
    pub fn train<'a, I>(faces: I) -> Self
    where
        I: IntoIterator<Item = (i64, &'a GrayImage)>,
    {
        let mut model = Self {
            version: 1,
            face_size: DEFAULT_FACE_SIZE,
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
            samples: Vec::new(),
        };
        model.samples = faces
            .into_iter()
            .map(|(label, face)| LbphSample {
                label,
                histogram: model.histogram_of(face),
            })
            .collect();
        model
    }

    /// Expected histogram length for this model's grid.
    pub fn histogram_len(&self) -> usize {
        (self.grid_x * self.grid_y) as usize * BINS
    }

    /// Crop `face` out of the frame and classify it.
    ///
    /// Returns `(label, distance)`; `None` if the box is entirely off-frame.
    pub fn predict_face(
        &self,
        gray: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Option<(i64, f32)> {
        let (x, y, w, h) = face.clamp_to(width, height)?;
        let frame = GrayImage::from_raw(width, height, gray.to_vec())?;
        let crop = image::imageops::crop_imm(&frame, x, y, w, h).to_image();
        Some(self.predict(&crop))
    }

    /// Nearest training sample to `face`. An empty model predicts `(-1, f32::MAX)`.
    pub fn predict(&self, face: &GrayImage) -> (i64, f32) {
        let query = self.histogram_of(face);
        self.samples
            .iter()
            .map(|s| (s.label, chi_square(&s.histogram, &query)))
            .fold((-1, f32::MAX), |best, candidate| {
                if candidate.1 < best.1 {
                    candidate
                } else {
                    best
                }
            })
    }

    fn histogram_of(&self, face: &GrayImage) -> Vec<f32> {
        let resized = if face.dimensions() == (self.face_size, self.face_size) {
            face.clone()
        } else {
            image::imageops::resize(face, self.face_size, self.face_size, FilterType::Triangle)
        };
        spatial_histogram(&lbp_codes(&resized), self.grid_x, self.grid_y)
    }
}

/// LBP code image. Border pixels have no full neighbourhood, so the output
/// is two pixels smaller in each dimension.
fn lbp_codes(face: &GrayImage) -> GrayImage {
    let (w, h) = face.dimensions();
    if w < 3 || h < 3 {
        return GrayImage::new(0, 0);
    }
    GrayImage::from_fn(w - 2, h - 2, |x, y| {
        let (cx, cy) = (x as i32 + 1, y as i32 + 1);
        let center = face.get_pixel(cx as u32, cy as u32).0[0];
        let code = NEIGHBOURS
            .iter()
            .enumerate()
            .fold(0u8, |code, (bit, &(dx, dy))| {
                let n = face.get_pixel((cx + dx) as u32, (cy + dy) as u32).0[0];
                if n >= center {
                    code | (1 << (7 - bit))
                } else {
                    code
                }
            });
        image::Luma([code])
    })
}

/// Concatenated per-cell histograms, each normalised to sum to 1.
fn spatial_histogram(codes: &GrayImage, grid_x: u32, grid_y: u32) -> Vec<f32> {
    let (w, h) = codes.dimensions();
    let cells = (grid_x * grid_y) as usize;
    let mut hist = vec![0f32; cells * BINS];
    if w < grid_x || h < grid_y {
        return hist;
    }
    let (cell_w, cell_h) = (w / grid_x, h / grid_y);

    for row in 0..grid_y {
        for col in 0..grid_x {
            let cell = (row * grid_x + col) as usize;
            let bins = &mut hist[cell * BINS..(cell + 1) * BINS];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    bins[codes.get_pixel(x, y).0[0] as usize] += 1.0;
                }
            }
            let total = (cell_w * cell_h) as f32;
            bins.iter_mut().for_each(|b| *b /= total);
        }
    }
    hist
}

/// Symmetric chi-square distance: Σ 2(a−b)² / (a+b).
fn chi_square(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .filter(|(x, y)| **x + **y > f32::EPSILON)
        .map(|(x, y)| 2.0 * (x - y).powi(2) / (x + y))
        .sum()
}
