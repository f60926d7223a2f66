//! Local Binary Pattern Histogram (LBPH) face recognizer.
//!
//! Each face is encoded as extended (circular) LBP codes, split into a
//! `grid_x × grid_y` grid, and described by the concatenation of the
//! per-cell normalized code histograms. Prediction is nearest neighbour over
//! the stored training histograms using the alternative chi-square distance,
//! so the reported score is a distance: 0 for an identical face, growing with
//! dissimilarity.

use crate::model_store::{read_artifact, ModelStoreError, Recognizer};
use crate::types::RecognitionResult;
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::f32::consts::PI;
use std::path::Path;

pub const LBPH_ALGORITHM: &str = "lbph";

/// Largest sampling-point count we accept (histogram bins = 2^neighbors).
const MAX_NEIGHBORS: u32 = 16;
/// Neighbour samples within this of the centre count as equal.
const LBP_TOLERANCE: f32 = 1e-3;

/// LBP operator and grid settings, fixed at training time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    fn patterns(&self) -> usize {
        1usize << self.neighbors
    }

    fn histogram_len(&self) -> usize {
        (self.grid_x * self.grid_y) as usize * self.patterns()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphSample {
    pub label: i32,
    pub histogram: Vec<f32>,
}

/// Serialized LBPH model (`face_recognizer.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    algorithm: String,
    #[serde(flatten)]
    params: LbphParams,
    face_width: u32,
    face_height: u32,
    samples: Vec<LbphSample>,
}

impl LbphModel {
    /// Build a model from labelled grayscale faces, resizing each to `face_size`.
    pub fn from_faces(params: LbphParams, face_size: (u32, u32), faces: &[(i32, GrayImage)]) -> Self {
        let mut model = Self {
            algorithm: LBPH_ALGORITHM.to_string(),
            params,
            face_width: face_size.0,
            face_height: face_size.1,
            samples: Vec::with_capacity(faces.len()),
        };
        for (label, face) in faces {
            let histogram = model.histogram(&model.fit(face));
            model.samples.push(LbphSample {
                label: *label,
                histogram,
            });
        }
        model
    }

    /// Load and validate a serialized model.
    pub fn load(path: &Path) -> Result<Self, ModelStoreError> {
        let raw = read_artifact(path, "recognition model")?;
        let model: Self = serde_json::from_str(&raw).map_err(|source| ModelStoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        if model.algorithm != LBPH_ALGORITHM {
            return Err(ModelStoreError::RecognizerUnavailable(model.algorithm));
        }
        model.validate().map_err(|reason| ModelStoreError::Invalid {
            path: path.display().to_string(),
            reason,
        })?;
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelStoreError> {
        let json = serde_json::to_string(self).map_err(|source| ModelStoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ModelStoreError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn validate(&self) -> Result<(), String> {
        let p = &self.params;
        if p.radius == 0 || p.neighbors == 0 || p.neighbors > MAX_NEIGHBORS {
            return Err(format!(
                "invalid LBP operator: radius={} neighbors={} (neighbors must be 1..={MAX_NEIGHBORS})",
                p.radius, p.neighbors
            ));
        }
        if p.grid_x == 0 || p.grid_y == 0 {
            return Err("grid dimensions must be non-zero".into());
        }
        let min_side = 2 * p.radius + 1;
        if self.face_width < min_side || self.face_height < min_side {
            return Err(format!(
                "face size {}x{} too small for radius {}",
                self.face_width, self.face_height, p.radius
            ));
        }
        let expected = p.histogram_len();
        if let Some(bad) = self.samples.iter().find(|s| s.histogram.len() != expected) {
            return Err(format!(
                "sample for label {} has {} histogram bins, expected {expected}",
                bad.label,
                bad.histogram.len()
            ));
        }
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Distinct labels present in the training set.
    pub fn labels(&self) -> impl Iterator<Item = i32> {
        self.samples
            .iter()
            .map(|s| s.label)
            .collect::<BTreeSet<_>>()
            .into_iter()
    }

    fn fit(&self, face: &GrayImage) -> GrayImage {
        if face.dimensions() == (self.face_width, self.face_height) {
            face.clone()
        } else {
            imageops::resize(face, self.face_width, self.face_height, FilterType::Triangle)
        }
    }

    /// Spatial LBP histogram of a face already at the model's face size.
    fn histogram(&self, face: &GrayImage) -> Vec<f32> {
        let (codes, w, h) = elbp(face, self.params.radius, self.params.neighbors);
        spatial_histogram(&codes, w, h, self.params)
    }
}

impl Recognizer for LbphModel {
    fn face_size(&self) -> (u32, u32) {
        (self.face_width, self.face_height)
    }

    fn predict(&self, face: &GrayImage) -> RecognitionResult {
        let query = self.histogram(&self.fit(face));

        let mut best = RecognitionResult {
            label: -1,
            distance: f32::INFINITY,
        };
        for sample in &self.samples {
            let distance = chi_square_alt(&sample.histogram, &query);
            if distance < best.distance {
                best = RecognitionResult {
                    label: sample.label,
                    distance,
                };
            }
        }
        best
    }
}

/// Extended LBP: compare `neighbors` points on a circle of `radius` (bilinear
/// sampled) against the centre pixel. Output is `(w - 2r) × (h - 2r)`.
fn elbp(img: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, usize, usize) {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let r = radius as usize;
    if w <= 2 * r || h <= 2 * r {
        return (Vec::new(), 0, 0);
    }
    let out_w = w - 2 * r;
    let out_h = h - 2 * r;
    let src = img.as_raw();
    let px = |y: isize, x: isize| src[y as usize * w + x as usize] as f32;

    let mut codes = vec![0u32; out_w * out_h];
    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f32 / neighbors as f32;
        let sx = radius as f32 * angle.cos();
        let sy = -(radius as f32) * angle.sin();
        let (fx, fy) = (sx.floor() as isize, sy.floor() as isize);
        let (cx, cy) = (sx.ceil() as isize, sy.ceil() as isize);
        let (tx, ty) = (sx - sx.floor(), sy - sy.floor());
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..h - r {
            for j in r..w - r {
                let (i, j) = (i as isize, j as isize);
                let t = w1 * px(i + fy, j + fx)
                    + w2 * px(i + fy, j + cx)
                    + w3 * px(i + cy, j + fx)
                    + w4 * px(i + cy, j + cx);
                let centre = px(i, j);
                if t > centre || (t - centre).abs() < LBP_TOLERANCE {
                    let idx = (i as usize - r) * out_w + (j as usize - r);
                    codes[idx] |= 1 << n;
                }
            }
        }
    }
    (codes, out_w, out_h)
}

/// Concatenated per-cell histograms, each normalized by its cell's pixel count.
fn spatial_histogram(codes: &[u32], w: usize, h: usize, params: LbphParams) -> Vec<f32> {
    let patterns = params.patterns();
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let mut hist = vec![0f32; params.histogram_len()];
    let cell_w = w / gx;
    let cell_h = h / gy;
    if cell_w == 0 || cell_h == 0 {
        return hist;
    }
    let cell_pixels = (cell_w * cell_h) as f32;

    for row in 0..gy {
        for col in 0..gx {
            let base = (row * gx + col) * patterns;
            for y in row * cell_h..(row + 1) * cell_h {
                for &code in &codes[y * w + col * cell_w..y * w + (col + 1) * cell_w] {
                    hist[base + code as usize] += 1.0;
                }
            }
            for bin in &mut hist[base..base + patterns] {
                *bin /= cell_pixels;
            }
        }
    }
    hist
}

/// Alternative chi-square distance: `Σ 2 (a - b)² / (a + b)`.
pub fn chi_square_alt(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let sum = x + y;
            if sum > f32::EPSILON {
                2.0 * (x - y) * (x - y) / sum
            } else {
                0.0
            }
        })
        .sum()
}
