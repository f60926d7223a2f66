//! Face Locator — SCRFD face detection via ONNX Runtime.
//!
//! SCRFD is anchor-free over three strides; every anchor above the score
//! threshold is a raw detection. Raw detections are grouped by non-maximum
//! suppression, and a group must collect `min_neighbors` absorbed detections
//! to survive, the same grouping rule a cascade detector applies.

use crate::types::FaceCandidate;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_BASE_INPUT: f32 = 640.0;
const SCRFD_MIN_INPUT: usize = 160;
const SCRFD_MAX_INPUT: usize = 1280;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("detector model not found: {0} — download det_10g.onnx from insightface into the model directory")]
    ModelNotFound(String),
    #[error("ONNX runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("invalid detector model: {0}")]
    InvalidModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds candidate faces in a grayscale frame.
pub trait FaceLocator {
    /// Zero candidates is a normal result, not an error.
    fn locate(&mut self, gray: &[u8], width: u32, height: u32) -> Result<Vec<FaceCandidate>, LocatorError>;
}

/// Detector tuning, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocatorParams {
    /// Input downscale relative to 640 px; larger is faster and drops small faces.
    pub scale_factor: f32,
    /// Raw detections a face must absorb during NMS to be kept.
    pub min_neighbors: u32,
    /// Smallest accepted face side, in frame pixels.
    pub min_size: u32,
}

impl Default for LocatorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 1,
            min_size: 50,
        }
    }
}

impl LocatorParams {
    /// Square detector input side: 640 / scale_factor, snapped to a stride-32 multiple.
    pub fn input_size(&self) -> usize {
        let factor = if self.scale_factor.is_finite() && self.scale_factor > 0.0 {
            self.scale_factor
        } else {
            1.0
        };
        let side = (SCRFD_BASE_INPUT / factor / 32.0).round() as usize * 32;
        side.clamp(SCRFD_MIN_INPUT, SCRFD_MAX_INPUT)
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// A raw detection plus how many others NMS folded into it.
#[derive(Debug, Clone)]
struct Grouped {
    candidate: FaceCandidate,
    neighbors: u32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

pub struct ScrfdLocator {
    session: Session,
    input_size: usize,
    params: LocatorParams,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdLocator {
    /// Load the SCRFD ONNX model.
    pub fn load(model_path: &Path, params: LocatorParams) -> Result<Self, LocatorError> {
        if !model_path.exists() {
            return Err(LocatorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()
            .map_err(|e| LocatorError::RuntimeUnavailable(e.to_string()))?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .map_err(|e| LocatorError::InvalidModel(format!("{}: {e}", model_path.display())))?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 6 {
            return Err(LocatorError::InvalidModel(format!(
                "SCRFD needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }
        let stride_outputs = discover_outputs(&output_names);
        let input_size = params.input_size();

        tracing::info!(
            path = %model_path.display(),
            input_size,
            min_neighbors = params.min_neighbors,
            min_size = params.min_size,
            ?stride_outputs,
            "SCRFD locator loaded"
        );

        Ok(Self {
            session,
            input_size,
            params,
            stride_outputs,
        })
    }

    /// Letterbox a grayscale frame into a normalized NCHW tensor.
    fn preprocess(&self, gray: &[u8], width: u32, height: u32) -> Result<(Array4<f32>, LetterboxInfo), LocatorError> {
        let frame = GrayImage::from_raw(width, height, gray.to_vec()).ok_or_else(|| {
            LocatorError::InferenceFailed(format!(
                "frame buffer of {} bytes does not match {width}x{height}",
                gray.len()
            ))
        })?;

        let side = self.input_size;
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, side as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, side as u32);
        let resized = imageops::resize(&frame, new_w, new_h, FilterType::Triangle);

        let pad_x = (side - new_w as usize) as f32 / 2.0;
        let pad_y = (side - new_h as usize) as f32 / 2.0;
        let (x_off, y_off) = (pad_x.floor() as usize, pad_y.floor() as usize);

        // Padding stays at 0.0, i.e. the normalized mean.
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, px) in resized.enumerate_pixels() {
            let v = (px.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            let (ty, tx) = (y as usize + y_off, x as usize + x_off);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }

        Ok((tensor, LetterboxInfo { scale, pad_x, pad_y }))
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&mut self, gray: &[u8], width: u32, height: u32) -> Result<Vec<FaceCandidate>, LocatorError> {
        let (input, letterbox) = self.preprocess(gray, width, height)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut raw = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| LocatorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| LocatorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            raw.extend(decode_stride(scores, bboxes, stride, self.input_size, &letterbox));
        }

        let min_size = self.params.min_size as f32;
        let min_neighbors = self.params.min_neighbors;
        let mut faces: Vec<FaceCandidate> = group(raw, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter(|g| g.neighbors >= min_neighbors)
            .map(|g| g.candidate)
            .filter(|c| c.width >= min_size && c.height >= min_size)
            .collect();
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(faces)
    }
}

/// Map stride slots to output tensors.
///
/// Named exports ("score_8", "bbox_8", ...) are matched by name; otherwise the
/// standard positional layout applies: [0-2] scores, [3-5] bboxes, [6-8] kps.
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode every anchor above the score threshold for one stride level,
/// mapped back to frame coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
) -> Vec<FaceCandidate> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap = |v: f32, pad: f32| (v - pad) / letterbox.scale;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_SCORE_THRESHOLD {
                return None;
            }
            let off = bboxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * s;
            let ay = (cell / grid) as f32 * s;

            let x1 = unmap(ax - off[0] * s, letterbox.pad_x);
            let y1 = unmap(ay - off[1] * s, letterbox.pad_y);
            let x2 = unmap(ax + off[2] * s, letterbox.pad_x);
            let y2 = unmap(ay + off[3] * s, letterbox.pad_y);

            Some(FaceCandidate {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// NMS that remembers how many detections each survivor absorbed.
fn group(mut detections: Vec<FaceCandidate>, iou_threshold: f32) -> Vec<Grouped> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Grouped> = Vec::new();
    let mut suppressed = vec![false; detections.len()];
    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        let mut neighbors = 0;
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
                neighbors += 1;
            }
        }
        kept.push(Grouped {
            candidate: detections[i],
            neighbors,
        });
    }
    kept
}

/// Intersection-over-Union between two boxes.
fn iou(a: &FaceCandidate, b: &FaceCandidate) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
