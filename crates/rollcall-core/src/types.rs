use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

/// Region of a frame that the locator believes holds a face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceCandidate {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceCandidate {
    /// Copy this region out of a grayscale frame, clamped to the frame bounds.
    ///
    /// Returns `None` when the clamped region is empty (box fully outside the
    /// frame, or degenerate).
    pub fn crop(&self, gray: &[u8], width: u32, height: u32) -> Option<GrayImage> {
        if gray.len() < (width as usize) * (height as usize) {
            return None;
        }
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let stride = width as usize;
        Some(GrayImage::from_fn(x1 - x0, y1 - y0, |x, y| {
            let idx = (y0 + y) as usize * stride + (x0 + x) as usize;
            Luma([gray[idx]])
        }))
    }
}

/// Raw recognizer output for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognitionResult {
    pub label: i32,
    /// Dissimilarity to the nearest trained sample; lower is better.
    pub distance: f32,
}

/// One enrolled student, as recorded in the label map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    /// Identity key reported to the backend (student code).
    pub id: String,
    pub name: String,
}
