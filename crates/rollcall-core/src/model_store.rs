//! Model Store — the trained recognizer, its label map and calibration.
//!
//! Loaded once when a capture session initializes and read-only afterwards.

use crate::filter::Calibration;
use crate::labels::LabelMap;
use crate::lbph::LbphModel;
use crate::types::RecognitionResult;
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MODEL_FILE: &str = "face_recognizer.json";
pub const LABELS_FILE: &str = "labels.json";
pub const CALIBRATION_FILE: &str = "threshold.json";

#[derive(Error, Debug)]
pub enum ModelStoreError {
    #[error("{what} not found at {path} — run the training job or copy its output into the model directory")]
    NotFound { what: &'static str, path: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: label {label} uses the legacy flat shape — convert it with `rollcall migrate-labels`")]
    LegacyLabelShape { path: String, label: String },
    #[error("{path}: {reason}")]
    Invalid { path: String, reason: String },
    #[error("recognizer unavailable: model requires algorithm {0:?}, this build only provides \"lbph\"")]
    RecognizerUnavailable(String),
    #[error("no acceptance threshold — provide {CALIBRATION_FILE} from training or set ROLLCALL_DISTANCE_THRESHOLD")]
    NoThreshold,
}

impl ModelStoreError {
    /// True when the runtime lacks the recognition capability, as opposed to
    /// a missing or corrupt artifact.
    pub fn is_recognizer_unavailable(&self) -> bool {
        matches!(self, Self::RecognizerUnavailable(_))
    }
}

/// A face recognition algorithm that reports distances (lower = closer).
pub trait Recognizer: Send + Sync {
    /// Face size (width, height) the model was trained on.
    fn face_size(&self) -> (u32, u32);

    /// Predict the nearest label for a face already at [`face_size`](Self::face_size).
    fn predict(&self, face: &GrayImage) -> RecognitionResult;
}

/// On-disk locations of the training artifacts.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub model: PathBuf,
    pub labels: PathBuf,
    /// Optional: absent file means "no calibrated threshold".
    pub calibration: PathBuf,
}

impl ModelPaths {
    /// Standard artifact names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            model: dir.join(MODEL_FILE),
            labels: dir.join(LABELS_FILE),
            calibration: dir.join(CALIBRATION_FILE),
        }
    }
}

pub struct ModelStore {
    recognizer: Box<dyn Recognizer>,
    labels: LabelMap,
    calibration: Option<Calibration>,
}

impl ModelStore {
    /// Load model, label map and (if present) calibration.
    pub fn load(paths: &ModelPaths) -> Result<Self, ModelStoreError> {
        let labels = LabelMap::load(&paths.labels)?;
        let model = LbphModel::load(&paths.model)?;

        let calibration = if paths.calibration.exists() {
            Some(Calibration::load(&paths.calibration)?)
        } else {
            tracing::debug!(path = %paths.calibration.display(), "no calibration file");
            None
        };

        let unlabeled = model.labels().filter(|l| labels.get(*l).is_none()).count();
        if unlabeled > 0 {
            tracing::warn!(
                unlabeled,
                "model has labels missing from the label map; those faces will stay unknown"
            );
        }

        tracing::info!(
            model = %paths.model.display(),
            samples = model.sample_count(),
            identities = labels.len(),
            calibrated = calibration.is_some(),
            "model store loaded"
        );

        Ok(Self::from_parts(Box::new(model), labels, calibration))
    }

    /// Assemble a store from an already-loaded recognizer.
    pub fn from_parts(
        recognizer: Box<dyn Recognizer>,
        labels: LabelMap,
        calibration: Option<Calibration>,
    ) -> Self {
        Self {
            recognizer,
            labels,
            calibration,
        }
    }

    /// Resize a grayscale face crop to the model's face size and predict.
    pub fn predict(&self, face: &GrayImage) -> RecognitionResult {
        let (w, h) = self.recognizer.face_size();
        if face.dimensions() == (w, h) {
            self.recognizer.predict(face)
        } else {
            let resized = imageops::resize(face, w, h, FilterType::Triangle);
            self.recognizer.predict(&resized)
        }
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }
}

pub(crate) fn read_artifact(path: &Path, what: &'static str) -> Result<String, ModelStoreError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ModelStoreError::NotFound {
                what,
                path: path.display().to_string(),
            }
        } else {
            ModelStoreError::Io {
                path: path.display().to_string(),
                source,
            }
        }
    })
}
