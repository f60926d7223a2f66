//! rollcall-core — Face location and recognition for attendance capture.
//!
//! SCRFD locates faces via ONNX Runtime; a local-binary-pattern histogram
//! (LBPH) model recognizes them, reporting a distance where lower is better.
//! The label map turns numeric labels into student identities and the
//! recognition filter decides which predictions count.

pub mod filter;
pub mod labels;
pub mod lbph;
pub mod locator;
pub mod model_store;
pub mod types;

pub use filter::{Calibration, RecognitionFilter, Threshold};
pub use labels::LabelMap;
pub use lbph::{LbphModel, LbphParams};
pub use locator::{FaceLocator, LocatorError, LocatorParams, ScrfdLocator};
pub use model_store::{ModelPaths, ModelStore, ModelStoreError, Recognizer};
pub use types::{FaceCandidate, Identity, RecognitionResult};
