use crate::engine::CaptureSettings;
use rollcall_core::{LocatorParams, ModelPaths};
use std::path::PathBuf;
use std::time::Duration;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory holding the recognizer, label map and calibration.
    pub model_dir: PathBuf,
    /// SCRFD detector ONNX file.
    pub detector_model: PathBuf,
    /// Operator override for the acceptance distance; wins over calibration.
    pub distance_threshold: Option<f32>,
    /// How long `stop` waits for the capture loop before reporting a partial result.
    pub grace_period: Duration,
    /// Upper bound on a single camera read.
    pub read_timeout: Duration,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    pub scale_factor: f32,
    pub min_neighbors: u32,
    pub min_face_size: u32,
    /// CLAHE before detection.
    pub equalize: bool,
    /// First-sighting CSV log; `None` disables it.
    pub attendance_log: Option<PathBuf>,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./models"));

        let detector_model = var("ROLLCALL_DETECTOR_MODEL")
            .map(PathBuf::from)
            .unwrap_or_else(|| model_dir.join("det_10g.onnx"));

        let attendance_log = match var("ROLLCALL_ATTENDANCE_LOG") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(PathBuf::from(v)),
            None => Some(PathBuf::from("attendance_log.csv")),
        };

        let bus = match var("ROLLCALL_BUS").as_deref() {
            Some("session") => BusKind::Session,
            _ => BusKind::System,
        };

        let parse = |key: &str| var(key).and_then(|v| v.trim().parse().ok());

        Self {
            camera_device: var("ROLLCALL_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir,
            detector_model,
            distance_threshold: parse("ROLLCALL_DISTANCE_THRESHOLD"),
            grace_period: Duration::from_millis(parse("ROLLCALL_GRACE_PERIOD_MS").unwrap_or(2000)),
            read_timeout: Duration::from_millis(parse("ROLLCALL_READ_TIMEOUT_MS").unwrap_or(1000)),
            warmup_frames: parse("ROLLCALL_WARMUP_FRAMES").unwrap_or(4),
            scale_factor: parse("ROLLCALL_SCALE_FACTOR").unwrap_or(1.3),
            min_neighbors: parse("ROLLCALL_MIN_NEIGHBORS").unwrap_or(1),
            min_face_size: parse("ROLLCALL_MIN_FACE_SIZE").unwrap_or(50),
            equalize: var("ROLLCALL_EQUALIZE")
                .map(|v| !matches!(v.trim(), "0" | "off" | "false"))
                .unwrap_or(true),
            attendance_log,
            bus,
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn locator_params(&self) -> LocatorParams {
        LocatorParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_face_size,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            warmup_frames: self.warmup_frames,
            distance_threshold: self.distance_threshold,
            equalize: self.equalize,
            attendance_log: self.attendance_log.clone(),
        }
    }

    /// A grace period at or below the read timeout can never observe a clean
    /// stop while a read is blocked.
    pub fn grace_covers_read(&self) -> bool {
        self.grace_period > self.read_timeout
    }
}
