//! Capture loop: camera → locator → recognizer → filter → roster.
//!
//! The loop runs on its own OS thread, owns the camera for its whole life and
//! talks to the session controller only through a [`StopSignal`] and a
//! [`Roster`].

use crate::attendance_log::AttendanceLog;
use crate::config::Config;
use chrono::Local;
use rollcall_core::{
    FaceLocator, LocatorError, LocatorParams, ModelPaths, ModelStore, ModelStoreError,
    RecognitionFilter, ScrfdLocator, Threshold,
};
use rollcall_hw::{Camera, CameraError, FrameSource};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Why a capture loop ended before anyone asked it to.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("recognizer unavailable: {0}")]
    RecognizerUnavailable(String),
    #[error("camera disconnected: {0}")]
    CameraDisconnected(String),
    #[error("capture loop panicked: {0}")]
    LoopPanicked(String),
}

impl From<ModelStoreError> for FailureReason {
    fn from(e: ModelStoreError) -> Self {
        if e.is_recognizer_unavailable() {
            Self::RecognizerUnavailable(e.to_string())
        } else {
            Self::ModelLoad(e.to_string())
        }
    }
}

impl From<LocatorError> for FailureReason {
    fn from(e: LocatorError) -> Self {
        match e {
            LocatorError::RuntimeUnavailable(_) => Self::RecognizerUnavailable(e.to_string()),
            _ => Self::ModelLoad(e.to_string()),
        }
    }
}

/// Who asked the loop to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The session controller's `stop`.
    Caller,
    /// Operator quit on the daemon side (signal), without a caller stop.
    LocalQuit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Completed(StopReason),
    Failed(FailureReason),
}

/// Cooperative cancellation flag shared by the controller and the loop.
///
/// The first reason raised sticks.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicU8>);

const SIGNAL_CLEAR: u8 = 0;
const SIGNAL_CALLER: u8 = 1;
const SIGNAL_LOCAL_QUIT: u8 = 2;

impl StopSignal {
    /// Returns false if a stop was already raised.
    pub fn raise(&self, reason: StopReason) -> bool {
        let code = match reason {
            StopReason::Caller => SIGNAL_CALLER,
            StopReason::LocalQuit => SIGNAL_LOCAL_QUIT,
        };
        self.0
            .compare_exchange(SIGNAL_CLEAR, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self.0.load(Ordering::Acquire) {
            SIGNAL_CALLER => Some(StopReason::Caller),
            SIGNAL_LOCAL_QUIT => Some(StopReason::LocalQuit),
            _ => None,
        }
    }
}

/// Identities accepted so far in one session, plus loop progress.
///
/// Written by the loop, snapshot by the controller. The set only grows.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    inner: Arc<RosterInner>,
}

#[derive(Debug, Default)]
struct RosterInner {
    identities: Mutex<BTreeSet<String>>,
    frames: AtomicU64,
    finished: AtomicBool,
}

impl Roster {
    /// Insert an identity key; true on first sighting.
    pub fn insert(&self, id: &str) -> bool {
        let mut identities = self
            .inner
            .identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if identities.contains(id) {
            false
        } else {
            identities.insert(id.to_string())
        }
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.inner
            .identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn frames_processed(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }

    fn count_frame(&self) {
        self.inner.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Set once the loop thread has released the camera and exited.
    pub fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }
}

/// Everything a loop has to acquire during initialization.
///
/// Called from the loop thread, once per session.
pub trait CaptureResources: Send + Sync {
    fn load_model(&self) -> Result<ModelStore, ModelStoreError>;
    fn load_locator(&self) -> Result<Box<dyn FaceLocator>, LocatorError>;
    fn open_camera(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// Production resources: model files on disk, SCRFD, a V4L2 camera.
#[derive(Debug, Clone)]
pub struct DeviceResources {
    camera_device: String,
    read_timeout: Duration,
    model_paths: ModelPaths,
    detector_model: PathBuf,
    locator_params: LocatorParams,
}

impl DeviceResources {
    pub fn from_config(config: &Config) -> Self {
        Self {
            camera_device: config.camera_device.clone(),
            read_timeout: config.read_timeout,
            model_paths: config.model_paths(),
            detector_model: config.detector_model.clone(),
            locator_params: config.locator_params(),
        }
    }
}

impl CaptureResources for DeviceResources {
    fn load_model(&self) -> Result<ModelStore, ModelStoreError> {
        ModelStore::load(&self.model_paths)
    }

    fn load_locator(&self) -> Result<Box<dyn FaceLocator>, LocatorError> {
        Ok(Box::new(ScrfdLocator::load(&self.detector_model, self.locator_params)?))
    }

    fn open_camera(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.camera_device)?;
        Ok(Box::new(camera.into_stream(self.read_timeout)?))
    }
}

/// Per-session knobs that are not part of resource acquisition.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Frames discarded after the camera opens; at least one read is always attempted.
    pub warmup_frames: usize,
    pub distance_threshold: Option<f32>,
    pub equalize: bool,
    pub attendance_log: Option<PathBuf>,
}

/// Run one capture session to completion on the calling thread.
///
/// Returns when the stop signal is observed or when initialization or the
/// camera fails. The camera is released before this returns.
pub fn run_capture(
    resources: &dyn CaptureResources,
    settings: &CaptureSettings,
    signal: &StopSignal,
    roster: &Roster,
) -> CaptureOutcome {
    match capture(resources, settings, signal, roster) {
        Ok(reason) => {
            tracing::info!(
                ?reason,
                identities = roster.snapshot().len(),
                frames = roster.frames_processed(),
                "capture loop stopped"
            );
            CaptureOutcome::Completed(reason)
        }
        Err(reason) => {
            tracing::error!(
                %reason,
                identities = roster.snapshot().len(),
                frames = roster.frames_processed(),
                "capture loop failed"
            );
            CaptureOutcome::Failed(reason)
        }
    }
}

fn capture(
    resources: &dyn CaptureResources,
    settings: &CaptureSettings,
    signal: &StopSignal,
    roster: &Roster,
) -> Result<StopReason, FailureReason> {
    let store = resources.load_model()?;
    let filter = RecognitionFilter::new(Threshold::resolve(
        settings.distance_threshold,
        store.calibration(),
    )?);
    let mut locator = resources.load_locator()?;
    let mut camera = resources
        .open_camera()
        .map_err(|e| FailureReason::ResourceUnavailable(e.to_string()))?;
    warm_up(&mut *camera, settings.warmup_frames)?;

    let mut log = settings.attendance_log.as_deref().and_then(|path| {
        AttendanceLog::open(path)
            .map_err(|e| {
                tracing::warn!(path = %path.display(), error = %e, "attendance log unavailable; continuing without it");
            })
            .ok()
    });

    tracing::info!(
        threshold = filter.threshold().limit(),
        calibrated = matches!(filter.threshold(), Threshold::Calibrated(_)),
        enrolled = store.labels().len(),
        "capture loop running"
    );

    loop {
        if let Some(reason) = signal.reason() {
            return Ok(reason);
        }

        let mut frame = camera
            .read_frame()
            .map_err(|e| FailureReason::CameraDisconnected(e.to_string()))?;
        roster.count_frame();

        if frame.is_dark {
            tracing::debug!(sequence = frame.sequence, "dark frame skipped");
            continue;
        }
        if settings.equalize {
            frame.equalize();
        }

        let faces = match locator.locate(&frame.data, frame.width, frame.height) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(sequence = frame.sequence, error = %e, "face location failed; frame skipped");
                continue;
            }
        };

        for face in &faces {
            let Some(crop) = face.crop(&frame.data, frame.width, frame.height) else {
                continue;
            };
            let result = store.predict(&crop);

            match filter.accept(&result, store.labels()) {
                Some(identity) if roster.insert(&identity.id) => {
                    tracing::info!(
                        id = %identity.id,
                        name = %identity.name,
                        distance = result.distance,
                        "identity recognized"
                    );
                    if let Some(log) = log.as_mut() {
                        if let Err(e) = log.record(identity, Local::now()) {
                            tracing::warn!(path = %log.path().display(), error = %e, "attendance log write failed");
                        }
                    }
                }
                Some(identity) => {
                    tracing::debug!(
                        id = %identity.id,
                        distance = result.distance,
                        x = face.x,
                        y = face.y,
                        "already present"
                    );
                }
                None => {
                    tracing::debug!(
                        label = result.label,
                        distance = result.distance,
                        x = face.x,
                        y = face.y,
                        "unknown face"
                    );
                }
            }
        }
    }
}

/// Discard the first frames while exposure settles. The camera counts as
/// unavailable only if not a single read succeeds.
fn warm_up(camera: &mut dyn FrameSource, frames: usize) -> Result<(), FailureReason> {
    let mut good = 0;
    for _ in 0..frames.max(1) {
        match camera.read_frame() {
            Ok(_) => good += 1,
            Err(e) if good == 0 => {
                return Err(FailureReason::ResourceUnavailable(format!(
                    "camera produced no frame: {e}"
                )))
            }
            Err(e) => {
                tracing::warn!(error = %e, "warmup read failed");
                break;
            }
        }
    }
    tracing::debug!(discarded = good, "warmup complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCamera, FakeResources, ModelFixture, Scene};
    use std::sync::atomic::Ordering;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            warmup_frames: 2,
            distance_threshold: Some(50.0),
            equalize: false,
            attendance_log: None,
        }
    }

    fn run(resources: &FakeResources, settings: &CaptureSettings, signal: &StopSignal) -> (CaptureOutcome, Roster) {
        let roster = Roster::default();
        let outcome = run_capture(resources, settings, signal, &roster);
        (outcome, roster)
    }

    fn ids(roster: &Roster) -> Vec<String> {
        roster.snapshot().into_iter().collect()
    }

    #[test]
    fn test_stop_signal_first_reason_sticks() {
        let signal = StopSignal::default();
        assert_eq!(signal.reason(), None);
        assert!(signal.raise(StopReason::LocalQuit));
        assert!(!signal.raise(StopReason::Caller));
        assert_eq!(signal.reason(), Some(StopReason::LocalQuit));
    }

    #[test]
    fn test_roster_insert_is_idempotent() {
        let roster = Roster::default();
        assert!(roster.insert("S001"));
        assert!(!roster.insert("S001"));
        assert!(roster.insert("S002"));
        assert_eq!(roster.snapshot().len(), 2);
    }

    #[test]
    fn test_no_faces_yields_empty_set() {
        let signal = StopSignal::default();
        let resources = FakeResources::new({
            let signal = signal.clone();
            move || Ok(FakeCamera::new(vec![Scene::Faces(vec![])]).quit_after(20, signal.clone()))
        });

        let (outcome, roster) = run(&resources, &settings(), &signal);
        assert_eq!(outcome, CaptureOutcome::Completed(StopReason::LocalQuit));
        assert!(roster.snapshot().is_empty());
        assert!(roster.frames_processed() > 0);
    }

    #[test]
    fn test_known_faces_accepted_unknown_dropped() {
        // Label 2 is over threshold, label 3 is missing from the label map.
        let signal = StopSignal::default();
        let resources = FakeResources::new({
            let signal = signal.clone();
            move || {
                Ok(FakeCamera::new(vec![
                    Scene::Faces(vec![0, 2]),
                    Scene::Faces(vec![3, 1]),
                ])
                .quit_after(10, signal.clone()))
            }
        });

        let (outcome, roster) = run(&resources, &settings(), &signal);
        assert_eq!(outcome, CaptureOutcome::Completed(StopReason::LocalQuit));
        assert_eq!(ids(&roster), vec!["S001", "S002"]);
    }

    #[test]
    fn test_repeat_sightings_logged_once() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("attendance_log.csv");
        let settings = CaptureSettings {
            attendance_log: Some(log_path.clone()),
            ..settings()
        };

        let signal = StopSignal::default();
        let resources = FakeResources::new({
            let signal = signal.clone();
            move || Ok(FakeCamera::new(vec![Scene::Faces(vec![0])]).quit_after(25, signal.clone()))
        });

        let (_, roster) = run(&resources, &settings, &signal);
        assert_eq!(ids(&roster), vec!["S001"]);

        let log = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "identity,name,timestamp");
        assert!(lines[1].starts_with("S001,Ada Lovelace,"));
    }

    #[test]
    fn test_calibrated_threshold_applies_without_override() {
        let signal = StopSignal::default();
        let mut resources = FakeResources::new({
            let signal = signal.clone();
            move || Ok(FakeCamera::new(vec![Scene::Faces(vec![0, 1])]).quit_after(5, signal.clone()))
        });
        resources.calibration = Some(rollcall_core::Calibration {
            mean: 9.0,
            std: 2.0,
            threshold: 12.0,
        });
        let settings = CaptureSettings {
            distance_threshold: None,
            ..settings()
        };

        let (_, roster) = run(&resources, &settings, &signal);
        // Label 0 sits at distance 10, label 1 at 20.
        assert_eq!(ids(&roster), vec!["S001"]);
    }

    #[test]
    fn test_no_threshold_source_is_model_load_failure() {
        let resources = FakeResources::new(|| Ok(FakeCamera::new(vec![Scene::Faces(vec![0])])));
        let settings = CaptureSettings {
            distance_threshold: None,
            ..settings()
        };

        let (outcome, roster) = run(&resources, &settings, &StopSignal::default());
        assert!(matches!(outcome, CaptureOutcome::Failed(FailureReason::ModelLoad(_))));
        assert!(roster.snapshot().is_empty());
    }

    #[test]
    fn test_model_failures_are_classified() {
        let mut resources = FakeResources::new(|| Ok(FakeCamera::new(vec![Scene::Faces(vec![0])])));

        resources.model = ModelFixture::Missing;
        let (outcome, _) = run(&resources, &settings(), &StopSignal::default());
        assert!(matches!(outcome, CaptureOutcome::Failed(FailureReason::ModelLoad(_))));

        resources.model = ModelFixture::Unsupported;
        let (outcome, _) = run(&resources, &settings(), &StopSignal::default());
        assert!(matches!(outcome, CaptureOutcome::Failed(FailureReason::RecognizerUnavailable(_))));
    }

    #[test]
    fn test_camera_open_failure_is_resource_unavailable() {
        let resources = FakeResources::new(|| Err(CameraError::DeviceNotFound("/dev/video9".into())));
        let (outcome, roster) = run(&resources, &settings(), &StopSignal::default());
        assert!(matches!(outcome, CaptureOutcome::Failed(FailureReason::ResourceUnavailable(_))));
        assert!(roster.snapshot().is_empty());
    }

    #[test]
    fn test_camera_without_frames_is_resource_unavailable() {
        let released = Arc::new(AtomicBool::new(false));
        let resources = FakeResources::new({
            let released = released.clone();
            move || {
                Ok(FakeCamera::new(vec![Scene::Faces(vec![0])])
                    .failing_after(0)
                    .releases_into(released.clone()))
            }
        });

        let (outcome, roster) = run(&resources, &settings(), &StopSignal::default());
        assert!(matches!(outcome, CaptureOutcome::Failed(FailureReason::ResourceUnavailable(_))));
        assert!(roster.snapshot().is_empty());
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disconnect_keeps_collected_identities() {
        let released = Arc::new(AtomicBool::new(false));
        let resources = FakeResources::new({
            let released = released.clone();
            move || {
                Ok(FakeCamera::new(vec![Scene::Faces(vec![0]), Scene::Faces(vec![1])])
                    .failing_after(6)
                    .releases_into(released.clone()))
            }
        });

        // Two warmup reads, then four live frames before the device drops.
        let (outcome, roster) = run(&resources, &settings(), &StopSignal::default());
        assert!(matches!(outcome, CaptureOutcome::Failed(FailureReason::CameraDisconnected(_))));
        assert_eq!(ids(&roster), vec!["S001", "S002"]);
        assert_eq!(roster.frames_processed(), 4);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dark_frames_skip_detection() {
        let signal = StopSignal::default();
        let resources = FakeResources::new({
            let signal = signal.clone();
            move || {
                Ok(FakeCamera::new(vec![Scene::Dark, Scene::Dark, Scene::Faces(vec![1])])
                    .quit_after(4, signal.clone()))
            }
        });
        let settings = CaptureSettings {
            warmup_frames: 0,
            ..settings()
        };

        // One warmup read (a dark frame), then Dark, Faces, Dark.
        let (_, roster) = run(&resources, &settings, &signal);
        assert_eq!(roster.frames_processed(), 3);
        assert_eq!(resources.locate_calls(), 1);
        assert_eq!(ids(&roster), vec!["S002"]);
    }

    #[test]
    fn test_stop_raised_before_running_returns_immediately() {
        let signal = StopSignal::default();
        signal.raise(StopReason::Caller);
        let resources = FakeResources::new(|| Ok(FakeCamera::new(vec![Scene::Faces(vec![0])])));

        let (outcome, roster) = run(&resources, &settings(), &signal);
        assert_eq!(outcome, CaptureOutcome::Completed(StopReason::Caller));
        assert_eq!(roster.frames_processed(), 0);
    }

    #[test]
    fn test_failure_reason_serializes_with_kind() {
        let json = serde_json::to_value(FailureReason::CameraDisconnected("gone".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "camera_disconnected", "detail": "gone"}));
    }
}
