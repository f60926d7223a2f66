//! Scripted stand-ins for the camera, locator and recognizer.
//!
//! Frames are 64x64 mid-gray. A face with label `l` is a 16x16 block of
//! intensity `20 + 40 * l` in one of three fixed slots; the fake locator finds
//! blocks that differ from the background and the fake recognizer reads the
//! label back from the block's mean intensity.

use crate::engine::{CaptureResources, StopReason, StopSignal};
use image::GrayImage;
use rollcall_core::{
    Calibration, FaceCandidate, FaceLocator, Identity, LabelMap, LocatorError, ModelStore,
    ModelStoreError, RecognitionResult, Recognizer,
};
use rollcall_hw::{CameraError, Frame, FrameSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SIDE: u32 = 64;
const FACE: u32 = 16;
const BACKGROUND: u8 = 128;
const SLOTS: [(u32, u32); 3] = [(2, 24), (24, 24), (46, 24)];

fn intensity(label: i32) -> u8 {
    (20 + 40 * label).clamp(0, 255) as u8
}

#[derive(Debug, Clone)]
pub enum Scene {
    /// Labels painted into the slots, left to right (at most three).
    Faces(Vec<i32>),
    Dark,
}

impl Scene {
    fn render(&self, sequence: u32) -> Frame {
        let mut data = vec![BACKGROUND; (SIDE * SIDE) as usize];
        match self {
            Scene::Dark => data.fill(0),
            Scene::Faces(labels) => {
                for (&label, &(sx, sy)) in labels.iter().zip(SLOTS.iter()) {
                    for y in sy..sy + FACE {
                        for x in sx..sx + FACE {
                            data[(y * SIDE + x) as usize] = intensity(label);
                        }
                    }
                }
            }
        }
        Frame::from_gray(data, SIDE, SIDE, sequence)
    }
}

/// Cycles through its scenes forever unless told to fail.
pub struct FakeCamera {
    scenes: Vec<Scene>,
    reads: usize,
    fail_after: Option<usize>,
    quit_after: Option<(usize, StopSignal)>,
    delay: Duration,
    released: Option<Arc<AtomicBool>>,
}

impl FakeCamera {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self {
            scenes,
            reads: 0,
            fail_after: None,
            quit_after: None,
            delay: Duration::ZERO,
            released: None,
        }
    }

    /// The first `n` reads succeed, every later one fails.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Raise a local quit once the `n`-th read has been delivered.
    pub fn quit_after(mut self, n: usize, signal: StopSignal) -> Self {
        self.quit_after = Some((n, signal));
        self
    }

    /// Every read blocks this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set `flag` when the camera is dropped.
    pub fn releases_into(mut self, flag: Arc<AtomicBool>) -> Self {
        self.released = Some(flag);
        self
    }
}

impl FrameSource for FakeCamera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_after.is_some_and(|n| self.reads >= n) {
            return Err(CameraError::CaptureFailed("device unplugged".into()));
        }

        let scene = &self.scenes[self.reads % self.scenes.len()];
        let frame = scene.render(self.reads as u32);
        self.reads += 1;

        if let Some((n, signal)) = &self.quit_after {
            if self.reads == *n {
                signal.raise(StopReason::LocalQuit);
            }
        }
        Ok(frame)
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        if let Some(flag) = &self.released {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Reports every slot whose centre pixel differs from the background.
pub struct FakeLocator {
    calls: Arc<AtomicUsize>,
    panics: bool,
}

impl FaceLocator for FakeLocator {
    fn locate(&mut self, gray: &[u8], width: u32, _height: u32) -> Result<Vec<FaceCandidate>, LocatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("locator blew up");
        }
        Ok(SLOTS
            .iter()
            .filter(|&&(sx, sy)| {
                let centre = ((sy + FACE / 2) * width + sx + FACE / 2) as usize;
                gray[centre] != BACKGROUND
            })
            .map(|&(sx, sy)| FaceCandidate {
                x: sx as f32,
                y: sy as f32,
                width: FACE as f32,
                height: FACE as f32,
                confidence: 0.9,
            })
            .collect())
    }
}

/// Decodes the label from mean intensity; distances come from a table.
pub struct FakeRecognizer {
    distances: HashMap<i32, f32>,
}

impl Recognizer for FakeRecognizer {
    fn face_size(&self) -> (u32, u32) {
        (FACE, FACE)
    }

    fn predict(&self, face: &GrayImage) -> RecognitionResult {
        let pixels = face.as_raw();
        let mean = pixels.iter().map(|&p| p as f32).sum::<f32>() / pixels.len().max(1) as f32;
        let label = ((mean - 20.0) / 40.0).round() as i32;
        RecognitionResult {
            label,
            distance: self.distances.get(&label).copied().unwrap_or(1000.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFixture {
    Fake,
    Missing,
    Unsupported,
}

type CameraFactory = Box<dyn Fn() -> Result<FakeCamera, CameraError> + Send + Sync>;

/// Label map: 0 → S001, 1 → S002, 2 → S003. Label 3 is trained but unnamed.
/// Distances: 0 → 10, 1 → 20, 2 → 90, 3 → 5.
pub struct FakeResources {
    pub model: ModelFixture,
    pub calibration: Option<Calibration>,
    pub locator_panics: bool,
    camera: CameraFactory,
    locate_calls: Arc<AtomicUsize>,
}

impl FakeResources {
    pub fn new(camera: impl Fn() -> Result<FakeCamera, CameraError> + Send + Sync + 'static) -> Self {
        Self {
            model: ModelFixture::Fake,
            calibration: None,
            locator_panics: false,
            camera: Box::new(camera),
            locate_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn locate_calls(&self) -> usize {
        self.locate_calls.load(Ordering::SeqCst)
    }
}

pub fn label_map() -> LabelMap {
    let identity = |id: &str, name: &str| Identity {
        id: id.into(),
        name: name.into(),
    };
    LabelMap::from_entries([
        (0, identity("S001", "Ada Lovelace")),
        (1, identity("S002", "Grace Hopper")),
        (2, identity("S003", "Alan Turing")),
    ])
}

impl CaptureResources for FakeResources {
    fn load_model(&self) -> Result<ModelStore, ModelStoreError> {
        match self.model {
            ModelFixture::Fake => {
                let recognizer = FakeRecognizer {
                    distances: HashMap::from([(0, 10.0), (1, 20.0), (2, 90.0), (3, 5.0)]),
                };
                Ok(ModelStore::from_parts(Box::new(recognizer), label_map(), self.calibration))
            }
            ModelFixture::Missing => Err(ModelStoreError::NotFound {
                what: "recognition model",
                path: "models/face_recognizer.json".into(),
            }),
            ModelFixture::Unsupported => Err(ModelStoreError::RecognizerUnavailable("fisherfaces".into())),
        }
    }

    fn load_locator(&self) -> Result<Box<dyn FaceLocator>, LocatorError> {
        Ok(Box::new(FakeLocator {
            calls: self.locate_calls.clone(),
            panics: self.locator_panics,
        }))
    }

    fn open_camera(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        Ok(Box::new((self.camera)()?))
    }
}
