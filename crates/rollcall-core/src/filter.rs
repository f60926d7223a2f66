//! Recognition Filter — distance threshold and identity acceptance.

use crate::labels::LabelMap;
use crate::model_store::{read_artifact, ModelStoreError};
use crate::types::{Identity, RecognitionResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Calibration spread used by training: threshold = mean + 1.5 σ.
pub const CALIBRATION_SIGMAS: f32 = 1.5;

/// Relative disagreement between stored and recomputed thresholds worth a warning.
const CALIBRATION_DRIFT: f32 = 0.01;

/// Training-set distance statistics persisted next to the model (`threshold.json`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub mean: f32,
    pub std: f32,
    pub threshold: f32,
}

impl Calibration {
    /// Compute calibration from self-prediction distances over the training set.
    pub fn from_distances(distances: &[f32]) -> Option<Self> {
        if distances.is_empty() {
            return None;
        }
        let n = distances.len() as f32;
        let mean = distances.iter().sum::<f32>() / n;
        let std = (distances.iter().map(|d| (d - mean).powi(2)).sum::<f32>() / n).sqrt();
        Some(Self {
            mean,
            std,
            threshold: mean + CALIBRATION_SIGMAS * std,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ModelStoreError> {
        let raw = read_artifact(path, "calibration file")?;
        let calibration: Self =
            serde_json::from_str(&raw).map_err(|source| ModelStoreError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        if !calibration.threshold.is_finite() || calibration.threshold <= 0.0 {
            return Err(ModelStoreError::Invalid {
                path: path.display().to_string(),
                reason: format!("threshold must be a positive number, got {}", calibration.threshold),
            });
        }

        let expected = calibration.mean + CALIBRATION_SIGMAS * calibration.std;
        if (expected - calibration.threshold).abs() > CALIBRATION_DRIFT * calibration.threshold {
            tracing::warn!(
                stored = calibration.threshold,
                recomputed = expected,
                "calibration threshold disagrees with mean + 1.5σ; using the stored value"
            );
        }
        Ok(calibration)
    }
}

/// The active acceptance limit and where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// Operator-provided distance limit.
    Fixed(f32),
    /// Limit persisted by training.
    Calibrated(Calibration),
}

impl Threshold {
    /// Pick the threshold for a session: an explicit override wins, then the
    /// model's calibration. With neither there is no threshold and loading fails.
    pub fn resolve(
        explicit: Option<f32>,
        calibration: Option<&Calibration>,
    ) -> Result<Self, ModelStoreError> {
        match (explicit, calibration) {
            (Some(limit), calibration) => {
                if !limit.is_finite() || limit < 0.0 {
                    return Err(ModelStoreError::Invalid {
                        path: "ROLLCALL_DISTANCE_THRESHOLD".into(),
                        reason: format!("must be a non-negative number, got {limit}"),
                    });
                }
                if let Some(c) = calibration {
                    tracing::info!(
                        fixed = limit,
                        calibrated = c.threshold,
                        "explicit distance threshold overrides calibration"
                    );
                }
                Ok(Self::Fixed(limit))
            }
            (None, Some(c)) => Ok(Self::Calibrated(*c)),
            (None, None) => Err(ModelStoreError::NoThreshold),
        }
    }

    pub fn limit(&self) -> f32 {
        match self {
            Self::Fixed(limit) => *limit,
            Self::Calibrated(c) => c.threshold,
        }
    }
}

/// Decides whether a prediction names an enrolled identity.
#[derive(Debug, Clone, Copy)]
pub struct RecognitionFilter {
    threshold: Threshold,
}

impl RecognitionFilter {
    pub fn new(threshold: Threshold) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> &Threshold {
        &self.threshold
    }

    /// Accept iff `distance <= limit` and the label is in the map.
    ///
    /// NaN distances never pass. Anything rejected here is "unknown"; it is not
    /// an error.
    pub fn accept<'a>(&self, result: &RecognitionResult, labels: &'a LabelMap) -> Option<&'a Identity> {
        if result.distance <= self.threshold.limit() {
            labels.get(result.label)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelMap {
        LabelMap::from_entries([
            (0, Identity { id: "S001".into(), name: "Ada".into() }),
            (1, Identity { id: "S002".into(), name: "Grace".into() }),
        ])
    }

    fn result(label: i32, distance: f32) -> RecognitionResult {
        RecognitionResult { label, distance }
    }

    #[test]
    fn test_accept_at_and_below_limit() {
        let filter = RecognitionFilter::new(Threshold::Fixed(60.0));
        let labels = labels();
        assert_eq!(filter.accept(&result(0, 12.5), &labels).unwrap().id, "S001");
        assert_eq!(filter.accept(&result(1, 60.0), &labels).unwrap().id, "S002");
        assert!(filter.accept(&result(1, 60.01), &labels).is_none());
    }

    #[test]
    fn test_unknown_label_never_accepted() {
        let filter = RecognitionFilter::new(Threshold::Fixed(f32::MAX));
        assert!(filter.accept(&result(7, 0.0), &labels()).is_none());
        assert!(filter.accept(&result(-1, 0.0), &labels()).is_none());
    }

    #[test]
    fn test_nan_distance_rejected() {
        let filter = RecognitionFilter::new(Threshold::Fixed(100.0));
        assert!(filter.accept(&result(0, f32::NAN), &labels()).is_none());
    }

    #[test]
    fn test_raising_threshold_only_adds() {
        let labels = labels();
        let results: Vec<_> = [3.0, 20.0, 45.0, 45.5, 80.0, 200.0]
            .iter()
            .enumerate()
            .map(|(i, &d)| result((i % 2) as i32, d))
            .collect();

        let accepted_at = |limit: f32| -> Vec<usize> {
            let filter = RecognitionFilter::new(Threshold::Fixed(limit));
            results
                .iter()
                .enumerate()
                .filter(|(_, r)| filter.accept(r, &labels).is_some())
                .map(|(i, _)| i)
                .collect()
        };

        let mut previous = Vec::new();
        for limit in [0.0, 10.0, 45.0, 45.5, 100.0, 1000.0] {
            let now = accepted_at(limit);
            assert!(previous.iter().all(|i| now.contains(i)), "limit {limit} dropped an identity");
            previous = now;
        }
        assert_eq!(previous.len(), results.len());
    }

    #[test]
    fn test_calibration_from_distances() {
        let c = Calibration::from_distances(&[10.0, 20.0, 30.0]).unwrap();
        assert!((c.mean - 20.0).abs() < 1e-5);
        let std = (200.0f32 / 3.0).sqrt();
        assert!((c.std - std).abs() < 1e-4);
        assert!((c.threshold - (20.0 + 1.5 * std)).abs() < 1e-4);
        assert!(Calibration::from_distances(&[]).is_none());
    }

    #[test]
    fn test_resolve_precedence() {
        let c = Calibration { mean: 40.0, std: 4.0, threshold: 46.0 };

        assert_eq!(Threshold::resolve(Some(55.0), Some(&c)).unwrap(), Threshold::Fixed(55.0));
        assert_eq!(Threshold::resolve(None, Some(&c)).unwrap().limit(), 46.0);
        assert!(matches!(Threshold::resolve(None, None), Err(ModelStoreError::NoThreshold)));
        assert!(Threshold::resolve(Some(f32::NAN), None).is_err());
    }

    #[test]
    fn test_load_calibration_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threshold.json");

        std::fs::write(&path, r#"{"mean": 40.0, "std": 4.0, "threshold": 46.0}"#).unwrap();
        assert_eq!(Calibration::load(&path).unwrap().threshold, 46.0);

        std::fs::write(&path, r#"{"mean": 40.0, "std": 4.0, "threshold": -1.0}"#).unwrap();
        assert!(matches!(Calibration::load(&path), Err(ModelStoreError::Invalid { .. })));

        std::fs::write(&path, "46.0").unwrap();
        assert!(matches!(Calibration::load(&path), Err(ModelStoreError::Parse { .. })));
    }
}
