//! Inference engine contract.
//!
//! The pipeline never implements model numerics itself. It talks to one image
//! classifier and one face analyzer through these traits; the ONNX-backed
//! implementations live in [`crate::onnx`] and tests supply their own.

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, ModelLoadError};
use crate::types::DetectedFace;

/// Classifier input: a single image, NHWC, RGB channels normalized to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierInput {
    /// Width and height of the (square) input.
    pub size: u32,
    /// `size * size * 3` values, row-major, RGB interleaved.
    pub data: Vec<f32>,
}

impl ClassifierInput {
    /// A zeroed input, used for the warm-up pass.
    pub fn zeros(size: u32) -> Self {
        let len = size as usize * size as usize * 3;
        Self {
            size,
            data: vec![0.0; len],
        }
    }

    /// Shape in NHWC order.
    pub fn shape(&self) -> [usize; 4] {
        [1, self.size as usize, self.size as usize, 3]
    }
}

/// NSFW image classifier engine.
pub trait ImageClassifier: Send {
    /// Square input size expected by the model (e.g. 224).
    fn input_size(&self) -> u32;

    /// Runs the model and returns class probabilities.
    ///
    /// Two classes are `{safe, unsafe}`; five classes are
    /// `{drawing, hentai, neutral, porn, sexy}`.
    fn predict(&mut self, input: &ClassifierInput) -> Result<Vec<f32>, InferenceError>;
}

/// Face and attribute detector engine.
pub trait FaceAnalyzer: Send {
    /// Detects faces and their gender attribute.
    ///
    /// Implementations apply their own confidence threshold; every returned
    /// face is considered detected.
    fn detect(&mut self, image: &RgbaImage) -> Result<Vec<DetectedFace>, InferenceError>;
}

/// Configuration handed to [`EngineFactory::load_detector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceDetectorConfig {
    /// Path or URI of the face detection model.
    pub detector_model: String,
    /// Path or URI of the gender classification model.
    pub gender_model: String,
    /// Maximum number of faces reported per image (default: 2).
    pub max_detected: usize,
    /// Minimum face detection confidence (default: 0.25).
    pub min_confidence: f32,
    /// IoU above which overlapping detections are suppressed (default: 0.3).
    pub iou_threshold: f32,
}

impl Default for FaceDetectorConfig {
    fn default() -> Self {
        let (detector_model, gender_model) = match crate::model_downloader::ModelDownloader::new() {
            Some(d) => (
                d.face_detector_path().to_string_lossy().to_string(),
                d.gender_model_path().to_string_lossy().to_string(),
            ),
            None => (
                "models/face_detector.onnx".to_string(),
                "models/gender_classifier.onnx".to_string(),
            ),
        };

        Self {
            detector_model,
            gender_model,
            max_detected: 2,
            min_confidence: 0.25,
            iou_threshold: 0.3,
        }
    }
}

/// Constructs the two engines.
///
/// Constructors run on a blocking thread and may read files or build
/// runtime sessions.
pub trait EngineFactory: Send + Sync {
    /// Builds the classifier from raw model weights.
    fn load_classifier(&self, weights: &[u8]) -> Result<Box<dyn ImageClassifier>, ModelLoadError>;

    /// Builds the face analyzer.
    fn load_detector(
        &self,
        config: &FaceDetectorConfig,
    ) -> Result<Box<dyn FaceAnalyzer>, ModelLoadError>;
}
