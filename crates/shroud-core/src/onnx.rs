//! ONNX Runtime engines.
//!
//! The classifier is built from in-memory weights (so they can come from the
//! weight store). The face analyzer pairs an UltraFace RFB-320 detector with a
//! GoogLeNet gender classifier run on each face crop. Without the `ml`
//! feature every constructor returns [`ModelLoadError::MlNotEnabled`].

use serde::{Deserialize, Serialize};

use crate::engine::{EngineFactory, FaceAnalyzer, FaceDetectorConfig, ImageClassifier};
use crate::error::ModelLoadError;
use crate::types::FaceBox;

/// UltraFace RFB-320 input width.
pub const DETECTOR_INPUT_WIDTH: u32 = 320;
/// UltraFace RFB-320 input height.
pub const DETECTOR_INPUT_HEIGHT: u32 = 240;
/// GoogLeNet gender classifier input size.
pub const GENDER_INPUT_SIZE: u32 = 224;

/// Per-channel BGR means for the gender classifier (0-255 scale).
const GENDER_MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];

/// Preprocessing for the image classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Square input size (default: 224).
    pub input_size: u32,
    /// Per-channel RGB mean subtracted after scaling to [0, 1].
    pub mean: [f32; 3],
    /// Per-channel RGB standard deviation.
    pub std: [f32; 3],
    /// Apply softmax to the raw output (the default model emits logits).
    pub softmax: bool,
    /// Intra-op threads for the session.
    pub threads: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            // ImageNet statistics
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            softmax: true,
            threads: 2,
        }
    }
}

/// Builds the ONNX-backed classifier and face analyzer.
#[derive(Debug, Clone, Default)]
pub struct OnnxEngineFactory {
    pub classifier: ClassifierConfig,
}

impl OnnxEngineFactory {
    pub fn new(classifier: ClassifierConfig) -> Self {
        Self { classifier }
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    exp_vals.iter().map(|x| x / sum).collect()
}

/// Converts interleaved RGB values to planar CHW, applying `(v - mean) / std`.
pub fn to_planar(interleaved: &[f32], mean: [f32; 3], std: [f32; 3]) -> Vec<f32> {
    let plane = interleaved.len() / 3;
    let mut planar = vec![0.0f32; interleaved.len()];
    for (i, pixel) in interleaved.chunks_exact(3).enumerate() {
        for c in 0..3 {
            planar[c * plane + i] = (pixel[c] - mean[c]) / std[c];
        }
    }
    planar
}

/// Intersection over union of two boxes.
pub fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = a.width * a.height + b.width * b.height - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy non-maximum suppression over `(box, confidence)` pairs.
///
/// Returns at most `limit` boxes, most confident first.
pub fn non_maximum_suppression(
    mut candidates: Vec<(FaceBox, f32)>,
    iou_threshold: f32,
    limit: usize,
) -> Vec<(FaceBox, f32)> {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(FaceBox, f32)> = Vec::new();
    for candidate in candidates {
        if keep.len() >= limit {
            break;
        }
        if keep
            .iter()
            .all(|kept| iou(&kept.0, &candidate.0) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(feature = "ml")]
mod runtime {
    use image::imageops::{self, FilterType};
    use image::RgbaImage;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;
    use tracing::debug;

    use super::*;
    use crate::engine::ClassifierInput;
    use crate::error::InferenceError;
    use crate::types::{DetectedFace, Gender};

    fn engine_error(e: impl std::fmt::Display) -> ModelLoadError {
        ModelLoadError::Engine(e.to_string())
    }

    fn builder(threads: usize) -> Result<ort::session::builder::SessionBuilder, ModelLoadError> {
        Session::builder()
            .map_err(engine_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(engine_error)?
            .with_intra_threads(threads)
            .map_err(engine_error)
    }

    fn run_single(session: &mut Session, shape: [usize; 4], data: Vec<f32>) -> Result<Vec<f32>, InferenceError> {
        let tensor = Tensor::from_array((shape, data.into_boxed_slice()))?;
        let outputs = session.run(ort::inputs![tensor])?;
        let (_, values) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(values.to_vec())
    }

    pub struct OnnxClassifier {
        session: Session,
        config: ClassifierConfig,
    }

    impl OnnxClassifier {
        pub fn from_memory(weights: &[u8], config: ClassifierConfig) -> Result<Self, ModelLoadError> {
            let session = builder(config.threads)?
                .commit_from_memory(weights)
                .map_err(engine_error)?;
            Ok(Self { session, config })
        }
    }

    impl ImageClassifier for OnnxClassifier {
        fn input_size(&self) -> u32 {
            self.config.input_size
        }

        fn predict(&mut self, input: &ClassifierInput) -> Result<Vec<f32>, InferenceError> {
            if input.size != self.config.input_size {
                return Err(InferenceError::Image(format!(
                    "expected {0}x{0} input, got {1}x{1}",
                    self.config.input_size, input.size
                )));
            }

            let size = input.size as usize;
            let planar = to_planar(&input.data, self.config.mean, self.config.std);
            let raw = run_single(&mut self.session, [1, 3, size, size], planar)?;

            Ok(if self.config.softmax {
                softmax(&raw)
            } else {
                raw
            })
        }
    }

    /// UltraFace detector plus per-face gender classifier.
    pub struct OnnxFaceAnalyzer {
        detector: Session,
        gender: Session,
        config: FaceDetectorConfig,
    }

    impl OnnxFaceAnalyzer {
        pub fn new(config: &FaceDetectorConfig) -> Result<Self, ModelLoadError> {
            let detector = builder(1)?
                .commit_from_file(&config.detector_model)
                .map_err(engine_error)?;
            let gender = builder(1)?
                .commit_from_file(&config.gender_model)
                .map_err(engine_error)?;

            Ok(Self {
                detector,
                gender,
                config: config.clone(),
            })
        }

        fn locate(&mut self, image: &RgbaImage) -> Result<Vec<(FaceBox, f32)>, InferenceError> {
            let (w, h) = (DETECTOR_INPUT_WIDTH, DETECTOR_INPUT_HEIGHT);
            let min_confidence = self.config.min_confidence;
            let resized = imageops::resize(image, w, h, FilterType::Triangle);

            let plane = (w * h) as usize;
            let mut data = vec![0.0f32; plane * 3];
            for (i, pixel) in resized.pixels().enumerate() {
                for c in 0..3 {
                    data[c * plane + i] = (pixel[c] as f32 - 127.0) / 128.0;
                }
            }

            let tensor = Tensor::from_array(([1usize, 3, h as usize, w as usize], data.into_boxed_slice()))?;
            let outputs = self.detector.run(ort::inputs![tensor])?;

            let scores = outputs
                .get("scores")
                .ok_or_else(|| InferenceError::Output("scores output not found".to_string()))?;
            let boxes = outputs
                .get("boxes")
                .ok_or_else(|| InferenceError::Output("boxes output not found".to_string()))?;
            let (_, scores) = scores.try_extract_tensor::<f32>()?;
            let (_, boxes) = boxes.try_extract_tensor::<f32>()?;

            if scores.len() / 2 != boxes.len() / 4 {
                return Err(InferenceError::Output(format!(
                    "{} scores for {} boxes",
                    scores.len() / 2,
                    boxes.len() / 4
                )));
            }

            let (img_w, img_h) = (image.width() as f32, image.height() as f32);
            let candidates = scores
                .chunks_exact(2)
                .zip(boxes.chunks_exact(4))
                .filter(|(score, _)| score[1] > min_confidence)
                .map(|(score, b)| {
                    let x1 = b[0].clamp(0.0, 1.0) * img_w;
                    let y1 = b[1].clamp(0.0, 1.0) * img_h;
                    let x2 = b[2].clamp(0.0, 1.0) * img_w;
                    let y2 = b[3].clamp(0.0, 1.0) * img_h;
                    let bbox = FaceBox {
                        x: x1,
                        y: y1,
                        width: (x2 - x1).max(0.0),
                        height: (y2 - y1).max(0.0),
                    };
                    (bbox, score[1])
                })
                .collect();

            Ok(non_maximum_suppression(
                candidates,
                self.config.iou_threshold,
                self.config.max_detected,
            ))
        }

        fn classify_gender(&mut self, image: &RgbaImage, bbox: &FaceBox) -> Result<(Gender, f32), InferenceError> {
            let x = bbox.x.max(0.0) as u32;
            let y = bbox.y.max(0.0) as u32;
            let width = (bbox.width as u32).min(image.width().saturating_sub(x));
            let height = (bbox.height as u32).min(image.height().saturating_sub(y));
            if width == 0 || height == 0 {
                return Ok((Gender::Unknown, 0.0));
            }

            let crop = imageops::crop_imm(image, x, y, width, height).to_image();
            let size = GENDER_INPUT_SIZE;
            let resized = imageops::resize(&crop, size, size, FilterType::Triangle);

            let plane = (size * size) as usize;
            let mut data = vec![0.0f32; plane * 3];
            for (i, pixel) in resized.pixels().enumerate() {
                // BGR order, mean subtracted, 0-255 scale
                data[i] = pixel[2] as f32 - GENDER_MEAN_BGR[0];
                data[plane + i] = pixel[1] as f32 - GENDER_MEAN_BGR[1];
                data[2 * plane + i] = pixel[0] as f32 - GENDER_MEAN_BGR[2];
            }

            let mut probs = run_single(&mut self.gender, [1, 3, size as usize, size as usize], data)?;
            if probs.len() != 2 {
                return Err(InferenceError::Output(format!(
                    "gender model returned {} values",
                    probs.len()
                )));
            }
            if (probs.iter().sum::<f32>() - 1.0).abs() > 1e-3 {
                probs = softmax(&probs);
            }

            Ok(if probs[0] >= probs[1] {
                (Gender::Male, probs[0])
            } else {
                (Gender::Female, probs[1])
            })
        }
    }

    impl FaceAnalyzer for OnnxFaceAnalyzer {
        fn detect(&mut self, image: &RgbaImage) -> Result<Vec<DetectedFace>, InferenceError> {
            if image.width() == 0 || image.height() == 0 {
                return Ok(Vec::new());
            }

            let located = self.locate(image)?;
            debug!(faces = located.len(), "Face detector finished");

            let mut faces = Vec::with_capacity(located.len());
            for (bbox, confidence) in located {
                let (gender, gender_score) = self.classify_gender(image, &bbox)?;
                faces.push(DetectedFace {
                    gender,
                    gender_score,
                    confidence,
                    bbox,
                });
            }
            Ok(faces)
        }
    }
}

#[cfg(feature = "ml")]
pub use runtime::{OnnxClassifier, OnnxFaceAnalyzer};

impl EngineFactory for OnnxEngineFactory {
    #[cfg(feature = "ml")]
    fn load_classifier(&self, weights: &[u8]) -> Result<Box<dyn ImageClassifier>, ModelLoadError> {
        Ok(Box::new(OnnxClassifier::from_memory(weights, self.classifier.clone())?))
    }

    #[cfg(not(feature = "ml"))]
    fn load_classifier(&self, _weights: &[u8]) -> Result<Box<dyn ImageClassifier>, ModelLoadError> {
        Err(ModelLoadError::MlNotEnabled)
    }

    #[cfg(feature = "ml")]
    fn load_detector(&self, config: &FaceDetectorConfig) -> Result<Box<dyn FaceAnalyzer>, ModelLoadError> {
        Ok(Box::new(OnnxFaceAnalyzer::new(config)?))
    }

    #[cfg(not(feature = "ml"))]
    fn load_detector(&self, _config: &FaceDetectorConfig) -> Result<Box<dyn FaceAnalyzer>, ModelLoadError> {
        Err(ModelLoadError::MlNotEnabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f32, y: f32, side: f32) -> FaceBox {
        FaceBox {
            x,
            y,
            width: side,
            height: side,
        }
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn planar_layout_and_normalization() {
        let planar = to_planar(&[0.5, 0.2, 0.1, 1.0, 0.4, 0.3], [0.0; 3], [0.5; 3]);
        assert_eq!(planar, vec![1.0, 2.0, 0.4, 0.8, 0.2, 0.6]);
    }

    #[test]
    fn iou_of_overlapping_boxes() {
        assert_eq!(iou(&square(0.0, 0.0, 10.0), &square(0.0, 0.0, 10.0)), 1.0);
        assert_eq!(iou(&square(0.0, 0.0, 10.0), &square(20.0, 20.0, 5.0)), 0.0);
        let half = iou(&square(0.0, 0.0, 10.0), &square(5.0, 0.0, 10.0));
        assert!((half - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_most_confident_and_respects_limit() {
        let kept = non_maximum_suppression(
            vec![
                (square(0.0, 0.0, 10.0), 0.6),
                (square(1.0, 1.0, 10.0), 0.9),
                (square(50.0, 50.0, 10.0), 0.7),
                (square(100.0, 100.0, 10.0), 0.5),
            ],
            0.3,
            2,
        );

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].1, 0.9);
        assert_eq!(kept[1].1, 0.7);
    }

    #[cfg(not(feature = "ml"))]
    #[test]
    fn constructors_require_ml_feature() {
        let factory = OnnxEngineFactory::default();
        assert!(matches!(
            factory.load_classifier(b"weights"),
            Err(ModelLoadError::MlNotEnabled)
        ));
        assert!(matches!(
            factory.load_detector(&FaceDetectorConfig::default()),
            Err(ModelLoadError::MlNotEnabled)
        ));
    }
}
