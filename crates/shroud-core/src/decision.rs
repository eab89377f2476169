//! Decision engine.
//!
//! Turns raw classifier scores and detected faces into a [`DetectionResult`].
//! Engine failures never escape: they become an `error` verdict.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::{debug, warn};

use crate::engine::ClassifierInput;
use crate::error::InferenceError;
use crate::models::LoadedModels;
use crate::types::{DetectedFace, DetectionOptions, DetectionResult, Gender, Verdict};

/// Gender score a face needs before its gender is trusted.
pub const GENDER_SCORE_THRESHOLD: f32 = 0.5;

/// Classes of the 5-class classifier.
pub const FIVE_CLASS_LABELS: [&str; 5] = ["drawing", "hentai", "neutral", "porn", "sexy"];

/// Indices of the unsafe classes in the 5-class output.
const FIVE_CLASS_UNSAFE: [usize; 3] = [1, 3, 4];

/// Runs the requested engines over `image` and decides a verdict.
pub fn classify(
    models: &mut LoadedModels,
    image: &RgbaImage,
    options: &DetectionOptions,
) -> DetectionResult {
    match run(models, image, options) {
        Ok(result) => result,
        Err(e) => {
            warn!("Classification failed: {}", e);
            DetectionResult::error(e.to_string())
        }
    }
}

fn run(
    models: &mut LoadedModels,
    image: &RgbaImage,
    options: &DetectionOptions,
) -> Result<DetectionResult, InferenceError> {
    let mut result = DetectionResult::default();
    let mut nsfw = false;
    let mut face = false;

    if options.detect_nsfw {
        let input = prepare_input(image, models.classifier.input_size())?;
        let scores = models.classifier.predict(&input)?;
        nsfw = is_unsafe(&scores, options.threshold());
        debug!(?scores, nsfw, "Classifier scores");
        result.details.nsfw_scores = Some(scores);
    }

    if options.detect_gender {
        let faces = models.detector.detect(image)?;
        if !faces.is_empty() {
            result.gender = Some(dominant_gender(&faces));
            face = face_triggered(&faces, options);
        }
        result.details.face_count = Some(faces.len());
        result.details.faces = Some(faces);
    }

    result.result = if nsfw {
        Verdict::Nsfw
    } else if face {
        Verdict::Face
    } else {
        Verdict::Clear
    };

    Ok(result)
}

/// Resizes `image` (bilinear) to a square classifier input with RGB in [0, 1].
pub fn prepare_input(image: &RgbaImage, size: u32) -> Result<ClassifierInput, InferenceError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(InferenceError::Image("image has no pixels".to_string()));
    }
    if size == 0 {
        return Err(InferenceError::Image(
            "classifier input size is zero".to_string(),
        ));
    }

    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    let mut data = Vec::with_capacity(size as usize * size as usize * 3);
    for pixel in resized.pixels() {
        let [r, g, b, _] = pixel.0;
        data.push(r as f32 / 255.0);
        data.push(g as f32 / 255.0);
        data.push(b as f32 / 255.0);
    }

    Ok(ClassifierInput { size, data })
}

/// Applies the strictness threshold to a score vector.
///
/// Vectors that are neither 2-class nor 5-class are never unsafe.
pub fn is_unsafe(scores: &[f32], strictness: f32) -> bool {
    match scores.len() {
        2 => scores[1] > strictness,
        5 => FIVE_CLASS_UNSAFE.iter().any(|&i| scores[i] > strictness),
        n => {
            warn!("Unexpected classifier output length {}", n);
            false
        }
    }
}

/// Highest unsafe-class probability in a score vector.
///
/// Unknown layouts fall back to the highest score overall.
pub fn unsafe_score(scores: &[f32]) -> Option<f32> {
    match scores.len() {
        0 => None,
        2 => Some(scores[1]),
        5 => FIVE_CLASS_UNSAFE.iter().map(|&i| scores[i]).reduce(f32::max),
        _ => scores.iter().copied().reduce(f32::max),
    }
}

/// Gender of the face with the highest gender score.
///
/// Ties go to the first face. A score at or below the threshold reports
/// `unknown`.
pub fn dominant_gender(faces: &[DetectedFace]) -> Gender {
    let mut best: Option<&DetectedFace> = None;
    for face in faces {
        if best.map_or(true, |b| face.gender_score > b.gender_score) {
            best = Some(face);
        }
    }

    match best {
        Some(face) if face.gender_score > GENDER_SCORE_THRESHOLD => face.gender,
        _ => Gender::Unknown,
    }
}

/// Whether any face satisfies the requested gender filters.
pub fn face_triggered(faces: &[DetectedFace], options: &DetectionOptions) -> bool {
    let any_face = !options.detect_male && !options.detect_female;
    faces.iter().any(|face| {
        let trusted = face.gender_score > GENDER_SCORE_THRESHOLD;
        any_face
            || (options.detect_male && trusted && face.gender == Gender::Male)
            || (options.detect_female && trusted && face.gender == Gender::Female)
    })
}
