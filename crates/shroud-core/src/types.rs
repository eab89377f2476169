//! Request options and detection results.

use serde::{Deserialize, Serialize};

/// Default strictness threshold for unsafe-class scores.
pub const DEFAULT_STRICTNESS: f32 = 0.5;

fn default_strictness() -> f32 {
    DEFAULT_STRICTNESS
}

/// Options for a single detection request.
///
/// Field order is part of the cache fingerprint (see [`crate::cache`]), so
/// new fields must be appended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionOptions {
    /// Run the NSFW image classifier.
    #[serde(default)]
    pub detect_nsfw: bool,
    /// Run the face/attribute detector.
    #[serde(default)]
    pub detect_gender: bool,
    /// Only male faces trigger the `face` verdict.
    #[serde(default)]
    pub detect_male: bool,
    /// Only female faces trigger the `face` verdict.
    #[serde(default)]
    pub detect_female: bool,
    /// Unsafe-class score threshold (0.0 to 1.0, default 0.5).
    #[serde(default = "default_strictness")]
    pub strictness: f32,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            detect_nsfw: false,
            detect_gender: false,
            detect_male: false,
            detect_female: false,
            strictness: DEFAULT_STRICTNESS,
        }
    }
}

impl DetectionOptions {
    /// Options that run both engines with the default strictness.
    pub fn all() -> Self {
        Self {
            detect_nsfw: true,
            detect_gender: true,
            ..Default::default()
        }
    }

    /// Enables NSFW classification.
    pub fn with_nsfw(mut self) -> Self {
        self.detect_nsfw = true;
        self
    }

    /// Enables face/gender detection.
    pub fn with_gender(mut self) -> Self {
        self.detect_gender = true;
        self
    }

    /// Sets the strictness threshold.
    pub fn with_strictness(mut self, strictness: f32) -> Self {
        self.strictness = strictness;
        self
    }

    /// Returns the strictness clamped to [0, 1].
    pub fn threshold(&self) -> f32 {
        if self.strictness.is_nan() {
            return DEFAULT_STRICTNESS;
        }
        self.strictness.clamp(0.0, 1.0)
    }
}

/// Four-way outcome of one detection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Nothing sensitive detected.
    #[default]
    Clear,
    /// A face matching the requested gender filters was detected.
    Face,
    /// Explicit content above the strictness threshold.
    Nsfw,
    /// Classification failed.
    Error,
}

impl Verdict {
    /// Returns the lower-case name of this verdict.
    pub fn name(&self) -> &'static str {
        match self {
            Verdict::Clear => "clear",
            Verdict::Face => "face",
            Verdict::Nsfw => "nsfw",
            Verdict::Error => "error",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inferred gender of a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    /// Returns the lower-case name of this gender.
    pub fn name(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unknown => "unknown",
        }
    }

    /// Parses a gender name, ignoring case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            "unknown" => Some(Gender::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Face bounding box in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One face reported by the face analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    /// Most likely gender.
    pub gender: Gender,
    /// Confidence of the gender attribute (0.0 to 1.0).
    pub gender_score: f32,
    /// Face detection confidence (0.0 to 1.0).
    pub confidence: f32,
    /// Location of the face.
    pub bbox: FaceBox,
}

/// Numeric detail attached to a detection result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionDetails {
    /// Raw classifier scores (2 or 5 classes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsfw_scores: Option<Vec<f32>>,
    /// Number of faces found by the detector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_count: Option<usize>,
    /// Faces reported by the detector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faces: Option<Vec<DetectedFace>>,
    /// Error message for `error` verdicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one detection attempt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    /// The verdict.
    pub result: Verdict,
    /// Gender of the most confident face, when gender detection ran and found faces.
    pub gender: Option<Gender>,
    /// Scores and diagnostics.
    #[serde(default)]
    pub details: DetectionDetails,
}

impl DetectionResult {
    /// Creates an `error` result carrying the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Verdict::Error,
            gender: None,
            details: DetectionDetails {
                error: Some(message.into()),
                ..Default::default()
            },
        }
    }

    /// Returns true if the verdict is `nsfw`.
    pub fn is_nsfw(&self) -> bool {
        self.result == Verdict::Nsfw
    }

    /// Returns true if the verdict is `error`.
    pub fn is_error(&self) -> bool {
        self.result == Verdict::Error
    }
}

/// Snapshot of the detection queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Items waiting behind the one being processed.
    pub queue_length: usize,
    /// Whether the worker is handling an item right now.
    pub is_processing: bool,
    /// Whether the models are loaded.
    pub ready: bool,
    /// Number of cached results.
    pub cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults() {
        let options = DetectionOptions::default();
        assert!(!options.detect_nsfw);
        assert!(!options.detect_gender);
        assert_eq!(options.strictness, 0.5);
    }

    #[test]
    fn options_deserialize_missing_fields() {
        let options: DetectionOptions = serde_json::from_str(r#"{"detect_nsfw": true}"#).unwrap();
        assert!(options.detect_nsfw);
        assert!(!options.detect_female);
        assert_eq!(options.strictness, DEFAULT_STRICTNESS);
    }

    #[test]
    fn threshold_is_clamped() {
        assert_eq!(DetectionOptions::default().with_strictness(1.5).threshold(), 1.0);
        assert_eq!(DetectionOptions::default().with_strictness(-0.5).threshold(), 0.0);
        assert_eq!(
            DetectionOptions::default().with_strictness(f32::NAN).threshold(),
            DEFAULT_STRICTNESS
        );
    }

    #[test]
    fn verdict_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Verdict::Nsfw).unwrap(), "\"nsfw\"");
        assert_eq!(Verdict::Face.to_string(), "face");
    }

    #[test]
    fn gender_parse_ignores_case() {
        assert_eq!(Gender::parse("Female"), Some(Gender::Female));
        assert_eq!(Gender::parse(" MALE "), Some(Gender::Male));
        assert_eq!(Gender::parse("other"), None);
    }

    #[test]
    fn error_result_carries_message() {
        let result = DetectionResult::error("boom");
        assert!(result.is_error());
        assert_eq!(result.details.error.as_deref(), Some("boom"));
        assert!(result.gender.is_none());
    }

    #[test]
    fn empty_details_are_skipped() {
        let json = serde_json::to_value(DetectionResult::default()).unwrap();
        assert_eq!(json["result"], "clear");
        assert!(json["details"].as_object().unwrap().is_empty());
    }
}
