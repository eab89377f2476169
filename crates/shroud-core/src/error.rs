//! Error types for the detection pipeline.

use thiserror::Error;

/// Errors raised while loading or warming up the inference engines.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    /// `load_models` was called on a detector built without an engine factory.
    #[error("No engine factory supplied - build the detector with `.engines(..)`")]
    MissingEngineFactory,

    /// Fetching the model weights failed.
    #[error("Failed to fetch model weights from {uri}: {message}")]
    Fetch { uri: String, message: String },

    /// The persistent weight store failed.
    #[error("Weight store error: {0}")]
    Store(String),

    /// A stored blob failed its integrity check.
    #[error("Stored weights under {key} are corrupt")]
    CorruptWeights { key: String },

    /// An engine constructor rejected its input.
    #[error("Engine construction failed: {0}")]
    Engine(String),

    /// The warm-up inference pass failed.
    #[error("Warm-up inference failed: {0}")]
    Warmup(String),

    /// ML feature not enabled.
    #[error("ML feature not enabled - rebuild with --features ml")]
    MlNotEnabled,

    /// The inference worker is gone.
    #[error("Inference worker is not running")]
    WorkerGone,
}

/// Per-request failure inside an engine.
///
/// The decision engine recovers these into an `error` verdict; they never
/// cross the queue boundary.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Image processing error.
    #[error("Image processing error: {0}")]
    Image(String),

    /// The engine returned an output the pipeline cannot interpret.
    #[error("Unexpected model output: {0}")]
    Output(String),

    /// Inference runtime error.
    #[error("Inference error: {0}")]
    Runtime(String),
}

#[cfg(feature = "ml")]
impl From<ort::Error> for InferenceError {
    fn from(e: ort::Error) -> Self {
        InferenceError::Runtime(e.to_string())
    }
}

impl From<image::ImageError> for InferenceError {
    fn from(e: image::ImageError) -> Self {
        InferenceError::Image(e.to_string())
    }
}

/// Errors raised by a video frame source.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The source could not report its duration.
    #[error("Could not read video duration: {0}")]
    Duration(String),

    /// A frame could not be extracted.
    #[error("Could not extract frame at {timestamp:.2}s: {message}")]
    Extract { timestamp: f64, message: String },
}

/// Errors surfaced to callers of [`crate::Detector`].
#[derive(Debug, Error)]
pub enum DetectError {
    /// `detect` was called before `load_models` completed.
    #[error("Models not loaded. Call load_models() first.")]
    ModelsNotLoaded,

    /// Model loading failed.
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    /// The queue rejected this item after an unexpected fault.
    #[error("Detection failed: {0}")]
    Inference(String),

    /// The input could not be decoded into an image.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// The inference worker stopped before answering.
    #[error("Detection queue closed")]
    QueueClosed,

    /// The inference worker thread could not be started.
    #[error("Failed to start inference worker: {0}")]
    WorkerStart(#[from] std::io::Error),

    /// The video source failed before any frame was sampled.
    #[error(transparent)]
    Video(#[from] FrameError),
}

/// Result type for caller-facing operations.
pub type Result<T> = std::result::Result<T, DetectError>;
