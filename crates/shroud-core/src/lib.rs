//! Shroud Core - sensitive visual content detection pipeline.
//!
//! This crate turns images and video frames into a small verdict
//! (`clear`, `face`, `nsfw` or `error`) and decides whether to show them.
//! It handles:
//!
//! - Model lifecycle: loading, warming up and persisting classifier weights
//! - A single-flight queue that serializes all inference on one worker thread
//! - A content-address cache keyed by a pixel sample and the request options
//! - Video sampling and aggregation
//! - The filtering policy and visual suppression of flagged content
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shroud_core::{DetectionOptions, Detector, ModelLoadOptions, OnnxEngineFactory};
//!
//! # async fn run() -> shroud_core::Result<()> {
//! let detector = Detector::builder()
//!     .engines(Arc::new(OnnxEngineFactory::default()))
//!     .build()?;
//! detector.load_models(ModelLoadOptions::default()).await?;
//!
//! let bytes = std::fs::read("photo.jpg").unwrap();
//! let result = detector.detect_bytes(&bytes, DetectionOptions::all()).await?;
//! println!("{}", result.result);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod decision;
mod detector;
pub mod engine;
pub mod error;
pub mod model_downloader;
pub mod models;
pub mod onnx;
pub mod policy;
pub mod queue;
pub mod suppression;
pub mod types;
pub mod video;

pub use detector::{Detector, DetectorBuilder};
pub use engine::{ClassifierInput, EngineFactory, FaceAnalyzer, FaceDetectorConfig, ImageClassifier};
pub use error::{DetectError, FrameError, InferenceError, ModelLoadError, Result};
pub use model_downloader::{DownloadError, DownloadProgress, MlStatus, ModelDownloader};
pub use models::{
    LoadedModels, MemoryWeightStore, ModelLoadOptions, ModelState, WeightStore, MODEL_STORE_KEY,
};
pub use onnx::{ClassifierConfig, OnnxEngineFactory};
pub use policy::{decide, FilterDecision, GenderFilter};
pub use suppression::{apply_visual_suppression, RasterSuppressor, SuppressionStyle, VisualSuppressor};
pub use types::{
    DetectedFace, DetectionDetails, DetectionOptions, DetectionResult, FaceBox, Gender,
    QueueStatus, Verdict,
};
pub use video::{FrameSource, VideoFrameResult, VideoReport, VideoSummary, DEFAULT_FRAME_COUNT};
