//! Caller-facing detection API.

use std::sync::Arc;

use image::RgbaImage;
use tracing::debug;

use crate::engine::EngineFactory;
use crate::error::{DetectError, Result};
use crate::models::{ModelLoadOptions, ModelManager, ModelState, WeightStore};
use crate::queue::DetectionQueue;
use crate::types::{DetectionOptions, DetectionResult, QueueStatus};
use crate::video::{self, FrameSource, VideoReport};

/// Builder for [`Detector`].
#[derive(Default)]
pub struct DetectorBuilder {
    engines: Option<Arc<dyn EngineFactory>>,
    store: Option<Arc<dyn WeightStore>>,
}

impl DetectorBuilder {
    /// Sets the factory used to construct the engines.
    pub fn engines(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = Some(engines);
        self
    }

    /// Sets the persistent store for classifier weights.
    pub fn weight_store(mut self, store: Arc<dyn WeightStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Starts the inference worker and returns the detector.
    pub fn build(self) -> Result<Detector> {
        let queue = DetectionQueue::start()?;
        let models = ModelManager::new(self.engines, self.store, queue.clone());
        Ok(Detector { queue, models })
    }
}

/// Detection pipeline context: queue, model lifecycle and result cache.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct Detector {
    queue: DetectionQueue,
    models: ModelManager,
}

impl Detector {
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::default()
    }

    /// Loads both engines. See [`ModelManager::load`].
    pub async fn load_models(&self, options: ModelLoadOptions) -> Result<()> {
        self.models.load(&options).await?;
        Ok(())
    }

    pub fn model_state(&self) -> ModelState {
        self.models.state()
    }

    pub fn is_ready(&self) -> bool {
        self.models.is_ready()
    }

    /// Classifies one image.
    pub async fn detect(&self, image: RgbaImage, options: DetectionOptions) -> Result<DetectionResult> {
        if !self.queue.is_ready() {
            return Err(DetectError::ModelsNotLoaded);
        }
        self.queue.submit(image, options).await
    }

    /// Decodes an encoded image (JPEG, PNG, GIF, WebP) and classifies it.
    pub async fn detect_bytes(&self, bytes: &[u8], options: DetectionOptions) -> Result<DetectionResult> {
        let bytes = bytes.to_vec();
        let image = tokio::task::spawn_blocking(move || {
            image::load_from_memory(&bytes)
                .map(|decoded| decoded.to_rgba8())
                .map_err(|e| DetectError::InvalidImage(e.to_string()))
        })
        .await
        .map_err(|e| DetectError::Inference(e.to_string()))??;
        self.detect(image, options).await
    }

    /// Samples `frame_count` frames from `source` and aggregates them.
    pub async fn detect_video(
        &self,
        source: Arc<dyn FrameSource>,
        frame_count: usize,
        options: DetectionOptions,
    ) -> Result<VideoReport> {
        if !self.queue.is_ready() {
            return Err(DetectError::ModelsNotLoaded);
        }

        let duration_source = Arc::clone(&source);
        let duration = tokio::task::spawn_blocking(move || duration_source.duration_seconds())
            .await
            .map_err(|e| DetectError::Inference(e.to_string()))??;
        debug!(duration, frame_count, "Sampling video");

        let report = video::summarize(duration, frame_count, |_, timestamp| {
            let source = Arc::clone(&source);
            async move {
                let frame = tokio::task::spawn_blocking(move || source.frame_at(timestamp))
                    .await
                    .map_err(|e| DetectError::Inference(e.to_string()))??;
                self.detect(frame, options).await
            }
        })
        .await;

        Ok(report)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn clear_cache(&self) {
        self.queue.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::models::testing::FakeEngines;
    use crate::models::MemoryWeightStore;
    use crate::types::{DetectedFace, FaceBox, Gender, Verdict};
    use image::Rgba;
    use std::io::Cursor;

    fn weights_uri(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("classifier.onnx");
        std::fs::write(&path, b"weights").unwrap();
        path.to_string_lossy().to_string()
    }

    fn load_options(dir: &tempfile::TempDir) -> ModelLoadOptions {
        ModelLoadOptions {
            classifier_uri: weights_uri(dir),
            ..Default::default()
        }
    }

    async fn ready_detector(engines: FakeEngines) -> (Detector, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let detector = Detector::builder()
            .engines(Arc::new(engines))
            .weight_store(Arc::new(MemoryWeightStore::new()))
            .build()
            .unwrap();
        detector.load_models(load_options(&dir)).await.unwrap();
        (detector, dir)
    }

    fn image(level: u8) -> RgbaImage {
        RgbaImage::from_pixel(32, 32, Rgba([level, level, level, 255]))
    }

    #[tokio::test]
    async fn detect_before_load_is_rejected() {
        let detector = Detector::builder()
            .engines(Arc::new(FakeEngines::new(vec![0.9, 0.1])))
            .build()
            .unwrap();

        let err = detector
            .detect(image(0), DetectionOptions::all())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::ModelsNotLoaded));
        assert_eq!(detector.model_state(), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn load_without_engines_fails() {
        let detector = Detector::builder().build().unwrap();
        let err = detector
            .load_models(ModelLoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DetectError::ModelLoad(crate::error::ModelLoadError::MissingEngineFactory)
        ));
    }

    #[tokio::test]
    async fn identical_requests_hit_the_cache() {
        let engines = FakeEngines::new(vec![0.01, 0.02, 0.07, 0.9, 0.0]);
        let calls = Arc::clone(&engines.calls);
        let (detector, _dir) = ready_detector(engines).await;
        let warmup_calls = calls.predictions();

        let options = DetectionOptions::default().with_nsfw();
        let first = detector.detect(image(7), options).await.unwrap();
        let second = detector.detect(image(7), options).await.unwrap();

        assert_eq!(first.result, Verdict::Nsfw);
        assert_eq!(first, second);
        assert_eq!(calls.predictions() - warmup_calls, 1);

        detector.clear_cache();
        detector.detect(image(7), options).await.unwrap();
        assert_eq!(calls.predictions() - warmup_calls, 2);
    }

    #[tokio::test]
    async fn detect_bytes_decodes_png() {
        let face = DetectedFace {
            gender: Gender::Female,
            gender_score: 0.92,
            confidence: 0.8,
            bbox: FaceBox::default(),
        };
        let (detector, _dir) =
            ready_detector(FakeEngines::new(vec![0.9, 0.1]).with_faces(vec![face])).await;

        let mut png = Vec::new();
        image(90)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let result = detector
            .detect_bytes(&png, DetectionOptions::all())
            .await
            .unwrap();
        assert_eq!(result.result, Verdict::Face);
        assert_eq!(result.gender, Some(Gender::Female));

        let err = detector
            .detect_bytes(b"not an image", DetectionOptions::all())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::InvalidImage(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn truncated_png_is_rejected_without_queueing() {
        let (detector, _dir) = ready_detector(FakeEngines::new(vec![0.9, 0.1])).await;

        let mut png = Vec::new();
        image(30)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        png.truncate(png.len() / 2);

        let err = detector
            .detect_bytes(&png, DetectionOptions::all())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::InvalidImage(_)));
        assert_eq!(detector.queue_status().cache_size, 0);
        assert_eq!(detector.queue_status().queue_length, 0);
    }

    #[tokio::test]
    async fn status_reflects_cache_and_readiness() {
        let (detector, _dir) = ready_detector(FakeEngines::new(vec![0.9, 0.1])).await;
        detector
            .detect(image(1), DetectionOptions::default().with_nsfw())
            .await
            .unwrap();

        let status = detector.queue_status();
        assert!(status.ready);
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.cache_size, 1);
    }

    /// Frames alternate between two shades; one frame cannot be decoded.
    struct FakeVideo;

    impl FrameSource for FakeVideo {
        fn duration_seconds(&self) -> std::result::Result<f64, FrameError> {
            Ok(10.0)
        }

        fn frame_at(&self, timestamp: f64) -> std::result::Result<RgbaImage, FrameError> {
            if timestamp == 9.0 {
                return Err(FrameError::Extract {
                    timestamp,
                    message: "truncated".to_string(),
                });
            }
            Ok(image(timestamp as u8))
        }
    }

    #[tokio::test]
    async fn video_frames_flow_through_the_queue() {
        let (detector, _dir) = ready_detector(FakeEngines::new(vec![0.2, 0.8])).await;

        let report = detector
            .detect_video(Arc::new(FakeVideo), 10, DetectionOptions::default().with_nsfw())
            .await
            .unwrap();

        assert_eq!(report.summary.total_frames, 10);
        assert_eq!(report.frames.len(), 9);
        assert_eq!(report.summary.nsfw_frame_count, 9);
        assert_eq!(report.verdict, Verdict::Nsfw);
        assert!((report.summary.max_nsfw_score - 0.8).abs() < 1e-6);
    }

    struct BrokenVideo;

    impl FrameSource for BrokenVideo {
        fn duration_seconds(&self) -> std::result::Result<f64, FrameError> {
            Err(FrameError::Duration("no streams".to_string()))
        }

        fn frame_at(&self, timestamp: f64) -> std::result::Result<RgbaImage, FrameError> {
            Err(FrameError::Extract {
                timestamp,
                message: "unreachable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn video_duration_failure_is_an_error() {
        let (detector, _dir) = ready_detector(FakeEngines::new(vec![0.2, 0.8])).await;
        let err = detector
            .detect_video(Arc::new(BrokenVideo), 10, DetectionOptions::all())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::Video(FrameError::Duration(_))));
    }
}
