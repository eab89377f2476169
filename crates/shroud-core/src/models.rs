//! Model lifecycle manager.
//!
//! Loads both engines once per process. Classifier weights are cached in a
//! persistent [`WeightStore`] so later starts skip the network fetch. Built
//! engines are warmed up and then handed to the inference worker, which owns
//! them from that point on.

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{ClassifierInput, EngineFactory, FaceAnalyzer, FaceDetectorConfig, ImageClassifier};
use crate::error::ModelLoadError;
use crate::model_downloader::{self, NSFW_MODEL_URL};
use crate::queue::DetectionQueue;

/// Weight store key for the classifier weights.
pub const MODEL_STORE_KEY: &str = "nsfw-model";

/// Side length of the blank frame used to warm up the face analyzer.
const WARMUP_FRAME_SIZE: u32 = 64;

/// Persistent key/blob storage for model weights.
///
/// Implementations may block; the manager only calls them from the blocking
/// thread pool.
pub trait WeightStore: Send + Sync {
    /// Returns the blob stored under `key`, if any.
    ///
    /// A blob that fails its integrity check is reported as
    /// [`ModelLoadError::CorruptWeights`].
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ModelLoadError>;

    /// Stores `data` under `key`, replacing any previous blob.
    fn put(&self, key: &str, data: &[u8]) -> Result<(), ModelLoadError>;

    /// Removes the blob under `key`. Missing keys are not an error.
    fn remove(&self, key: &str) -> Result<(), ModelLoadError>;
}

/// In-process weight store. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryWeightStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryWeightStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a blob exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().contains_key(key)
    }
}

impl WeightStore for MemoryWeightStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ModelLoadError> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), ModelLoadError> {
        self.blobs.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ModelLoadError> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// Lifecycle state of the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Unloaded,
    Loading,
    Ready,
}

/// Options for [`ModelManager::load`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLoadOptions {
    /// `http(s)` URL or filesystem path of the classifier weights.
    pub classifier_uri: String,
    /// Face analyzer configuration.
    pub detector: FaceDetectorConfig,
    /// Drop stored weights and rebuild the engines.
    pub force_reload: bool,
}

impl Default for ModelLoadOptions {
    fn default() -> Self {
        Self {
            classifier_uri: NSFW_MODEL_URL.to_string(),
            detector: FaceDetectorConfig::default(),
            force_reload: false,
        }
    }
}

impl ModelLoadOptions {
    /// Returns these options with `force_reload` set.
    pub fn forced(mut self) -> Self {
        self.force_reload = true;
        self
    }
}

/// Engine handles owned by the inference worker.
pub struct LoadedModels {
    pub classifier: Box<dyn ImageClassifier>,
    pub detector: Box<dyn FaceAnalyzer>,
}

impl LoadedModels {
    /// Runs one inference through each engine with blank input.
    pub fn warm_up(&mut self) -> Result<(), ModelLoadError> {
        let input = ClassifierInput::zeros(self.classifier.input_size());
        self.classifier
            .predict(&input)
            .map_err(|e| ModelLoadError::Warmup(e.to_string()))?;

        let frame = RgbaImage::new(WARMUP_FRAME_SIZE, WARMUP_FRAME_SIZE);
        self.detector
            .detect(&frame)
            .map_err(|e| ModelLoadError::Warmup(e.to_string()))?;

        Ok(())
    }
}

impl std::fmt::Debug for LoadedModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModels")
            .field("classifier_input_size", &self.classifier.input_size())
            .finish_non_exhaustive()
    }
}

/// Loads engines and installs them into the inference worker.
pub struct ModelManager {
    engines: Option<Arc<dyn EngineFactory>>,
    store: Option<Arc<dyn WeightStore>>,
    queue: DetectionQueue,
    state: Mutex<ModelState>,
    load_lock: tokio::sync::Mutex<()>,
}

impl ModelManager {
    /// Creates a manager that installs engines into `queue`.
    pub fn new(
        engines: Option<Arc<dyn EngineFactory>>,
        store: Option<Arc<dyn WeightStore>>,
        queue: DetectionQueue,
    ) -> Self {
        Self {
            engines,
            store,
            queue,
            state: Mutex::new(ModelState::Unloaded),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModelState {
        *self.state.lock()
    }

    /// Returns true once the engines are installed.
    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    /// Loads, warms up and installs both engines.
    ///
    /// A no-op when already ready, unless `force_reload` is set. Concurrent
    /// calls run one after another.
    pub async fn load(&self, options: &ModelLoadOptions) -> Result<(), ModelLoadError> {
        let _guard = self.load_lock.lock().await;

        if self.is_ready() && !options.force_reload {
            debug!("Models already loaded");
            return Ok(());
        }

        let engines = self
            .engines
            .clone()
            .ok_or(ModelLoadError::MissingEngineFactory)?;

        let previous = std::mem::replace(&mut *self.state.lock(), ModelState::Loading);
        match self.load_with(engines, options).await {
            Ok(()) => {
                *self.state.lock() = ModelState::Ready;
                info!("Models loaded and warmed up");
                Ok(())
            }
            Err(e) => {
                // A failed reload leaves the previously installed engines in place.
                *self.state.lock() = previous;
                warn!("Model load failed: {}", e);
                Err(e)
            }
        }
    }

    async fn load_with(
        &self,
        engines: Arc<dyn EngineFactory>,
        options: &ModelLoadOptions,
    ) -> Result<(), ModelLoadError> {
        if options.force_reload {
            if let Some(store) = &self.store {
                on_blocking_pool(store, |s| s.remove(MODEL_STORE_KEY)).await?;
                info!("Cleared stored classifier weights");
            }
        }

        let weights = self.classifier_weights(&options.classifier_uri).await?;
        let detector_config = options.detector.clone();

        let models = tokio::task::spawn_blocking(move || {
            let classifier = engines.load_classifier(&weights)?;
            let detector = engines.load_detector(&detector_config)?;
            let mut models = LoadedModels {
                classifier,
                detector,
            };
            models.warm_up()?;
            Ok::<_, ModelLoadError>(models)
        })
        .await
        .map_err(|e| ModelLoadError::Engine(e.to_string()))??;

        self.queue.install(models).await
    }

    async fn classifier_weights(&self, uri: &str) -> Result<Vec<u8>, ModelLoadError> {
        if let Some(store) = &self.store {
            match on_blocking_pool(store, |s| s.get(MODEL_STORE_KEY)).await {
                Ok(Some(weights)) => {
                    info!(bytes = weights.len(), "Using stored classifier weights");
                    return Ok(weights);
                }
                Ok(None) => {}
                Err(ModelLoadError::CorruptWeights { key }) => {
                    warn!(%key, "Stored classifier weights are corrupt, fetching again");
                    on_blocking_pool(store, |s| s.remove(MODEL_STORE_KEY)).await?;
                }
                Err(e) => return Err(e),
            }
        }

        info!("Fetching classifier weights from {}", uri);
        let weights = model_downloader::fetch_bytes(uri)
            .await
            .map_err(|e| ModelLoadError::Fetch {
                uri: uri.to_string(),
                message: e.to_string(),
            })?;

        match &self.store {
            Some(store) => {
                let weights = on_blocking_pool(store, move |s| {
                    s.put(MODEL_STORE_KEY, &weights).map(|()| weights)
                })
                .await?;
                debug!(bytes = weights.len(), "Stored classifier weights");
                Ok(weights)
            }
            None => Ok(weights),
        }
    }
}

/// Runs one weight store call on the blocking thread pool.
async fn on_blocking_pool<T, F>(store: &Arc<dyn WeightStore>, call: F) -> Result<T, ModelLoadError>
where
    T: Send + 'static,
    F: FnOnce(&dyn WeightStore) -> Result<T, ModelLoadError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(store.as_ref()))
        .await
        .map_err(|e| ModelLoadError::Store(e.to_string()))?
}
