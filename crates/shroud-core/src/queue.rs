//! Single-flight detection queue.
//!
//! Every detection goes through one FIFO channel drained by a dedicated
//! `shroud-inference` thread. That thread is the only place the engines are
//! touched, so at most one inference runs at a time and items complete in
//! submission order. Callers await a oneshot reply.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cache::{fingerprint, ResultCache};
use crate::decision;
use crate::error::{DetectError, ModelLoadError, Result};
use crate::models::LoadedModels;
use crate::types::{DetectionOptions, DetectionResult, QueueStatus};

/// One pending detection.
pub struct QueueItem {
    /// Random hex token, used in logs.
    pub id: String,
    pub image: RgbaImage,
    pub options: DetectionOptions,
    reply: oneshot::Sender<Result<DetectionResult>>,
}

enum Command {
    Detect(QueueItem),
    Install {
        models: LoadedModels,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct Shared {
    queued: AtomicUsize,
    processing: AtomicBool,
    ready: AtomicBool,
    cache: Mutex<ResultCache>,
}

/// Handle to the inference worker. Cheap to clone.
#[derive(Clone)]
pub struct DetectionQueue {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl DetectionQueue {
    /// Spawns the inference worker thread.
    pub fn start() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let worker_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("shroud-inference".to_string())
            .spawn(move || run_worker(rx, worker_shared))?;

        Ok(Self { tx, shared })
    }

    /// Queues `image` and waits for its result.
    pub async fn submit(
        &self,
        image: RgbaImage,
        options: DetectionOptions,
    ) -> Result<DetectionResult> {
        let (reply, response) = oneshot::channel();
        let item = QueueItem {
            id: new_item_id(),
            image,
            options,
            reply,
        };

        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Command::Detect(item)).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(DetectError::QueueClosed);
        }

        response.await.map_err(|_| DetectError::QueueClosed)?
    }

    /// Hands loaded engines to the worker.
    ///
    /// Items queued before this call are answered first.
    pub async fn install(&self, models: LoadedModels) -> std::result::Result<(), ModelLoadError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Install { models, reply })
            .map_err(|_| ModelLoadError::WorkerGone)?;
        done.await.map_err(|_| ModelLoadError::WorkerGone)
    }

    /// Returns true once engines are installed.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Snapshot of the queue, answered without queueing.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.shared.queued.load(Ordering::SeqCst),
            is_processing: self.shared.processing.load(Ordering::SeqCst),
            ready: self.is_ready(),
            cache_size: self.shared.cache.lock().len(),
        }
    }

    /// Drops every cached result.
    pub fn clear_cache(&self) {
        let mut cache = self.shared.cache.lock();
        let cleared = cache.len();
        cache.clear();
        info!(cleared, "Detection cache cleared");
    }
}

fn new_item_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn run_worker(mut rx: mpsc::UnboundedReceiver<Command>, shared: Arc<Shared>) {
    let mut models: Option<LoadedModels> = None;
    debug!("Inference worker started");

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Install {
                models: loaded,
                reply,
            } => {
                models = Some(loaded);
                shared.ready.store(true, Ordering::SeqCst);
                let _ = reply.send(());
            }
            Command::Detect(item) => {
                shared.queued.fetch_sub(1, Ordering::SeqCst);
                shared.processing.store(true, Ordering::SeqCst);

                let QueueItem {
                    id,
                    image,
                    options,
                    reply,
                } = item;
                let outcome = process(models.as_mut(), &shared, &id, &image, &options);

                shared.processing.store(false, Ordering::SeqCst);
                if reply.send(outcome).is_err() {
                    debug!(%id, "Caller went away before the result was ready");
                }
            }
        }
    }

    debug!("Inference worker stopped");
}

fn process(
    models: Option<&mut LoadedModels>,
    shared: &Shared,
    id: &str,
    image: &RgbaImage,
    options: &DetectionOptions,
) -> Result<DetectionResult> {
    let models = models.ok_or(DetectError::ModelsNotLoaded)?;

    let key = fingerprint(image, options);
    if let Some(hit) = shared.cache.lock().lookup(&key) {
        debug!(%id, "Cache hit");
        return Ok(hit);
    }

    debug!(%id, width = image.width(), height = image.height(), "Running detection");
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        decision::classify(models, image, options)
    }))
    .map_err(|payload| {
        let message = panic_message(payload.as_ref());
        warn!(%id, "Detection panicked: {}", message);
        DetectError::Inference(message)
    })?;

    let mut cache = shared.cache.lock();
    cache.insert(key, result.clone());
    cache.sweep_if_full();

    Ok(result)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "inference panicked".to_string()
    }
}
