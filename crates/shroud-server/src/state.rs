//! Application state for the API server.

use std::sync::Arc;

use shroud_core::{Detector, ModelLoadOptions};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Detection pipeline.
    pub detector: Arc<Detector>,
    /// Options used by `POST /api/models/reload`.
    pub load_options: Arc<ModelLoadOptions>,
}

impl AppState {
    /// Creates application state around a detector.
    pub fn new(detector: Arc<Detector>, load_options: ModelLoadOptions) -> Self {
        Self {
            detector,
            load_options: Arc::new(load_options),
        }
    }
}
