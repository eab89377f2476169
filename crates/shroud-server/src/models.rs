//! API request and response models.

use serde::{Deserialize, Serialize};

use shroud_core::{DetectionOptions, DetectionResult, GenderFilter, ModelState, QueueStatus};

/// Request body for POST /api/detect.
#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    /// Base64-encoded image, optionally as a data URI.
    pub image: String,
    /// Detection options.
    #[serde(default)]
    pub options: DetectionOptions,
}

/// Response body for POST /api/detect.
#[derive(Debug, Serialize)]
pub struct DetectResponse {
    #[serde(flatten)]
    pub detection: DetectionResult,
    /// End-to-end latency in milliseconds, including queue wait.
    pub latency_ms: u64,
}

/// Request body for POST /api/filter.
#[derive(Debug, Deserialize)]
pub struct FilterRequest {
    /// Base64-encoded image, optionally as a data URI.
    pub image: String,
    #[serde(default)]
    pub options: DetectionOptions,
    /// Hide images classified as NSFW.
    #[serde(default)]
    pub hide_nsfw: bool,
    /// `false`, `true`, `"male"` or `"female"`.
    #[serde(default)]
    pub hide_gender: GenderFilter,
}

/// Response body for POST /api/filter.
#[derive(Debug, Serialize)]
pub struct FilterResponse {
    pub show: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub detection: DetectionResult,
}

/// Response body for GET /api/status.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub models: ModelState,
    #[serde(flatten)]
    pub queue: QueueStatus,
}

/// Response body for DELETE /api/cache.
#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    /// Number of entries dropped.
    pub cleared: usize,
}

/// Request body for POST /api/models/reload.
#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    /// Drop stored weights and fetch them again.
    #[serde(default)]
    pub force: bool,
}

/// Response body for POST /api/models/reload.
#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub models: ModelState,
    pub latency_ms: u64,
}
