//! API route handlers.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, info};

use shroud_core::decide;

use crate::error::{ApiError, Result};
use crate::models::{
    ClearCacheResponse, DetectRequest, DetectResponse, FilterRequest, FilterResponse,
    ReloadRequest, ReloadResponse, StatusResponse,
};
use crate::state::AppState;

/// Decodes a base64 payload, accepting a `data:` URI prefix.
fn decode_image(data: &str) -> Result<Vec<u8>> {
    let encoded = match data.find(',') {
        Some(pos) if data.starts_with("data:") => &data[pos + 1..],
        _ => data,
    };

    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::BadRequest(format!("invalid base64: {}", e)))
}

/// POST /api/detect - Classify one image.
pub async fn detect(
    State(state): State<AppState>,
    Json(req): Json<DetectRequest>,
) -> Result<Json<DetectResponse>> {
    let start = Instant::now();
    let bytes = decode_image(&req.image)?;
    debug!(size = bytes.len(), options = ?req.options, "Detect request");

    let detection = state.detector.detect_bytes(&bytes, req.options).await?;
    let latency_ms = start.elapsed().as_millis() as u64;

    info!(verdict = %detection.result, latency_ms, "Detection complete");

    Ok(Json(DetectResponse {
        detection,
        latency_ms,
    }))
}

/// POST /api/filter - Classify one image and apply display preferences.
pub async fn filter(
    State(state): State<AppState>,
    Json(req): Json<FilterRequest>,
) -> Result<Json<FilterResponse>> {
    let bytes = decode_image(&req.image)?;

    let detection = state.detector.detect_bytes(&bytes, req.options).await?;
    let decision = decide(&detection, req.hide_nsfw, req.hide_gender);
    debug!(verdict = %detection.result, show = decision.show, "Filter decision");

    Ok(Json(FilterResponse {
        show: decision.show,
        reason: decision.reason,
        detection,
    }))
}

/// GET /api/status - Model state and queue snapshot.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        models: state.detector.model_state(),
        queue: state.detector.queue_status(),
    })
}

/// DELETE /api/cache - Drop every cached result.
pub async fn clear_cache(State(state): State<AppState>) -> Json<ClearCacheResponse> {
    let cleared = state.detector.queue_status().cache_size;
    state.detector.clear_cache();
    info!(cleared, "Result cache cleared");

    Json(ClearCacheResponse { cleared })
}

/// POST /api/models/reload - Load the models, optionally forcing a re-fetch.
pub async fn reload_models(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ReloadResponse>> {
    // An empty body means a plain reload.
    let req: ReloadRequest = if body.is_empty() {
        ReloadRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let start = Instant::now();

    let mut options = (*state.load_options).clone();
    options.force_reload = req.force;
    info!(force = req.force, "Reloading models");

    state.detector.load_models(options).await?;

    Ok(Json(ReloadResponse {
        models: state.detector.model_state(),
        latency_ms: start.elapsed().as_millis() as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_base64() {
        assert_eq!(decode_image("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn test_decode_data_uri() {
        assert_eq!(
            decode_image("data:image/png;base64,aGVsbG8=").unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_image("not base64!"),
            Err(ApiError::BadRequest(_))
        ));
    }
}
