//! Data models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a stored weight blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightInfo {
    pub key: String,
    /// Hex-encoded SHA-256 of the blob.
    pub sha256: String,
    pub size: i64,
    pub saved_at: DateTime<Utc>,
}
