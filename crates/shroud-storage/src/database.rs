//! High-level database interface.

use std::path::PathBuf;

use directories::ProjectDirs;
use shroud_core::{ModelLoadError, WeightStore};
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::models::WeightInfo;
use crate::connection::SharedConnection;
use crate::repository::WeightsRepo;

/// High-level database interface for Shroud.
#[derive(Clone)]
pub struct Database {
    conn: SharedConnection,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let conn = SharedConnection::open(&path)?;

        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = SharedConnection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "shroud", "Shroud")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("shroud.db"))
    }

    // === Model weights ===

    /// Get a weight blob, verified against its checksum.
    pub fn get_weights(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        WeightsRepo::get(&conn, key)
    }

    /// Store a weight blob.
    pub fn save_weights(&self, key: &str, data: &[u8]) -> Result<WeightInfo> {
        let conn = self.conn.lock();
        let info = WeightsRepo::put(&conn, key, data)?;
        debug!(key, size = info.size, "Saved weights");
        Ok(info)
    }

    /// Delete a weight blob. Returns true if one existed.
    pub fn delete_weights(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = WeightsRepo::delete(&conn, key)?;
        if deleted {
            conn.reclaim_free_pages()?;
        }
        Ok(deleted)
    }

    /// Metadata of every stored blob.
    pub fn list_weights(&self) -> Result<Vec<WeightInfo>> {
        let conn = self.conn.lock();
        WeightsRepo::list(&conn)
    }
}

fn store_error(e: StorageError) -> ModelLoadError {
    match e {
        StorageError::Checksum { key } => ModelLoadError::CorruptWeights { key },
        other => ModelLoadError::Store(other.to_string()),
    }
}

impl WeightStore for Database {
    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, ModelLoadError> {
        self.get_weights(key).map_err(store_error)
    }

    fn put(&self, key: &str, data: &[u8]) -> std::result::Result<(), ModelLoadError> {
        self.save_weights(key, data).map(|_| ()).map_err(store_error)
    }

    fn remove(&self, key: &str) -> std::result::Result<(), ModelLoadError> {
        self.delete_weights(key).map(|_| ()).map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_core::MODEL_STORE_KEY;

    #[test]
    fn test_weight_store_round_trip() {
        let db = Database::in_memory().unwrap();
        let store: &dyn WeightStore = &db;

        assert!(store.get(MODEL_STORE_KEY).unwrap().is_none());
        store.put(MODEL_STORE_KEY, b"onnx-bytes").unwrap();
        assert_eq!(store.get(MODEL_STORE_KEY).unwrap().unwrap(), b"onnx-bytes");

        store.remove(MODEL_STORE_KEY).unwrap();
        assert!(store.get(MODEL_STORE_KEY).unwrap().is_none());
        // Removing a missing key is fine
        store.remove(MODEL_STORE_KEY).unwrap();
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("shroud.db");

        {
            let db = Database::with_path(&path).unwrap();
            db.save_weights("k", b"persisted").unwrap();
        }

        let db = Database::with_path(&path).unwrap();
        assert_eq!(db.get_weights("k").unwrap().unwrap(), b"persisted");
        assert_eq!(db.list_weights().unwrap()[0].size, 9);
    }

    #[test]
    fn test_corruption_is_reported_as_corrupt_weights() {
        let db = Database::in_memory().unwrap();
        db.save_weights("k", b"data").unwrap();
        {
            let conn = db.conn.lock();
            conn.execute("UPDATE model_weights SET sha256 = 'bad'", [])
                .unwrap();
        }

        let err = WeightStore::get(&db, "k").unwrap_err();
        assert!(matches!(err, ModelLoadError::CorruptWeights { ref key } if key == "k"));

        WeightStore::remove(&db, "k").unwrap();
        assert!(WeightStore::get(&db, "k").unwrap().is_none());
    }

    #[test]
    fn test_default_db_path() {
        if let Ok(path) = Database::default_db_path() {
            assert!(path.ends_with("shroud.db"));
        }
    }
}
