//! Model weights repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::{Result, StorageError};
use crate::models::WeightInfo;

/// Repository for model weight blobs.
pub struct WeightsRepo;

impl WeightsRepo {
    /// Get a blob, verifying it against the stored checksum.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>, String)> = conn
            .query_row(
                "SELECT data, sha256 FROM model_weights WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((data, sha256)) if checksum(&data) == sha256 => Ok(Some(data)),
            Some(_) => Err(StorageError::Checksum {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Store a blob (insert or replace).
    pub fn put(conn: &Connection, key: &str, data: &[u8]) -> Result<WeightInfo> {
        let info = WeightInfo {
            key: key.to_string(),
            sha256: checksum(data),
            size: data.len() as i64,
            saved_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO model_weights (key, data, sha256, size, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                data = ?2, sha256 = ?3, size = ?4, saved_at = ?5",
            params![
                info.key,
                data,
                info.sha256,
                info.size,
                info.saved_at.to_rfc3339()
            ],
        )?;

        Ok(info)
    }

    /// Delete a blob. Returns true if one existed.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM model_weights WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Metadata for every stored blob, without the data.
    pub fn list(conn: &Connection) -> Result<Vec<WeightInfo>> {
        let mut stmt =
            conn.prepare("SELECT key, sha256, size, saved_at FROM model_weights ORDER BY key")?;

        let infos = stmt
            .query_map([], |row| {
                let saved_at: String = row.get(3)?;
                Ok(WeightInfo {
                    key: row.get(0)?,
                    sha256: row.get(1)?,
                    size: row.get(2)?,
                    saved_at: parse_datetime(&saved_at),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(infos)
    }
}

/// Hex-encoded SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_put_and_get() {
        let conn = setup_db();

        let info = WeightsRepo::put(&conn, "nsfw-model", b"weights").unwrap();
        assert_eq!(info.size, 7);
        assert_eq!(info.sha256, checksum(b"weights"));

        let data = WeightsRepo::get(&conn, "nsfw-model").unwrap().unwrap();
        assert_eq!(data, b"weights");
    }

    #[test]
    fn test_put_replaces() {
        let conn = setup_db();

        WeightsRepo::put(&conn, "k", b"old").unwrap();
        WeightsRepo::put(&conn, "k", b"newer").unwrap();

        assert_eq!(WeightsRepo::get(&conn, "k").unwrap().unwrap(), b"newer");
        assert_eq!(WeightsRepo::list(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let conn = setup_db();
        assert!(WeightsRepo::get(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let conn = setup_db();

        WeightsRepo::put(&conn, "k", b"data").unwrap();
        assert!(WeightsRepo::delete(&conn, "k").unwrap());
        assert!(!WeightsRepo::delete(&conn, "k").unwrap());
        assert!(WeightsRepo::get(&conn, "k").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_blob_is_rejected() {
        let conn = setup_db();

        WeightsRepo::put(&conn, "k", b"data").unwrap();
        conn.execute(
            "UPDATE model_weights SET data = ?1 WHERE key = 'k'",
            [b"tampered".to_vec()],
        )
        .unwrap();

        let err = WeightsRepo::get(&conn, "k").unwrap_err();
        assert!(matches!(err, StorageError::Checksum { .. }));
    }

    #[test]
    fn test_list_metadata() {
        let conn = setup_db();

        WeightsRepo::put(&conn, "b", b"22").unwrap();
        WeightsRepo::put(&conn, "a", b"1").unwrap();

        let infos = WeightsRepo::list(&conn).unwrap();
        assert_eq!(infos[0].key, "a");
        assert_eq!(infos[1].size, 2);
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
