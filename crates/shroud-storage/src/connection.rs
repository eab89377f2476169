//! The single SQLite connection behind the weight store.
//!
//! Weight blobs are a few megabytes, written once per download and read once
//! per process start, so one mutex-guarded connection is enough. The file may
//! be shared by several processes (a server and a one-off CLI run), hence the
//! busy timeout.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::Result;
use crate::schema::run_migrations;

/// How long a writer waits for another process to release the file lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection shared by every clone of a [`crate::Database`].
#[derive(Clone)]
pub struct SharedConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    /// Opens (or creates) the weight database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::prepare(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        // auto_vacuum only takes effect before the first table exists.
        conn.execute_batch(
            "PRAGMA auto_vacuum = INCREMENTAL;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection.
    ///
    /// A panic while holding the lock cannot leave a half-written row behind
    /// (SQLite rolls the statement back), so a poisoned lock is recovered.
    pub fn lock(&self) -> ConnectionGuard<'_> {
        let guard = self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Weight database lock was poisoned, recovering");
            poisoned.into_inner()
        });
        ConnectionGuard { guard }
    }
}

/// Exclusive access to the shared connection.
pub struct ConnectionGuard<'a> {
    guard: MutexGuard<'a, Connection>,
}

impl ConnectionGuard<'_> {
    /// Returns pages freed by deleted blobs to the filesystem.
    pub fn reclaim_free_pages(&self) -> Result<()> {
        let free: i64 = self
            .guard
            .query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
        if free > 0 {
            let mut stmt = self.guard.prepare("PRAGMA incremental_vacuum")?;
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
            debug!(pages = free, "Reclaimed free pages");
        }
        Ok(())
    }
}

impl std::ops::Deref for ConnectionGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::WeightsRepo;

    fn pragma(conn: &Connection, name: &str) -> i64 {
        conn.query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn file_database_uses_wal_and_incremental_vacuum() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedConnection::open(dir.path().join("weights.db")).unwrap();
        let conn = shared.lock();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        // 2 = INCREMENTAL
        assert_eq!(pragma(&conn, "auto_vacuum"), 2);
        assert_eq!(pragma(&conn, "busy_timeout"), BUSY_TIMEOUT.as_millis() as i64);
    }

    #[test]
    fn deleted_blob_pages_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedConnection::open(dir.path().join("weights.db")).unwrap();
        let conn = shared.lock();

        WeightsRepo::put(&conn, "big", &vec![7u8; 256 * 1024]).unwrap();
        WeightsRepo::delete(&conn, "big").unwrap();
        assert!(pragma(&conn, "freelist_count") > 0);

        conn.reclaim_free_pages().unwrap();
        assert_eq!(pragma(&conn, "freelist_count"), 0);
    }

    #[test]
    fn clones_share_one_connection() {
        let first = SharedConnection::open_in_memory().unwrap();
        let second = first.clone();

        WeightsRepo::put(&first.lock(), "k", b"shared").unwrap();
        assert_eq!(
            WeightsRepo::get(&second.lock(), "k").unwrap().unwrap(),
            b"shared"
        );
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let shared = SharedConnection::open_in_memory().unwrap();
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock();
            panic!("writer died");
        })
        .join();

        let count: i64 = shared
            .lock()
            .query_row("SELECT COUNT(*) FROM model_weights", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
