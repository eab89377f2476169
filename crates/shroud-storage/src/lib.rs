//! Shroud Storage - SQLite persistence layer.
//!
//! Persists the classifier weights so later process starts skip the
//! download. Each blob is stored with its SHA-256 and verified on read.
//!
//! # Example
//!
//! ```no_run
//! use shroud_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! db.save_weights("nsfw-model", b"...").unwrap();
//! assert!(db.get_weights("nsfw-model").unwrap().is_some());
//! ```

mod connection;
mod database;
pub mod error;
pub mod models;
pub mod repository;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::WeightInfo;
pub use connection::{ConnectionGuard, SharedConnection, BUSY_TIMEOUT};
pub use repository::{checksum, WeightsRepo};
