//! Database repositories for each table.

pub mod weights;

pub use weights::{checksum, WeightsRepo};
