//! Shroud - sensitive visual content detection.
//!
//! This crate holds the pieces of the `shroud` binary that are worth testing
//! on their own:
//!
//! - [`config`]: the JSON configuration file
//! - [`ffmpeg`]: a video frame source driving `ffprobe`/`ffmpeg`

pub mod config;
pub mod ffmpeg;

pub use config::{ConfigError, FilterSettings, ServerSettings, ShroudConfig};
pub use ffmpeg::FfmpegSource;
