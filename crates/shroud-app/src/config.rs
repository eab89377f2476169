//! Persistent user configuration.
//!
//! Stored as JSON at `<config dir>/config.json`. Missing files and missing
//! fields fall back to defaults, so older files keep loading.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shroud_core::{
    DetectionOptions, GenderFilter, ModelLoadOptions, SuppressionStyle, DEFAULT_FRAME_COUNT,
};
use shroud_server::{DEFAULT_HOST, DEFAULT_PORT};

/// Config file name inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Errors from loading or saving the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not determine config directory")]
    NoConfigDir,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Viewer display preferences.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub hide_nsfw: bool,
    pub hide_gender: GenderFilter,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            hide_nsfw: true,
            hide_gender: GenderFilter::None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShroudConfig {
    pub server: ServerSettings,
    /// Options applied to every detection request.
    pub detection: DetectionOptions,
    pub filter: FilterSettings,
    pub suppression: SuppressionStyle,
    pub models: ModelLoadOptions,
    /// Frames sampled per video.
    pub frame_count: usize,
    /// Weight store location (None = default data dir).
    pub db_path: Option<PathBuf>,
}

impl Default for ShroudConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            detection: DetectionOptions::all(),
            filter: FilterSettings::default(),
            suppression: SuppressionStyle::default(),
            models: ModelLoadOptions::default(),
            frame_count: DEFAULT_FRAME_COUNT,
            db_path: None,
        }
    }
}

impl ShroudConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("", "shroud", "Shroud").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join(CONFIG_FILE))
    }

    /// Loads from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path()?)
    }

    /// Loads from `path`; a missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_core::Gender;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShroudConfig::load_from(dir.path().join("config.json")).unwrap();
        assert_eq!(config, ShroudConfig::default());
        assert!(config.detection.detect_nsfw);
        assert!(config.filter.hide_nsfw);
        assert_eq!(config.frame_count, 10);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9000}, "filter": {"hide_gender": "Female"}}"#,
        )
        .unwrap();

        let config = ShroudConfig::load_from(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(
            config.filter.hide_gender,
            GenderFilter::Specific(Gender::Female)
        );
        assert!(config.filter.hide_nsfw);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = ShroudConfig::default();
        config.filter.hide_gender = GenderFilter::All;
        config.detection = config.detection.with_strictness(0.8);
        config.save_to(&path).unwrap();

        assert_eq!(ShroudConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            ShroudConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
