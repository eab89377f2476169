//! Video frame source backed by the `ffprobe` and `ffmpeg` executables.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use image::RgbaImage;
use tracing::debug;

use shroud_core::{FrameError, FrameSource};

/// Reads the duration and individual frames of a video file.
///
/// Each frame is decoded by a separate `ffmpeg` process seeking to the
/// timestamp and writing one PNG to stdout.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    path: PathBuf,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegSource {
    /// Uses `ffmpeg` and `ffprobe` from `PATH`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }

    /// Overrides the executables.
    pub fn with_tools(mut self, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parses `ffprobe -show_entries format=duration` output.
pub fn parse_duration(output: &str) -> Option<f64> {
    output
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
}

impl FrameSource for FfmpegSource {
    fn duration_seconds(&self) -> Result<f64, FrameError> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(&self.path)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| FrameError::Duration(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FrameError::Duration(format!("ffprobe failed: {}", stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_duration(&stdout)
            .ok_or_else(|| FrameError::Duration(format!("unreadable duration: {:?}", stdout.trim())))
    }

    fn frame_at(&self, timestamp: f64) -> Result<RgbaImage, FrameError> {
        let extract_error = |message: String| FrameError::Extract { timestamp, message };

        let seek = format!("{:.3}", timestamp);
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-ss", &seek])
            .arg("-i")
            .arg(&self.path)
            .args(["-an", "-sn"])
            .args(["-frames:v", "1"])
            .args(["-f", "image2pipe", "-vcodec", "png", "-"])
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| extract_error(format!("failed to run ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(extract_error(stderr.trim().to_string()));
        }
        if output.stdout.is_empty() {
            return Err(extract_error("no frame at timestamp".to_string()));
        }

        debug!(timestamp, bytes = output.stdout.len(), "Extracted frame");
        image::load_from_memory(&output.stdout)
            .map(|frame| frame.to_rgba8())
            .map_err(|e| extract_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.480000\n"), Some(12.48));
        assert_eq!(parse_duration("0"), Some(0.0));
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration("-1.0"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_missing_tool_is_a_duration_error() {
        let source = FfmpegSource::new("clip.mp4")
            .with_tools("/nonexistent/ffmpeg", "/nonexistent/ffprobe");

        assert!(matches!(
            source.duration_seconds(),
            Err(FrameError::Duration(_))
        ));
        assert!(matches!(
            source.frame_at(1.5),
            Err(FrameError::Extract { timestamp, .. }) if timestamp == 1.5
        ));
    }
}
