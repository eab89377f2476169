//! Model and runtime downloader.
//!
//! Fetches model weights and the ONNX Runtime shared library into the
//! per-user data directory. Supports progress callbacks for the CLI.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;

/// Download progress callback type (uses Arc for Clone support).
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Download progress information.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Current step description.
    pub step: String,
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download (if known).
    pub total: Option<u64>,
    /// Whether the step is complete.
    pub complete: bool,
}

impl DownloadProgress {
    /// Creates a new progress update.
    pub fn new(step: &str, downloaded: u64, total: Option<u64>) -> Self {
        Self {
            step: step.to_string(),
            downloaded,
            total,
            complete: false,
        }
    }

    /// Creates a completion progress.
    pub fn complete(step: &str) -> Self {
        Self {
            step: step.to_string(),
            downloaded: 0,
            total: None,
            complete: true,
        }
    }

    /// Returns progress as a percentage (0-100).
    pub fn percentage(&self) -> Option<u8> {
        self.total.map(|t| {
            if t == 0 {
                100
            } else {
                ((self.downloaded as f64 / t as f64) * 100.0).min(100.0) as u8
            }
        })
    }
}

/// Error types for model downloading.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive extraction error: {0}")]
    Archive(String),

    #[error("Not available: {0}")]
    NotFound(String),

    #[error("Could not determine the data directory")]
    NoDataDir,
}

/// ONNX Runtime version to download.
const ONNX_RUNTIME_VERSION: &str = "1.23.2";

#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
const ONNX_RUNTIME_URL: &str = "https://github.com/microsoft/onnxruntime/releases/download/v1.23.2/onnxruntime-win-x64-1.23.2.zip";

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const ONNX_RUNTIME_URL: &str = "https://github.com/microsoft/onnxruntime/releases/download/v1.23.2/onnxruntime-linux-x64-1.23.2.tgz";

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
const ONNX_RUNTIME_URL: &str = "https://github.com/microsoft/onnxruntime/releases/download/v1.23.2/onnxruntime-linux-aarch64-1.23.2.tgz";

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
const ONNX_RUNTIME_URL: &str = "https://github.com/microsoft/onnxruntime/releases/download/v1.23.2/onnxruntime-osx-arm64-1.23.2.tgz";

#[cfg(not(any(
    all(target_os = "windows", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "aarch64"),
    all(target_os = "macos", target_arch = "aarch64"),
)))]
const ONNX_RUNTIME_URL: &str = "";

/// 5-class NSFW classifier: drawings, hentai, neutral, porn, sexy.
pub const NSFW_MODEL_URL: &str =
    "https://huggingface.co/onnx-community/nsfw-image-detector-ONNX/resolve/main/onnx/model.onnx";

/// UltraFace RFB-320 face detector.
pub const FACE_DETECTOR_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";

/// GoogLeNet gender classifier (Adience).
pub const GENDER_MODEL_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/age_gender/models/gender_googlenet.onnx";

/// Reads model bytes from an `http(s)` URL or a local path.
///
/// `file://` prefixes are accepted for local paths.
pub async fn fetch_bytes(uri: &str) -> Result<Vec<u8>, DownloadError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = reqwest::get(uri)
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DownloadError::Network(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        return Ok(bytes.to_vec());
    }

    let path = uri.strip_prefix("file://").unwrap_or(uri);
    Ok(tokio::fs::read(path).await?)
}

/// Model downloader for ONNX Runtime and the three models.
pub struct ModelDownloader {
    data_dir: PathBuf,
    models_dir: PathBuf,
    lib_dir: PathBuf,
}

impl ModelDownloader {
    /// Creates a downloader rooted at the per-user data directory.
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "shroud", "Shroud")?;
        Some(Self::with_data_dir(project_dirs.data_dir()))
    }

    /// Creates a downloader rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            models_dir: data_dir.join("models"),
            lib_dir: data_dir.join("lib"),
            data_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn lib_dir(&self) -> &Path {
        &self.lib_dir
    }

    /// Returns the path to the ONNX Runtime library.
    #[cfg(target_os = "windows")]
    pub fn onnx_runtime_path(&self) -> PathBuf {
        self.lib_dir.join("onnxruntime.dll")
    }

    #[cfg(target_os = "macos")]
    pub fn onnx_runtime_path(&self) -> PathBuf {
        self.lib_dir.join("libonnxruntime.dylib")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    pub fn onnx_runtime_path(&self) -> PathBuf {
        self.lib_dir.join("libonnxruntime.so")
    }

    pub fn nsfw_model_path(&self) -> PathBuf {
        self.models_dir.join("nsfw_image_classifier.onnx")
    }

    pub fn face_detector_path(&self) -> PathBuf {
        self.models_dir.join("face_detector.onnx")
    }

    pub fn gender_model_path(&self) -> PathBuf {
        self.models_dir.join("gender_classifier.onnx")
    }

    pub fn is_onnx_runtime_installed(&self) -> bool {
        self.onnx_runtime_path().exists()
    }

    pub fn is_nsfw_model_installed(&self) -> bool {
        self.nsfw_model_path().exists()
    }

    pub fn are_face_models_installed(&self) -> bool {
        self.face_detector_path().exists() && self.gender_model_path().exists()
    }

    /// Downloads ONNX Runtime if not already installed.
    pub async fn ensure_onnx_runtime(
        &self,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, DownloadError> {
        if self.is_onnx_runtime_installed() {
            report(&progress, DownloadProgress::complete("ONNX Runtime already installed"));
            return Ok(self.onnx_runtime_path());
        }

        self.download_onnx_runtime(progress).await
    }

    /// Downloads the NSFW classifier if not already installed.
    pub async fn ensure_nsfw_model(
        &self,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, DownloadError> {
        let path = self.nsfw_model_path();
        if path.exists() {
            report(&progress, DownloadProgress::complete("NSFW model already installed"));
            return Ok(path);
        }

        download_to(NSFW_MODEL_URL, &path, "NSFW model", &progress).await?;
        Ok(path)
    }

    /// Downloads the face detector and gender classifier if missing.
    pub async fn ensure_face_models(
        &self,
        progress: Option<ProgressCallback>,
    ) -> Result<(), DownloadError> {
        let targets = [
            (FACE_DETECTOR_URL, self.face_detector_path(), "face detector"),
            (GENDER_MODEL_URL, self.gender_model_path(), "gender model"),
        ];

        for (url, path, label) in targets {
            if path.exists() {
                report(&progress, DownloadProgress::complete(&format!("{} already installed", label)));
                continue;
            }
            download_to(url, &path, label, &progress).await?;
        }

        Ok(())
    }

    /// Ensures the runtime and every model are installed.
    pub async fn ensure_all(&self, progress: Option<ProgressCallback>) -> Result<(), DownloadError> {
        self.ensure_onnx_runtime(progress.clone()).await?;
        self.ensure_nsfw_model(progress.clone()).await?;
        self.ensure_face_models(progress).await?;
        Ok(())
    }

    /// Deletes downloaded models. The runtime library is kept.
    pub fn remove_models(&self) -> Result<usize, DownloadError> {
        let mut removed = 0;
        for path in [
            self.nsfw_model_path(),
            self.face_detector_path(),
            self.gender_model_path(),
        ] {
            if path.exists() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn download_onnx_runtime(
        &self,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, DownloadError> {
        if ONNX_RUNTIME_URL.is_empty() {
            return Err(DownloadError::NotFound(
                "ONNX Runtime not available for this platform".to_string(),
            ));
        }

        fs::create_dir_all(&self.lib_dir)?;

        report(
            &progress,
            DownloadProgress::new(
                &format!("Downloading ONNX Runtime v{}...", ONNX_RUNTIME_VERSION),
                0,
                None,
            ),
        );

        let bytes = fetch_bytes(ONNX_RUNTIME_URL).await?;

        report(
            &progress,
            DownloadProgress::new("Extracting ONNX Runtime...", bytes.len() as u64, None),
        );

        #[cfg(target_os = "windows")]
        self.extract_zip(&bytes, "onnxruntime.dll")?;

        #[cfg(not(target_os = "windows"))]
        self.extract_tgz(&bytes)?;

        report(&progress, DownloadProgress::complete("ONNX Runtime installed"));
        Ok(self.onnx_runtime_path())
    }

    /// Extracts a DLL from a ZIP archive (Windows).
    #[cfg(target_os = "windows")]
    fn extract_zip(&self, data: &[u8], dll_name: &str) -> Result<(), DownloadError> {
        use std::io::{Cursor, Read};
        use zip::ZipArchive;

        let mut archive =
            ZipArchive::new(Cursor::new(data)).map_err(|e| DownloadError::Archive(e.to_string()))?;

        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| DownloadError::Archive(e.to_string()))?;

            if file.name().ends_with(dll_name) {
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer)?;
                File::create(self.lib_dir.join(dll_name))?.write_all(&buffer)?;
                return Ok(());
            }
        }

        Err(DownloadError::Archive(format!("{} not found in archive", dll_name)))
    }

    /// Extracts the shared library from a tar.gz archive.
    #[cfg(not(target_os = "windows"))]
    fn extract_tgz(&self, data: &[u8]) -> Result<(), DownloadError> {
        use flate2::read::GzDecoder;
        use std::io::Cursor;
        use tar::Archive;

        let mut archive = Archive::new(GzDecoder::new(Cursor::new(data)));
        let lib_path = self.onnx_runtime_path();
        let lib_name = lib_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        for entry in archive
            .entries()
            .map_err(|e| DownloadError::Archive(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| DownloadError::Archive(e.to_string()))?;
            let is_lib = entry
                .path()
                .map_err(|e| DownloadError::Archive(e.to_string()))?
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&lib_name));

            if is_lib && entry.header().entry_type().is_file() {
                let mut dest_file = File::create(&lib_path)?;
                io::copy(&mut entry, &mut dest_file)?;
                dest_file.flush()?;
                return Ok(());
            }
        }

        Err(DownloadError::Archive(format!("{} not found in archive", lib_name)))
    }

    /// Environment variable read by the ONNX Runtime loader.
    pub fn onnx_lib_env_var() -> &'static str {
        "ORT_DYLIB_PATH"
    }

    /// Points the ONNX Runtime loader at the downloaded library.
    ///
    /// Call before any other thread is started.
    pub fn setup_environment(&self) -> bool {
        if self.is_onnx_runtime_installed() {
            let lib_path = self.onnx_runtime_path();
            std::env::set_var(Self::onnx_lib_env_var(), &lib_path);
            tracing::info!("Set {} to {:?}", Self::onnx_lib_env_var(), lib_path);
            true
        } else {
            false
        }
    }

    /// Current installation status.
    pub fn status(&self) -> MlStatus {
        let has_runtime = self.is_onnx_runtime_installed();
        let has_models = self.is_nsfw_model_installed() && self.are_face_models_installed();

        match (has_runtime, has_models) {
            (true, true) => MlStatus::Ready,
            (false, true) => MlStatus::MissingRuntime,
            (true, false) => MlStatus::MissingModels,
            (false, false) => MlStatus::MissingAll,
        }
    }
}

fn report(progress: &Option<ProgressCallback>, update: DownloadProgress) {
    if let Some(cb) = progress {
        cb(update);
    }
}

async fn download_to(
    url: &str,
    path: &Path,
    label: &str,
    progress: &Option<ProgressCallback>,
) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    report(progress, DownloadProgress::new(&format!("Downloading {}...", label), 0, None));
    let bytes = fetch_bytes(url).await?;

    let mut file = File::create(path)?;
    file.write_all(&bytes)?;

    report(progress, DownloadProgress::complete(&format!("{} installed", label)));
    tracing::info!(bytes = bytes.len(), "Saved {} to {:?}", label, path);
    Ok(())
}

/// Status of ML dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlStatus {
    /// Runtime and models are installed.
    Ready,
    MissingRuntime,
    MissingModels,
    MissingAll,
}

impl MlStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, MlStatus::Ready)
    }

    /// Returns a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            MlStatus::Ready => "Detection models ready",
            MlStatus::MissingRuntime => "ONNX Runtime not installed",
            MlStatus::MissingModels => "Detection models not installed",
            MlStatus::MissingAll => "ONNX Runtime and detection models not installed",
        }
    }
}
