//! Shroud - sensitive visual content detection.
//!
//! The `shroud` binary:
//! - `serve`: HTTP API for browser extensions and other clients
//! - `detect`: classify image files, optionally writing suppressed copies
//! - `video`: sample and classify a video file through ffmpeg
//! - `models`: download, clear or inspect the ONNX runtime and models

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use directories::ProjectDirs;
use serde_json::json;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shroud_app::{FfmpegSource, ShroudConfig};
use shroud_core::model_downloader::{ProgressCallback, NSFW_MODEL_URL};
use shroud_core::{
    apply_visual_suppression, decide, DetectionOptions, Detector, DownloadProgress, ModelDownloader,
    ModelLoadOptions, OnnxEngineFactory, MODEL_STORE_KEY,
};
use shroud_server::{Server, ServerConfig};
use shroud_storage::Database;

/// Shroud - detect and hide sensitive visual content
#[derive(Parser, Debug)]
#[command(name = "shroud", version, about)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Config file (default: <config dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,

        /// Do not load the models at startup
        #[arg(long)]
        no_preload: bool,
    },

    /// Classify image files
    Detect {
        /// Images to classify
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Write blurred copies of hidden images into this directory
        #[arg(long)]
        suppress_dir: Option<PathBuf>,

        #[command(flatten)]
        options: OptionArgs,
    },

    /// Sample frames from a video and classify them
    Video {
        file: PathBuf,

        /// Number of frames to sample
        #[arg(long)]
        frames: Option<usize>,

        #[command(flatten)]
        options: OptionArgs,
    },

    /// Manage the ONNX runtime and detection models
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
}

#[derive(Subcommand, Debug)]
enum ModelsAction {
    /// Download the runtime and every model
    Download,
    /// Delete downloaded models and stored classifier weights
    Clear,
    /// Show installation status
    Status,
}

/// Per-run overrides of the configured detection options.
#[derive(ClapArgs, Debug, Default)]
struct OptionArgs {
    /// Unsafe-class score threshold (0.0 to 1.0)
    #[arg(long)]
    strictness: Option<f32>,

    /// Skip the NSFW classifier
    #[arg(long)]
    no_nsfw: bool,

    /// Skip face detection
    #[arg(long)]
    no_faces: bool,

    /// Only male faces trigger the face verdict
    #[arg(long)]
    male: bool,

    /// Only female faces trigger the face verdict
    #[arg(long)]
    female: bool,
}

impl OptionArgs {
    fn apply(&self, mut options: DetectionOptions) -> DetectionOptions {
        if let Some(strictness) = self.strictness {
            options.strictness = strictness;
        }
        if self.no_nsfw {
            options.detect_nsfw = false;
        }
        if self.no_faces {
            options.detect_gender = false;
        }
        if self.male || self.female {
            options.detect_gender = !self.no_faces;
            options.detect_male = self.male;
            options.detect_female = self.female;
        }
        options
    }
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "shroud", "Shroud").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "shroud={0},shroud_core={0},shroud_server={0},shroud_storage={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("shroud")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                // Console gets logs on stderr so stdout stays machine-readable
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn open_database(config: &ShroudConfig) -> anyhow::Result<Database> {
    let db = match &config.db_path {
        Some(path) => Database::with_path(path),
        None => Database::new(),
    };
    db.context("failed to open weight store")
}

/// Prefers an already downloaded classifier over fetching the default URL.
fn resolve_load_options(config: &ShroudConfig, downloader: Option<&ModelDownloader>) -> ModelLoadOptions {
    let mut options = config.models.clone();
    if options.classifier_uri == NSFW_MODEL_URL {
        if let Some(d) = downloader.filter(|d| d.is_nsfw_model_installed()) {
            options.classifier_uri = d.nsfw_model_path().to_string_lossy().to_string();
        }
    }
    options
}

async fn ready_detector(
    config: &ShroudConfig,
    downloader: Option<&ModelDownloader>,
) -> anyhow::Result<Detector> {
    let db = open_database(config)?;
    let detector = Detector::builder()
        .engines(Arc::new(OnnxEngineFactory::default()))
        .weight_store(Arc::new(db))
        .build()?;

    detector
        .load_models(resolve_load_options(config, downloader))
        .await
        .context("failed to load detection models")?;
    Ok(detector)
}

async fn serve(
    config: &ShroudConfig,
    downloader: Option<&ModelDownloader>,
    host: Option<String>,
    port: Option<u16>,
    no_preload: bool,
) -> anyhow::Result<()> {
    let server_config = ServerConfig {
        host: host.unwrap_or_else(|| config.server.host.clone()),
        port: port.unwrap_or(config.server.port),
        db_path: match &config.db_path {
            Some(path) => Some(path.to_string_lossy().to_string()),
            None => Some(Database::default_db_path()?.to_string_lossy().to_string()),
        },
    };

    let load_options = resolve_load_options(config, downloader);
    let server = Server::new(
        server_config,
        Arc::new(OnnxEngineFactory::default()),
        load_options.clone(),
    )?;

    if !no_preload {
        let detector = server.detector();
        tokio::spawn(async move {
            match detector.load_models(load_options).await {
                Ok(()) => tracing::info!("Models ready"),
                Err(e) => tracing::error!("Model preload failed: {}", e),
            }
        });
    }

    server.run().await?;
    Ok(())
}

fn suppressed_path(dir: &Path, file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    dir.join(format!("{}.suppressed.png", stem))
}

async fn detect_files(
    config: &ShroudConfig,
    downloader: Option<&ModelDownloader>,
    files: &[PathBuf],
    suppress_dir: Option<&Path>,
    options: DetectionOptions,
) -> anyhow::Result<()> {
    let detector = ready_detector(config, downloader).await?;
    if let Some(dir) = suppress_dir {
        std::fs::create_dir_all(dir)?;
    }

    for file in files {
        let bytes = match tokio::fs::read(file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot read {:?}: {}", file, e);
                println!("{}", json!({"file": file, "error": e.to_string()}));
                continue;
            }
        };

        let detection = match detector.detect_bytes(&bytes, options).await {
            Ok(detection) => detection,
            Err(e) => {
                tracing::warn!("Detection failed for {:?}: {}", file, e);
                println!("{}", json!({"file": file, "error": e.to_string()}));
                continue;
            }
        };

        let decision = decide(&detection, config.filter.hide_nsfw, config.filter.hide_gender);
        let mut output = None;

        if let (Some(dir), false) = (suppress_dir, decision.show) {
            let image = image::load_from_memory(&bytes)?.to_rgba8();
            let suppressed = apply_visual_suppression(&image, &config.suppression);
            let path = suppressed_path(dir, file);
            suppressed
                .save(&path)
                .with_context(|| format!("failed to write {:?}", path))?;
            output = Some(path);
        }

        println!(
            "{}",
            json!({
                "file": file,
                "result": detection.result,
                "gender": detection.gender,
                "show": decision.show,
                "reason": decision.reason,
                "suppressed": output,
            })
        );
    }

    Ok(())
}

async fn detect_video(
    config: &ShroudConfig,
    downloader: Option<&ModelDownloader>,
    file: PathBuf,
    frames: usize,
    options: DetectionOptions,
) -> anyhow::Result<()> {
    let detector = ready_detector(config, downloader).await?;
    let report = detector
        .detect_video(Arc::new(FfmpegSource::new(file)), frames, options)
        .await?;

    tracing::info!(
        verdict = %report.verdict,
        frames = report.summary.total_frames,
        "Video classified"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn manage_models(
    config: &ShroudConfig,
    downloader: Option<&ModelDownloader>,
    action: ModelsAction,
) -> anyhow::Result<()> {
    let downloader = downloader.context("could not determine data directory")?;

    match action {
        ModelsAction::Download => {
            let progress: ProgressCallback = Arc::new(|p: DownloadProgress| {
                if p.complete {
                    println!("{}", p.step);
                } else if let Some(pct) = p.percentage() {
                    println!("{} {}%", p.step, pct);
                } else {
                    println!("{}", p.step);
                }
            });
            downloader.ensure_all(Some(progress)).await?;
            println!("{}", downloader.status().description());
        }
        ModelsAction::Clear => {
            let removed = downloader.remove_models()?;
            let db = open_database(config)?;
            let stored = db.delete_weights(MODEL_STORE_KEY)?;
            println!(
                "Removed {} model file(s){}",
                removed,
                if stored { " and stored classifier weights" } else { "" }
            );
        }
        ModelsAction::Status => {
            let status = downloader.status();
            println!("{}", status.description());
            println!("  runtime:        {:?}", downloader.onnx_runtime_path());
            println!("  classifier:     {:?}", downloader.nsfw_model_path());
            println!("  face detector:  {:?}", downloader.face_detector_path());
            println!("  gender model:   {:?}", downloader.gender_model_path());

            let db = open_database(config)?;
            for info in db.list_weights()? {
                println!(
                    "  stored {}: {} bytes, sha256 {}, saved {}",
                    info.key, info.size, info.sha256, info.saved_at
                );
            }
        }
    }

    Ok(())
}

async fn run(args: Args, config: ShroudConfig, downloader: Option<ModelDownloader>) -> anyhow::Result<()> {
    let downloader = downloader.as_ref();

    match args.command {
        Command::Serve {
            host,
            port,
            no_preload,
        } => serve(&config, downloader, host, port, no_preload).await,
        Command::Detect {
            files,
            suppress_dir,
            options,
        } => {
            let options = options.apply(config.detection);
            detect_files(&config, downloader, &files, suppress_dir.as_deref(), options).await
        }
        Command::Video {
            file,
            frames,
            options,
        } => {
            let options = options.apply(config.detection);
            let frames = frames.unwrap_or(config.frame_count);
            detect_video(&config, downloader, file, frames, options).await
        }
        Command::Models { action } => manage_models(&config, downloader, action).await,
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Point ort at the downloaded runtime before any other thread starts
    let downloader = ModelDownloader::new();
    let runtime_found = downloader
        .as_ref()
        .map(|d| d.setup_environment())
        .unwrap_or(false);

    // Keep guard alive for the duration of the program
    let _log_guard = init_logging(&args);
    tracing::debug!("Args: {:?}", args);
    if !runtime_found {
        tracing::debug!("ONNX Runtime not downloaded, relying on system library");
    }

    let config = match &args.config {
        Some(path) => ShroudConfig::load_from(path),
        None => ShroudConfig::load(),
    }
    .context("failed to load config")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args, config, downloader))
}
