//! Shroud Server - HTTP API server.
//!
//! This crate exposes the detection pipeline over HTTP.
//!
//! ## Endpoints
//!
//! - `POST /api/detect` - Classify a base64-encoded image
//! - `POST /api/filter` - Classify an image and decide whether to show it
//! - `GET /api/status` - Model state and queue snapshot
//! - `DELETE /api/cache` - Clear the result cache
//! - `POST /api/models/reload` - Load (or force-reload) the models
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shroud_core::{ModelLoadOptions, OnnxEngineFactory};
//! use shroud_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(
//!         ServerConfig::default(),
//!         Arc::new(OnnxEngineFactory::default()),
//!         ModelLoadOptions::default(),
//!     )
//!     .unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use shroud_core::{DetectError, Detector, EngineFactory, ModelLoadOptions};
use shroud_storage::Database;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 48765;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Largest accepted request body. Images travel base64-encoded.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 48765).
    pub port: u16,
    /// Weight store path (None = in-memory).
    pub db_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db_path: None,
        }
    }
}

impl ServerConfig {
    /// Creates a config with a specific database path.
    pub fn with_db_path(path: impl Into<String>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] shroud_storage::StorageError),

    /// Detector could not be started.
    #[error("detector error: {0}")]
    Detector(#[from] DetectError),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    // Browser extensions call from arbitrary origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/detect", post(handlers::detect))
        .route("/api/filter", post(handlers::filter))
        .route("/api/status", get(handlers::get_status))
        .route("/api/cache", delete(handlers::clear_cache))
        .route("/api/models/reload", post(handlers::reload_models))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
    state: AppState,
}

impl Server {
    /// Creates a new server with a fresh detector backed by the configured weight store.
    pub fn new(
        config: ServerConfig,
        engines: Arc<dyn EngineFactory>,
        load_options: ModelLoadOptions,
    ) -> std::result::Result<Self, ServerError> {
        let db = if let Some(ref path) = config.db_path {
            Database::with_path(path)?
        } else {
            Database::in_memory()?
        };

        let detector = Detector::builder()
            .engines(engines)
            .weight_store(Arc::new(db))
            .build()?;

        Self::with_state(config, AppState::new(Arc::new(detector), load_options))
    }

    /// Creates a server with custom application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let router = router(state.clone());

        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router,
            addr,
            state,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the shared detector.
    pub fn detector(&self) -> Arc<Detector> {
        Arc::clone(&self.state.detector)
    }

    /// Runs the server until shutdown.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        info!("Starting Shroud API server on {}", self.addr);

        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Allow address reuse (helps with TIME_WAIT sockets after a restart)
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Set non-blocking for tokio
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        axum::serve(listener, self.router)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use image::{Rgba, RgbaImage};
    use serde_json::{json, Value};
    use shroud_core::{
        ClassifierInput, DetectedFace, FaceAnalyzer, FaceBox, FaceDetectorConfig, Gender,
        ImageClassifier, InferenceError, ModelLoadError,
    };
    use std::io::Cursor;
    use tower::ServiceExt;

    struct FixedEngines {
        scores: Vec<f32>,
        faces: Vec<DetectedFace>,
    }

    struct FixedClassifier(Vec<f32>);

    impl ImageClassifier for FixedClassifier {
        fn input_size(&self) -> u32 {
            8
        }

        fn predict(&mut self, _input: &ClassifierInput) -> std::result::Result<Vec<f32>, InferenceError> {
            Ok(self.0.clone())
        }
    }

    struct FixedFaces(Vec<DetectedFace>);

    impl FaceAnalyzer for FixedFaces {
        fn detect(&mut self, _image: &RgbaImage) -> std::result::Result<Vec<DetectedFace>, InferenceError> {
            Ok(self.0.clone())
        }
    }

    impl EngineFactory for FixedEngines {
        fn load_classifier(
            &self,
            _weights: &[u8],
        ) -> std::result::Result<Box<dyn ImageClassifier>, ModelLoadError> {
            Ok(Box::new(FixedClassifier(self.scores.clone())))
        }

        fn load_detector(
            &self,
            _config: &FaceDetectorConfig,
        ) -> std::result::Result<Box<dyn FaceAnalyzer>, ModelLoadError> {
            Ok(Box::new(FixedFaces(self.faces.clone())))
        }
    }

    fn female_face() -> DetectedFace {
        DetectedFace {
            gender: Gender::Female,
            gender_score: 0.9,
            confidence: 0.8,
            bbox: FaceBox::default(),
        }
    }

    /// Builds a server whose reload endpoint reads weights from a temp file.
    fn create_test_app(engines: FixedEngines) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("classifier.onnx");
        std::fs::write(&weights, b"weights").unwrap();

        let options = ModelLoadOptions {
            classifier_uri: weights.to_string_lossy().to_string(),
            ..Default::default()
        };
        let server = Server::new(ServerConfig::default(), Arc::new(engines), options).unwrap();
        (server.router(), dir)
    }

    fn png_base64(level: u8) -> String {
        let mut png = Vec::new();
        RgbaImage::from_pixel(16, 16, Rgba([level, level, level, 255]))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        STANDARD.encode(png)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn reload(app: &Router) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/models/reload")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["models"], "ready");
    }

    #[tokio::test]
    async fn test_status_before_load() {
        let (app, _dir) = create_test_app(FixedEngines {
            scores: vec![0.9, 0.1],
            faces: vec![],
        });

        let request = Request::builder()
            .method("GET")
            .uri("/api/status")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["models"], "unloaded");
        assert_eq!(json["ready"], false);
        assert_eq!(json["cache_size"], 0);
    }

    #[tokio::test]
    async fn test_detect_before_load_is_unavailable() {
        let (app, _dir) = create_test_app(FixedEngines {
            scores: vec![0.9, 0.1],
            faces: vec![],
        });

        let response = app
            .oneshot(post_json("/api/detect", json!({"image": png_base64(1)})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "models_not_loaded");
    }

    #[tokio::test]
    async fn test_detect_nsfw_after_reload() {
        let (app, _dir) = create_test_app(FixedEngines {
            scores: vec![0.01, 0.02, 0.07, 0.9, 0.0],
            faces: vec![],
        });
        reload(&app).await;

        let response = app
            .oneshot(post_json(
                "/api/detect",
                json!({
                    "image": format!("data:image/png;base64,{}", png_base64(3)),
                    "options": {"detect_nsfw": true, "strictness": 0.5}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["result"], "nsfw");
        assert!(json["latency_ms"].is_number());
        assert_eq!(json["details"]["nsfw_scores"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_detect_rejects_bad_payloads() {
        let (app, _dir) = create_test_app(FixedEngines {
            scores: vec![0.9, 0.1],
            faces: vec![],
        });
        reload(&app).await;

        let response = app
            .clone()
            .oneshot(post_json("/api/detect", json!({"image": "%%%"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "bad_request");

        let response = app
            .oneshot(post_json(
                "/api/detect",
                json!({"image": STANDARD.encode(b"not an image")}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "invalid_image");
    }

    #[tokio::test]
    async fn test_filter_hides_matching_gender() {
        let (app, _dir) = create_test_app(FixedEngines {
            scores: vec![0.9, 0.1],
            faces: vec![female_face()],
        });
        reload(&app).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/filter",
                json!({
                    "image": png_base64(5),
                    "options": {"detect_nsfw": true, "detect_gender": true},
                    "hide_nsfw": true,
                    "hide_gender": "female"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["show"], false);
        assert_eq!(json["reason"], "female content detected");
        assert_eq!(json["detection"]["result"], "face");

        let response = app
            .oneshot(post_json(
                "/api/filter",
                json!({
                    "image": png_base64(5),
                    "options": {"detect_nsfw": true, "detect_gender": true},
                    "hide_gender": "male"
                }),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["show"], true);
        assert!(json.get("reason").is_none());
    }

    #[tokio::test]
    async fn test_clear_cache_reports_dropped_entries() {
        let (app, _dir) = create_test_app(FixedEngines {
            scores: vec![0.9, 0.1],
            faces: vec![],
        });
        reload(&app).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/detect",
                json!({"image": png_base64(9), "options": {"detect_nsfw": true}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/cache")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(body_json(response).await["cleared"], 1);

        let request = Request::builder()
            .method("GET")
            .uri("/api/status")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(body_json(response).await["cache_size"], 0);
    }

    #[tokio::test]
    async fn test_forced_reload() {
        let (app, _dir) = create_test_app(FixedEngines {
            scores: vec![0.9, 0.1],
            faces: vec![],
        });

        let response = app
            .oneshot(post_json("/api/models/reload", json!({"force": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["models"], "ready");
    }

    #[tokio::test]
    async fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.db_path.is_none());
    }

    #[tokio::test]
    async fn test_server_config_with_port() {
        let config = ServerConfig::default().with_port(9000);
        assert_eq!(config.port, 9000);
    }
}
