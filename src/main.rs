// Entry point for the surgical tray detection service

use trayscan::{
    core::errors::DetectionError,
    core::labels::Catalog,
    core::types::{ApiDetection, Detection, TrayCheckReport, TrayConfiguration},
    services::DetectionService,
    utils::{decode_image_async, Metrics},
    Config,
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    catalog: Arc<Catalog>,
    detector: Arc<DetectionService>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "trayscan={},ort=off",
        match config.server.log_level {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== SURGICAL TRAY DETECTION SERVICE ===");

    // Load the instrument catalog once; it is immutable for the process lifetime
    let catalog = Arc::new(Catalog::load(&config.catalog.path)?);
    info!(
        "Catalog: {} instruments, {} tray configurations",
        catalog.instruments.len(),
        catalog.trays.len()
    );

    // Initialize the detector (loads the model, builds the session pool)
    let detector = Arc::new(DetectionService::new(Arc::clone(&config), Arc::clone(&catalog)).await?);

    let metrics = Metrics::new();
    let state = AppState {
        catalog,
        detector,
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Create router with monitoring endpoints
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/trays", get(trays))
        .route("/infer", post(infer))
        .route("/check", post(check))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .with_state(state)
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024)) // 25MB uploads
        .layer(cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server starting on http://{}", addr);
    info!("Endpoints:");
    info!("  GET  /         - Root endpoint");
    info!("  GET  /health   - Health check");
    info!("  GET  /trays    - Tray reference catalog");
    info!("  POST /infer    - Detect instruments (multipart/form-data)");
    info!("  POST /check    - Detect and compare against a tray");
    info!("  GET  /metrics  - Prometheus metrics");
    info!("  GET  /stats    - Detailed statistics");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Surgical Tray Detection Service"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "device": state.detector.device_type(),
    }))
}

/// Tray reference catalog, so clients can populate their selectors without
/// reading the server's configuration file.
async fn trays(State(state): State<AppState>) -> Json<HashMap<String, TrayConfiguration>> {
    state.metrics.record_endpoint_request("/trays");
    Json(state.catalog.trays.clone())
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {e}"),
        )
    })
}

/// Fields accepted by the upload endpoints.
#[derive(Default)]
struct UploadForm {
    image: Option<Vec<u8>>,
    tray: Option<String>,
    measured_weight: Option<f32>,
}

async fn parse_upload(mut multipart: Multipart) -> Result<UploadForm, (StatusCode, String)> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "image" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {e}")))?;
                form.image = Some(data.to_vec());
            }
            "tray" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {e}")))?;
                form.tray = Some(text);
            }
            "measured_weight" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {e}")))?;
                let weight = text.trim().parse().map_err(|_| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("Invalid measured_weight: {text:?}"),
                    )
                })?;
                form.measured_weight = Some(weight);
            }
            _ => {}
        }
    }

    Ok(form)
}

/// Decode the payload and run one detection pass, mapping domain errors to
/// HTTP statuses: undecodable input is the caller's fault, everything else
/// (inference failure, unmapped class id) is ours.
async fn run_detection(
    state: &AppState,
    bytes: Vec<u8>,
) -> Result<Vec<Detection>, (StatusCode, String)> {
    let img = decode_image_async(bytes)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let start = std::time::Instant::now();
    let detections = state.detector.detect(&img).await.map_err(|e| {
        error!("Detection failed: {e}");
        let status = match e {
            DetectionError::InvalidImage(_) | DetectionError::InvalidImageSize { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, e.to_string())
    })?;

    state
        .metrics
        .record_inference(start.elapsed(), detections.len());
    Ok(detections)
}

/// Detect instruments in an uploaded image.
///
/// # Request Format:
/// - multipart/form-data
/// - Field "image": the image file (PNG/JPEG)
///
/// # Response:
/// JSON array of detections in the model's native output order:
/// `[{"label": ..., "confidence": ..., "box": [x1, y1, x2, y2]}, ...]`
async fn infer(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Vec<ApiDetection>>, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/infer");
    let result = infer_inner(&state, multipart).await;
    state.metrics.record_request(result.is_ok());
    result
}

async fn infer_inner(
    state: &AppState,
    multipart: Multipart,
) -> Result<Json<Vec<ApiDetection>>, (StatusCode, String)> {
    let form = parse_upload(multipart).await?;
    let bytes = form
        .image
        .ok_or((StatusCode::BAD_REQUEST, "No image provided".to_string()))?;

    let detections = run_detection(state, bytes).await?;
    info!("Inference request completed: {} detections", detections.len());

    Ok(Json(detections.iter().map(ApiDetection::from).collect()))
}

/// Detect instruments and compare the result against a named tray
/// configuration.
///
/// # Request Format:
/// - multipart/form-data
/// - Field "image": the image file (PNG/JPEG)
/// - Field "tray": tray configuration name from the catalog
/// - Field "measured_weight" (optional): scale reading in kilograms
async fn check(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<TrayCheckReport>, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/check");
    let result = check_inner(&state, multipart).await;
    state.metrics.record_request(result.is_ok());
    result
}

async fn check_inner(
    state: &AppState,
    multipart: Multipart,
) -> Result<Json<TrayCheckReport>, (StatusCode, String)> {
    let form = parse_upload(multipart).await?;
    let bytes = form
        .image
        .ok_or((StatusCode::BAD_REQUEST, "No image provided".to_string()))?;
    let tray_name = form
        .tray
        .ok_or((StatusCode::BAD_REQUEST, "No tray provided".to_string()))?;

    let tray = state
        .catalog
        .tray(&tray_name)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        .clone();

    let detections = run_detection(state, bytes).await?;
    let report = tray.check(&tray_name, &detections, form.measured_weight);
    info!(
        "Check request completed: tray {:?}, {} detections, complete={}",
        tray_name,
        detections.len(),
        report.complete
    );

    Ok(Json(report))
}
