// Custom error types for better error handling and debugging
//
// Using thiserror for ergonomic error definitions with:
// - Context preservation
// - Type-safe error matching
// - Source error chaining

use thiserror::Error;

/// Detection service errors
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("invalid image payload: {0}")]
    InvalidImage(#[source] image::ImageError),

    #[error("class id {class_id} has no entry in the instrument label map")]
    UnmappedLabel { class_id: usize },

    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("unexpected model output shape: {0}")]
    MalformedOutput(String),

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },
}

/// Configuration and catalog errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read catalog file {path}: {source}")]
    CatalogRead {
        path: String,
        source: std::io::Error,
    },

    #[error("catalog file {path} is not valid JSON: {source}")]
    CatalogParse {
        path: String,
        source: serde_json::Error,
    },

    #[error("instrument label map is empty")]
    EmptyLabelMap,

    #[error("instrument label map has non-numeric class id {0:?}")]
    NonNumericClassId(String),

    #[error("instrument label map must cover class ids 0..{expected} contiguously (missing id {missing})")]
    NonContiguousLabelMap { expected: usize, missing: usize },

    #[error("instrument {class_id} has an empty name")]
    EmptyInstrumentName { class_id: usize },

    #[error("unknown tray type {0:?}")]
    UnknownTray(String),

    #[error("confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in [0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("target_size must be between 320 and 2048, got {0}")]
    InvalidTargetSize(u32),

    #[error("session pool size must be > 0")]
    InvalidPoolSize,

    #[error("unknown unmapped-label policy {0:?} (expected \"reject\" or \"degrade\")")]
    UnknownLabelPolicy(String),
}

// Convenience type aliases for Results
pub type DetectionResult<T> = Result<T, DetectionError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
