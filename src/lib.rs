// Library exports for the surgical tray detection service

pub mod core;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{ConfigError, DetectionError},
    labels::{Catalog, InstrumentLabelMap, UnmappedLabelPolicy},
    types::{
        ApiDetection, Detection, InstrumentCount, MissingItem, TrayCheckReport,
        TrayConfiguration, TrayItem, WeightMismatch,
    },
};

pub use crate::services::DetectionService;

pub use crate::utils::{decode_image_async, draw_detection_overlay, Metrics};
