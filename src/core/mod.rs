pub mod config;
pub mod errors;
pub mod labels;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ConfigError, DetectionError};
pub use labels::{Catalog, InstrumentLabelMap, UnmappedLabelPolicy};
pub use types::{
    ApiDetection, Detection, InstrumentCount, MissingItem, TrayCheckReport, TrayConfiguration,
    TrayItem, WeightMismatch,
};
