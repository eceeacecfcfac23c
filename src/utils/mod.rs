pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{decode_image_async, draw_detection_overlay, label_colour};
pub use metrics::Metrics;
