pub mod detection;
pub mod onnx_builder;

// Re-export commonly used services
pub use detection::DetectionService;
