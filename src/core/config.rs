use crate::core::errors::{ConfigError, ConfigResult};
use crate::core::labels::UnmappedLabelPolicy;
use std::env;
use std::path::PathBuf;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: Level,
}

/// Detection configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub model_path: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub target_size: u32,
    pub inference_backend: Option<String>,
    pub session_pool_size: usize,
    pub unmapped_label_policy: UnmappedLabelPolicy,
}

/// Catalog file location
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub path: PathBuf,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub catalog: CatalogConfig,
}

impl Config {
    pub fn new() -> ConfigResult<Self> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> ConfigResult<Self> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let unmapped_label_policy = match env::var("UNMAPPED_LABEL_POLICY") {
            Ok(value) => UnmappedLabelPolicy::parse(&value)?,
            Err(_) => UnmappedLabelPolicy::default(),
        };

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8000),
                log_level,
            },
            detection: DetectionConfig {
                model_path: env::var("MODEL_PATH")
                    .unwrap_or_else(|_| "models/tray_detector.onnx".to_string()),
                confidence_threshold: env::var("CONFIDENCE_THRESHOLD")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.1),
                iou_threshold: env::var("IOU_THRESHOLD")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.45),
                target_size: env::var("TARGET_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(640),
                inference_backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
                session_pool_size: env::var("SESSION_POOL_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| std::cmp::min(num_cpus::get(), 4).max(1)),
                unmapped_label_policy,
            },
            catalog: CatalogConfig {
                path: env::var("CONFIG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("config.json")),
            },
        })
    }

    fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.detection.confidence_threshold,
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(ConfigError::InvalidIoUThreshold(self.detection.iou_threshold));
        }

        if !(320..=2048).contains(&self.detection.target_size) {
            return Err(ConfigError::InvalidTargetSize(self.detection.target_size));
        }

        if self.detection.session_pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize);
        }

        Ok(())
    }
}

// Note: No Default implementation because Config::new() can fail
// Users should explicitly call Config::new()? and handle errors

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                log_level: Level::INFO,
            },
            detection: DetectionConfig {
                model_path: "models/tray_detector.onnx".to_string(),
                confidence_threshold: 0.1,
                iou_threshold: 0.45,
                target_size: 640,
                inference_backend: None,
                session_pool_size: 2,
                unmapped_label_policy: UnmappedLabelPolicy::Reject,
            },
            catalog: CatalogConfig {
                path: PathBuf::from("config.json"),
            },
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn out_of_range_thresholds_are_rejected() {
        let mut config = base_config();
        config.detection.confidence_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfidenceThreshold(_))
        ));

        let mut config = base_config();
        config.detection.iou_threshold = -0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIoUThreshold(_))
        ));

        let mut config = base_config();
        config.detection.target_size = 64;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTargetSize(64))
        ));

        let mut config = base_config();
        config.detection.session_pool_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPoolSize)));
    }
}
