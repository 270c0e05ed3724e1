//! Gateway configuration.
//!
//! Handed to the gateway at construction time. The daemon reads it from an
//! optional JSON file; every field has a default so a partial file works.

use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Inclusive range with step, in the user-facing unit (km/h or percent).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Advertised local name
    pub device_name: String,
    /// When false every Request Control is answered with "control not permitted"
    pub control_allowed: bool,
    /// km/h
    pub speed_range: ValueRange,
    /// percent
    pub incline_range: ValueRange,
    pub notify_interval_ms: u64,
    pub advertise_retry_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            device_name: "Precor 9.31".to_string(),
            control_allowed: true,
            // 0.5 - 12.0 mph in 0.1 mph steps
            speed_range: ValueRange { min: 0.8, max: 19.31, step: 0.16 },
            incline_range: ValueRange { min: 0.0, max: 15.0, step: 1.0 },
            notify_interval_ms: 250,
            advertise_retry_ms: 1000,
        }
    }
}

impl GatewayConfig {
    /// Never zero; a zero tokio interval panics.
    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms.max(1))
    }

    pub fn advertise_retry(&self) -> Duration {
        Duration::from_millis(self.advertise_retry_ms)
    }
}

/// Load config from disk. A missing file yields the defaults; a file that
/// exists but cannot be read or parsed is an error.
pub fn load(path: &str) -> Result<GatewayConfig, ConfigError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No config at {}, using defaults", path);
            return Ok(GatewayConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io { path: path.to_string(), source });
        }
    };
    let cfg: GatewayConfig = serde_json::from_str(&data)
        .map_err(|source| ConfigError::Parse { path: path.to_string(), source })?;
    info!(
        "Loaded config: name={}, control_allowed={}",
        cfg.device_name, cfg.control_allowed
    );
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_partial() {
        let dir = std::env::temp_dir().join("ftms_config_test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("partial.json");
        std::fs::write(&path, r#"{"device_name":"Lab Treadmill","control_allowed":false}"#)
            .unwrap();

        let cfg = load(path.to_str().unwrap()).expect("should parse partial config");
        assert_eq!(cfg.device_name, "Lab Treadmill");
        assert!(!cfg.control_allowed);
        assert_eq!(cfg.notify_interval(), Duration::from_millis(250));
        assert_eq!(cfg.speed_range, GatewayConfig::default().speed_range);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing() {
        let cfg = load("/tmp/ftms_nonexistent_config.json").unwrap();
        assert_eq!(cfg, GatewayConfig::default());
    }

    #[test]
    fn test_load_invalid() {
        let path = "/tmp/ftms_invalid_config.json";
        std::fs::write(path, "not json").unwrap();
        assert!(matches!(load(path), Err(ConfigError::Parse { .. })));
        let _ = std::fs::remove_file(path);
    }
}
