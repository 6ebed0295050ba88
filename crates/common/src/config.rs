use serde::Deserialize;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::WindowConfig;
use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub serial_port: String,
    pub serial_baudrate: u32,
    pub serial_timeout_secs: f64,
    pub ws_server_url: String,
    pub device_token: String,
    pub face_window_secs: f64,
    pub face_score_threshold: u8,
    pub face_early_accept: usize,
    pub face_reset_on_detection: bool,
    pub auto_close_delay_secs: f64,
    pub status_interval_secs: f64,
    pub log_level: String,
    pub metrics_csv: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            serial_baudrate: 115_200,
            serial_timeout_secs: 0.1,
            ws_server_url: "ws://127.0.0.1:3000/device".to_string(),
            device_token: String::new(),
            face_window_secs: 5.0,
            face_score_threshold: 80,
            face_early_accept: 2,
            face_reset_on_detection: false,
            auto_close_delay_secs: 5.0,
            status_interval_secs: 30.0,
            log_level: "info".to_string(),
            metrics_csv: None,
        }
    }
}

/// Loads defaults, then the optional TOML file, then environment overrides,
/// and validates the result.
pub fn load_config(path: Option<&str>) -> Result<ControllerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_env<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { key, value }),
    }
}

impl ControllerConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Applies `SERIAL_PORT`-style overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SERIAL_PORT") {
            self.serial_port = v;
        }
        if let Some(v) = lookup("SERIAL_BAUDRATE") {
            self.serial_baudrate = parse_env("SERIAL_BAUDRATE", v)?;
        }
        if let Some(v) = lookup("SERIAL_TIMEOUT") {
            self.serial_timeout_secs = parse_env("SERIAL_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("WS_SERVER_URL") {
            self.ws_server_url = v;
        }
        if let Some(v) = lookup("DEVICE_TOKEN") {
            self.device_token = v;
        }
        if let Some(v) = lookup("FACE_WINDOW_SECONDS") {
            self.face_window_secs = parse_env("FACE_WINDOW_SECONDS", v)?;
        }
        if let Some(v) = lookup("FACE_SCORE_THRESHOLD") {
            self.face_score_threshold = parse_env("FACE_SCORE_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("FACE_EARLY_ACCEPT") {
            self.face_early_accept = parse_env("FACE_EARLY_ACCEPT", v)?;
        }
        if let Some(v) = lookup("FACE_RESET_ON_DETECTION") {
            self.face_reset_on_detection = parse_bool("FACE_RESET_ON_DETECTION", v)?;
        }
        if let Some(v) = lookup("AUTO_CLOSE_DELAY") {
            self.auto_close_delay_secs = parse_env("AUTO_CLOSE_DELAY", v)?;
        }
        if let Some(v) = lookup("STATUS_INTERVAL") {
            self.status_interval_secs = parse_env("STATUS_INTERVAL", v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("METRICS_CSV") {
            self.metrics_csv = Some(v).filter(|p| !p.trim().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &str, secs: f64| {
            if secs.is_finite() && secs > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be a positive number of seconds, got {secs}")))
            }
        };
        positive("serial_timeout_secs", self.serial_timeout_secs)?;
        positive("face_window_secs", self.face_window_secs)?;
        positive("auto_close_delay_secs", self.auto_close_delay_secs)?;
        positive("status_interval_secs", self.status_interval_secs)?;

        if self.face_score_threshold > 100 {
            return Err(ConfigError::Invalid(format!(
                "face_score_threshold must be 0-100, got {}",
                self.face_score_threshold
            )));
        }
        if self.serial_port.trim().is_empty() {
            return Err(ConfigError::Invalid("serial_port must not be empty".into()));
        }
        if self.serial_baudrate == 0 {
            return Err(ConfigError::Invalid("serial_baudrate must be positive".into()));
        }
        if !(self.ws_server_url.starts_with("ws://") || self.ws_server_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "ws_server_url must use ws:// or wss://, got {}",
                self.ws_server_url
            )));
        }
        if self.device_token.trim().is_empty() {
            return Err(ConfigError::Invalid("device_token must be set".into()));
        }
        Ok(())
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.serial_timeout_secs)
    }

    pub fn auto_close_delay(&self) -> Duration {
        Duration::from_secs_f64(self.auto_close_delay_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs_f64(self.status_interval_secs)
    }

    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            duration: Duration::from_secs_f64(self.face_window_secs),
            score_threshold: self.face_score_threshold,
            early_accept: self.face_early_accept,
            reset_on_detection: self.face_reset_on_detection,
        }
    }
}
