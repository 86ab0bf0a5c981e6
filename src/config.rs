use crate::safety::SafetyPolicy;
use crate::screenshot::CaptureSettings;
use crate::worker::WorkerConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub instrument: InstrumentConfig,
    pub logging: LoggingConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct InstrumentConfig {
    /// `TCPIP::<host>::INSTR`, `TCPIP::<host>::<port>::SOCKET` or a bare host.
    pub resource: String,
    pub timeout_ms: u64,
    pub capture_timeout_ms: u64,
    /// Pause between hardcopy setup and the capture trigger.
    pub capture_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_path: String,
    /// Record every worker event to a JSON-lines file under `log_path`.
    pub event_log: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub output_dir: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Pause between live-view frames.
    pub interval_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            resource: "TCPIP::192.168.1.100::INSTR".to_string(),
            timeout_ms: 5000,
            capture_timeout_ms: 10_000,
            capture_delay_ms: 150,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_path: "./logs".to_string(),
            event_log: true,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: "./captures".to_string(),
            width: None,
            height: None,
            interval_ms: 0,
        }
    }
}

impl CaptureConfig {
    /// Resize target, only when both dimensions are set.
    pub fn target(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let instrument = &self.instrument;
        if instrument.resource.trim().is_empty() {
            return Err(ConfigError::Message(
                "instrument.resource must not be empty".to_string(),
            ));
        }
        if instrument.timeout_ms == 0 || instrument.capture_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "instrument timeouts must be greater than zero".to_string(),
            ));
        }
        if instrument.capture_timeout_ms < instrument.timeout_ms {
            return Err(ConfigError::Message(format!(
                "instrument.capture_timeout_ms ({}) is shorter than timeout_ms ({})",
                instrument.capture_timeout_ms, instrument.timeout_ms
            )));
        }
        if matches!(self.capture.width, Some(0)) || matches!(self.capture.height, Some(0)) {
            return Err(ConfigError::Message(
                "capture width and height must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl From<&AppConfig> for WorkerConfig {
    fn from(config: &AppConfig) -> Self {
        let instrument = &config.instrument;
        let capture_timeout = Duration::from_millis(instrument.capture_timeout_ms);
        WorkerConfig {
            timeout: Duration::from_millis(instrument.timeout_ms),
            capture: CaptureSettings {
                capture_timeout,
                prepare_delay: Duration::from_millis(instrument.capture_delay_ms),
            },
            transfer_timeout: capture_timeout,
            policy: SafetyPolicy::DEFAULT,
        }
    }
}

/// Load configuration with layered fallbacks: defaults, then the TOML file,
/// then `RUSTY_SCOPE__SECTION__KEY` environment overrides.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else if Path::new("scope.toml").exists() {
        builder = builder.add_source(File::with_name("scope.toml"));
    }

    builder = builder.add_source(
        Environment::with_prefix("RUSTY_SCOPE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
