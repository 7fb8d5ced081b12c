//! Configuration management.
//!
//! Settings load from an optional TOML file plus `PISPEC_`-prefixed
//! environment variables (double underscore as section separator, e.g.
//! `PISPEC_LINK__BAUD_RATE=4000000`). Every field has a default so the
//! application runs with no config file at all.

use crate::error::{AppResult, PispecError};
use crate::protocol::ProtocolRev;
use config::Config;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub log_level: LogLevel,
    pub link: LinkSettings,
    pub watchdog: WatchdogSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_filter(&self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Serial device path. `None` means discover by USB vendor ID at startup.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Overall deadline for trace-buffer retrieval reads.
    pub adc_timeout_ms: u64,
    pub protocol_rev: ProtocolRev,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            adc_timeout_ms: 1_000,
            protocol_rev: ProtocolRev::default(),
        }
    }
}

impl LinkSettings {
    pub fn adc_timeout(&self) -> Duration {
        Duration::from_millis(self.adc_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub poll_interval_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}

impl WatchdogSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Settings {
    /// Load settings from `config_path` (if given) and the environment.
    pub fn new(config_path: Option<&str>) -> AppResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let cfg = builder
            .add_source(
                config::Environment::with_prefix("PISPEC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(PispecError::Config)?;

        let settings: Self = cfg.try_deserialize().map_err(PispecError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks the deserializer cannot express.
    pub fn validate(&self) -> AppResult<()> {
        // Observed hardware range: 9600 (legacy controller) to 4 MBaud (ADC).
        if !(9_600..=4_000_000).contains(&self.link.baud_rate) {
            return Err(PispecError::Configuration(format!(
                "baud_rate {} outside supported range 9600..=4000000",
                self.link.baud_rate
            )));
        }
        if self.link.adc_timeout_ms == 0 {
            return Err(PispecError::Configuration(
                "adc_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.watchdog.poll_interval_ms == 0 {
            return Err(PispecError::Configuration(
                "watchdog poll_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let settings = Settings::default();
        assert_eq!(settings.link.baud_rate, 115_200);
        assert_eq!(settings.link.protocol_rev, ProtocolRev::Rev2);
        assert_eq!(settings.watchdog.poll_interval(), Duration::from_millis(250));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_baud() {
        let mut settings = Settings::default();
        settings.link.baud_rate = 300;
        assert!(settings.validate().is_err());
        settings.link.baud_rate = 5_000_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut settings = Settings::default();
        settings.link.adc_timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.watchdog.poll_interval_ms = 0;
        assert!(settings.validate().is_err());
    }
}
