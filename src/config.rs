//! Configuration management for Orderguard.

use std::path::Path;

use chrono::{FixedOffset, Weekday};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OrderGuardError, Result};
use crate::ratelimit::interval::weekday_from_sunday;
use crate::ratelimit::message::is_valid_format;
use crate::ratelimit::LimiterSettings;

/// Prefix for configuration overrides taken from the environment,
/// e.g. `ORDERGUARD__LIMITER__LIMIT=5`.
pub const ENV_PREFIX: &str = "ORDERGUARD";

/// Main configuration for Orderguard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Order limiting settings
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Store calendar and display settings
    #[serde(default)]
    pub store: StoreLocale,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store calendar and display settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocale {
    /// Offset of the store's timezone from UTC, in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// First day of the week, 0 = Sunday through 6 = Saturday
    #[serde(default = "default_week_starts_on")]
    pub week_starts_on: u8,

    /// strftime pattern used for dates in messages
    #[serde(default = "default_date_format")]
    pub date_format: String,

    /// strftime pattern used for times in messages
    #[serde(default = "default_time_format")]
    pub time_format: String,

    /// Name shown for `{timezone}`; defaults to the UTC offset
    #[serde(default)]
    pub timezone_label: Option<String>,
}

impl Default for StoreLocale {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            week_starts_on: default_week_starts_on(),
            date_format: default_date_format(),
            time_format: default_time_format(),
            timezone_label: None,
        }
    }
}

fn default_week_starts_on() -> u8 {
    1
}

fn default_date_format() -> String {
    "%B %-d, %Y".to_string()
}

fn default_time_format() -> String {
    "%-I:%M %P".to_string()
}

impl StoreLocale {
    /// The store's timezone as a fixed offset.
    pub fn offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).ok_or_else(|| {
            OrderGuardError::Config(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })
    }

    /// The configured first day of the week.
    pub fn week_start(&self) -> Result<Weekday> {
        weekday_from_sunday(self.week_starts_on).ok_or_else(|| {
            OrderGuardError::Config(format!(
                "week_starts_on must be between 0 and 6, got {}",
                self.week_starts_on
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.offset()?;
        self.week_start()?;

        for (name, format) in [("date_format", &self.date_format), ("time_format", &self.time_format)] {
            if !is_valid_format(format) {
                return Err(OrderGuardError::Config(format!(
                    "{} is not a valid strftime pattern: {:?}",
                    name, format
                )));
            }
        }

        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| OrderGuardError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)
            .map_err(|e| OrderGuardError::Config(format!("Failed to parse configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;

        if self.logging.level.trim().is_empty() {
            return Err(OrderGuardError::Config("logging.level must not be empty".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::IntervalSpec;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(!config.limiter.enabled);
        assert_eq!(config.store.week_starts_on, 1);
        assert_eq!(config.store.week_start().unwrap(), Weekday::Mon);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limiter:
  enabled: true
  limit: 5
  interval: weekly
store:
  utc_offset_minutes: -300
  week_starts_on: 0
  timezone_label: EST
logging:
  level: debug
  json: true
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.effective_limit(), 5);
        assert_eq!(config.limiter.interval, IntervalSpec::Weekly);
        assert_eq!(config.store.offset().unwrap().local_minus_utc(), -300 * 60);
        assert_eq!(config.store.week_start().unwrap(), Weekday::Sun);
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_week_start_rejected() {
        let result = AppConfig::from_yaml("store:\n  week_starts_on: 7\n");
        assert!(matches!(result, Err(OrderGuardError::Config(_))));
    }

    #[test]
    fn test_invalid_offset_rejected() {
        let result = AppConfig::from_yaml("store:\n  utc_offset_minutes: 1500\n");
        assert!(matches!(result, Err(OrderGuardError::Config(_))));
    }

    #[test]
    fn test_invalid_date_format_rejected() {
        let result = AppConfig::from_yaml("store:\n  date_format: '%Q'\n");
        assert!(matches!(result, Err(OrderGuardError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("orderguard-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  enabled: true\n  limit: 3\n  interval: hourly\n").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiter.effective_limit(), 3);
        assert_eq!(config.limiter.interval, IntervalSpec::Hourly);
    }
}
