//! Telemetry configuration
//!
//! Capacities and periods are fixed once the registries are built.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};

/// Sizing and timing of the telemetry core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Maximum number of properties
    pub max_properties: usize,
    /// Property names must be strictly shorter than this (bytes)
    pub max_property_name_len: usize,
    /// Maximum number of property groups
    pub max_groups: usize,
    /// Maximum number of properties in a single group
    pub max_group_members: usize,
    /// Maximum number of notifications
    pub max_notifications: usize,
    /// Notification names must be strictly shorter than this (bytes)
    pub max_notification_name_len: usize,
    /// Channel names must be strictly shorter than this (bytes)
    pub max_channel_name_len: usize,
    /// Format templates must be strictly shorter than this (bytes)
    pub max_template_len: usize,
    /// Upper bound of a rendered notification message (bytes)
    pub max_message_len: usize,
    /// Upper bound of a property state batch (bytes)
    pub state_buffer_len: usize,
    /// Tick of the properties task
    pub properties_period_ms: u64,
    /// Tick of the notifications task
    pub notifications_period_ms: u64,
    /// Initial value of new numeric properties
    pub default_property_value: i32,
    /// Initial `changed` flag of new properties
    pub default_property_changed: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            max_properties: 64,
            max_property_name_len: 32,
            max_groups: 10,
            max_group_members: 64,
            max_notifications: 20,
            max_notification_name_len: 64,
            max_channel_name_len: 64,
            max_template_len: 128,
            max_message_len: 1024,
            state_buffer_len: 1024,
            properties_period_ms: 100,
            notifications_period_ms: 1000,
            default_property_value: 0,
            default_property_changed: true,
        }
    }
}

impl TelemetryConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Reject configurations the registries cannot work with
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("max_properties", self.max_properties),
            ("max_property_name_len", self.max_property_name_len),
            ("max_groups", self.max_groups),
            ("max_group_members", self.max_group_members),
            ("max_notifications", self.max_notifications),
            ("max_notification_name_len", self.max_notification_name_len),
            ("max_channel_name_len", self.max_channel_name_len),
            ("max_template_len", self.max_template_len),
            ("max_message_len", self.max_message_len),
            ("state_buffer_len", self.state_buffer_len),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(TelemetryError::Config(format!("{} must be non-zero", field)));
            }
        }

        if self.properties_period_ms == 0 || self.notifications_period_ms == 0 {
            return Err(TelemetryError::Config(
                "task periods must be non-zero".to_string(),
            ));
        }

        if self.state_buffer_len < 2 {
            return Err(TelemetryError::Config(
                "state_buffer_len must fit at least an empty object".to_string(),
            ));
        }

        Ok(())
    }

    pub fn properties_period(&self) -> Duration {
        Duration::from_millis(self.properties_period_ms)
    }

    pub fn notifications_period(&self) -> Duration {
        Duration::from_millis(self.notifications_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TelemetryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.properties_period(), Duration::from_millis(100));
        assert_eq!(config.notifications_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TelemetryConfig::from_toml_str(
            r#"
            max_properties = 8
            properties_period_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.max_properties, 8);
        assert_eq!(config.properties_period_ms, 250);
        assert_eq!(config.max_groups, 10);
        assert!(config.default_property_changed);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = TelemetryConfig::from_toml_str("max_groups = 0").unwrap_err();
        assert!(matches!(err, TelemetryError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_notifications = 3").unwrap();
        writeln!(file, "default_property_value = -1").unwrap();

        let config = TelemetryConfig::load(file.path()).unwrap();
        assert_eq!(config.max_notifications, 3);
        assert_eq!(config.default_property_value, -1);
    }

    #[test]
    fn test_load_missing_file() {
        let err = TelemetryConfig::load("/nonexistent/telemetry.toml").unwrap_err();
        assert!(matches!(err, TelemetryError::Io(_)));
    }
}
