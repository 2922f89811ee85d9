use crate::constants::READ_TIMEOUT;
use crate::error::{DriverError, Result};
use crate::time::TimePolicy;
use crate::transport::DeviceDescriptor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Driver settings, usually read from a JSON file and then adjusted from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub device: DeviceDescriptor,
    pub read_timeout_ms: u64,
    pub time_policy: TimePolicy,
    /// Minutes east of UTC the meter clock is kept in
    pub timezone_offset_minutes: i32,
    /// Upload group the readings belong to
    pub group_id: Option<String>,
    /// Prefix of the composite device id
    pub driver_tag: String,
    pub model: String,
    pub manufacturers: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device: DeviceDescriptor::default(),
            read_timeout_ms: READ_TIMEOUT.as_millis() as u64,
            time_policy: TimePolicy::default(),
            timezone_offset_minutes: 0,
            group_id: None,
            driver_tag: "CareSens".to_string(),
            model: "CareSens N Premier".to_string(),
            manufacturers: vec!["i-SENS".to_string()],
        }
    }
}

impl DriverConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: DriverConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_timeout_ms == 0 {
            return Err(DriverError::Config("read_timeout_ms must be positive".to_string()));
        }
        if self.timezone_offset_minutes.abs() >= 24 * 60 {
            return Err(DriverError::Config(format!(
                "timezone offset {} is out of range",
                self.timezone_offset_minutes
            )));
        }
        if self.driver_tag.is_empty() {
            return Err(DriverError::Config("driver_tag must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// `"{driver_tag}-{serial}"`
    pub fn device_id(&self, serial: &str) -> String {
        format!("{}-{}", self.driver_tag, serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DriverConfig =
            serde_json::from_str(r#"{ "timezone_offset_minutes": -300, "time_policy": { "tolerance_minutes": 5 } }"#)
                .unwrap();
        assert_eq!(config.timezone_offset_minutes, -300);
        assert_eq!(config.time_policy.tolerance_minutes, 5);
        assert!(config.time_policy.auto_correct);
        assert_eq!(config.read_timeout(), READ_TIMEOUT);
        assert_eq!(config.device.vendor_id, 0x10C4);
        config.validate().unwrap();
    }

    #[test]
    fn test_device_id() {
        assert_eq!(DriverConfig::default().device_id("ABC123"), "CareSens-ABC123");
    }

    #[test]
    fn test_invalid_offset() {
        let config = DriverConfig {
            timezone_offset_minutes: 24 * 60,
            ..DriverConfig::default()
        };
        assert!(matches!(config.validate(), Err(DriverError::Config(_))));
    }
}
