use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeviceError, Result};
use crate::serial::line_buffer::DEFAULT_LINE_BUFFER_CAPACITY;
use crate::serial::{HandleId, LineSettings};
use crate::scheduler::DEFAULT_REPLY_CAPACITY;

/// Modem family. Only the line configuration depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Vendor {
    #[default]
    Generic,
    /// Ai-Thinker A6/A7 GSM modules
    AiThinkerA7,
}

impl Vendor {
    pub fn default_line_settings(&self) -> LineSettings {
        match self {
            Vendor::Generic => LineSettings::new(9600),
            Vendor::AiThinkerA7 => LineSettings::new(115200),
        }
    }
}

fn default_reply_capacity() -> usize {
    DEFAULT_REPLY_CAPACITY
}

fn default_buffer_capacity() -> usize {
    DEFAULT_LINE_BUFFER_CAPACITY
}

/// Everything needed to open one modem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub port: String,
    #[serde(default)]
    pub vendor: Vendor,
    /// Overrides the vendor's line settings.
    #[serde(default)]
    pub line: Option<LineSettings>,
    #[serde(default = "default_reply_capacity")]
    pub reply_capacity: usize,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl DeviceConfig {
    pub fn new(port: impl Into<String>, vendor: Vendor) -> Self {
        Self {
            port: port.into(),
            vendor,
            line: None,
            reply_capacity: DEFAULT_REPLY_CAPACITY,
            buffer_capacity: DEFAULT_LINE_BUFFER_CAPACITY,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DeviceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn line_settings(&self) -> LineSettings {
        self.line.unwrap_or_else(|| self.vendor.default_line_settings())
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(DeviceError::InvalidConfiguration("port must not be empty".to_string()));
        }
        if self.reply_capacity == 0 || self.buffer_capacity == 0 {
            return Err(DeviceError::InvalidConfiguration("capacities must be non-zero".to_string()));
        }
        self.line_settings().validate()?;
        Ok(())
    }
}

/// Point-in-time description of an open device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub handle_id: HandleId,
    pub port_name: String,
    pub vendor: Vendor,
    pub reading: bool,
    pub pending_tasks: usize,
    pub buffered_bytes: usize,
    pub opened_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{BaudRate, Handshake};

    #[test]
    fn test_config_defaults_from_json() {
        let config = DeviceConfig::from_json_str(r#"{"port":"/dev/ttyUSB0","vendor":"ai-thinker-a7"}"#).unwrap();
        assert_eq!(config.vendor, Vendor::AiThinkerA7);
        assert_eq!(config.reply_capacity, 4096);
        assert_eq!(config.buffer_capacity, DEFAULT_LINE_BUFFER_CAPACITY);
        assert_eq!(config.line_settings().baud_rate, BaudRate(115200));
    }

    #[test]
    fn test_config_line_override() {
        let json = r#"{
            "port": "/dev/ttyS1",
            "line": {"baud_rate":19200,"parity":"none","data_bits":8,"stop_bits":1,"handshake":"hardware","access_mode":"read-write"}
        }"#;
        let config = DeviceConfig::from_json_str(json).unwrap();
        assert_eq!(config.vendor, Vendor::Generic);
        assert_eq!(config.line_settings().baud_rate, BaudRate(19200));
        assert_eq!(config.line_settings().handshake, Handshake::Hardware);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(matches!(
            DeviceConfig::from_json_str(r#"{"port":""}"#),
            Err(DeviceError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            DeviceConfig::from_json_str(r#"{"port":"/dev/ttyS0","reply_capacity":0}"#),
            Err(DeviceError::InvalidConfiguration(_))
        ));
        assert!(matches!(DeviceConfig::from_json_str("{"), Err(DeviceError::ConfigParse(_))));

        let mut config = DeviceConfig::new("/dev/ttyS0", Vendor::Generic);
        config.line = Some(LineSettings::new(31337));
        assert!(matches!(config.validate(), Err(DeviceError::SerialError(_))));
    }
}
