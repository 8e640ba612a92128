use serde::{Deserialize, Serialize};

use super::{Result, SerialError};

/// Baud rates the line discipline accepts.
pub const SUPPORTED_BAUD_RATES: [u32; 29] = [
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
    230400, 460800, 500000, 576000, 921600, 1000000, 1152000, 1500000, 2000000, 2500000, 3000000,
    3500000, 4000000,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaudRate(pub u32);

impl BaudRate {
    pub fn is_supported(&self) -> bool {
        SUPPORTED_BAUD_RATES.contains(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("unsupported data bits: {}", other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> u8 {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("unsupported stop bits: {}", other)),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(bits: StopBits) -> u8 {
        match bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handshake {
    None,
    Software,
    Hardware,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(&self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// Line parameters applied to a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    pub baud_rate: BaudRate,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub handshake: Handshake,
    pub access_mode: AccessMode,
}

impl LineSettings {
    /// 8N1, no handshake, read-write.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate: BaudRate(baud_rate),
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            handshake: Handshake::None,
            access_mode: AccessMode::ReadWrite,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.baud_rate.is_supported() {
            return Err(SerialError::ConfigurationRejected(format!(
                "unsupported baud rate {}",
                self.baud_rate.0
            )));
        }
        Ok(())
    }

    pub(crate) fn serial_parity(&self) -> serialport::Parity {
        match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }

    pub(crate) fn serial_data_bits(&self) -> serialport::DataBits {
        match self.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }

    pub(crate) fn serial_stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }

    pub(crate) fn serial_flow_control(&self) -> serialport::FlowControl {
        match self.handshake {
            Handshake::None => serialport::FlowControl::None,
            Handshake::Software => serialport::FlowControl::Software,
            Handshake::Hardware => serialport::FlowControl::Hardware,
            Handshake::Both => {
                log::warn!("Combined software+hardware handshake unavailable, using hardware flow control");
                serialport::FlowControl::Hardware
            }
        }
    }
}

impl Default for LineSettings {
    fn default() -> Self {
        Self::new(115200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_baud_rates() {
        assert!(BaudRate(50).is_supported());
        assert!(BaudRate(115200).is_supported());
        assert!(BaudRate(4000000).is_supported());
        assert!(!BaudRate(12345).is_supported());
        assert!(!BaudRate(0).is_supported());
    }

    #[test]
    fn test_validate_rejects_unknown_baud() {
        let settings = LineSettings::new(14400);
        assert!(matches!(settings.validate(), Err(SerialError::ConfigurationRejected(_))));
        assert!(LineSettings::new(9600).validate().is_ok());
    }

    #[test]
    fn test_access_mode_permissions() {
        assert!(AccessMode::ReadWrite.can_read() && AccessMode::ReadWrite.can_write());
        assert!(!AccessMode::ReadOnly.can_write());
        assert!(!AccessMode::WriteOnly.can_read());
    }

    #[test]
    fn test_settings_json_shape() {
        let json = r#"{"baud_rate":57600,"parity":"even","data_bits":7,"stop_bits":2,"handshake":"software","access_mode":"read-write"}"#;
        let settings: LineSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.baud_rate, BaudRate(57600));
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.data_bits, DataBits::Seven);
        assert_eq!(settings.stop_bits, StopBits::Two);
        assert_eq!(settings.handshake, Handshake::Software);

        let bad = r#"{"baud_rate":57600,"parity":"none","data_bits":9,"stop_bits":1,"handshake":"none","access_mode":"read-write"}"#;
        assert!(serde_json::from_str::<LineSettings>(bad).is_err());
    }
}
