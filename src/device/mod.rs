pub mod manager;
pub mod models;
pub mod registry;

pub use manager::{Device, ModemManager};
pub use models::*;
pub use registry::{DeviceRegistry, RegisteredDevice};

use crate::serial::HandleId;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Handle {0} is already registered")]
    AlreadyRegistered(HandleId),

    #[error("Device closed")]
    Closed,

    #[error("Invalid device configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
