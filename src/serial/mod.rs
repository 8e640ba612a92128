pub mod settings;
pub mod interface;
pub mod line_buffer;
pub mod transport;

pub use interface::SerialInterface;
pub use line_buffer::LineBuffer;
pub use settings::{AccessMode, BaudRate, DataBits, Handshake, LineSettings, Parity, StopBits};
pub use transport::{HandleId, ReadCallback, Transport};

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    #[error("Configuration rejected: {0}")]
    ConfigurationRejected(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Port not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
