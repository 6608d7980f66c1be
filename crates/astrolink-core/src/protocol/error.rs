//! Protocol errors

use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("No response from device after retry")]
    NoResponse,

    #[error("Response tag mismatch: sent '{sent}', received '{received}'")]
    TagMismatch { sent: char, received: char },

    #[error("Record too short: {fields} fields, index {index} requested")]
    RecordTooShort { fields: usize, index: usize },

    #[error("Field {index} is not numeric: '{value}'")]
    FieldParse { index: usize, value: String },

    #[error("Not connected to device")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Device not recognized: '{0}'")]
    DeviceNotRecognized(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
