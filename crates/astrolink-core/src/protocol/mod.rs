//! Serial Protocol Communication
//!
//! Implements the AstroLink 4 mini line-oriented serial protocol: short
//! ASCII commands answered by colon-delimited ASCII records, one transaction
//! in flight at a time.

pub mod commands;
mod connection;
mod error;
pub mod record;
pub mod serial;
mod stream;

pub use commands::Command;
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use error::ProtocolError;
pub use record::Record;
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use stream::{CommunicationChannel, SerialChannel, TcpChannel};

/// Default baud rate for controller communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Frame terminator byte (line feed)
pub const TERMINATOR: u8 = b'\n';

/// Maximum accepted response length in bytes
pub const MAX_RESPONSE_LEN: usize = 256;

/// Handshake response prefix identifying the device
pub const DEVICE_SIGNATURE: &str = "#:AstroLink4mini";
