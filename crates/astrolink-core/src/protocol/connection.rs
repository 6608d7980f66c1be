//! Connection management
//!
//! Owns the byte channel and runs the command/response transaction cycle:
//! flush stale input, write the framed command, read up to the terminator
//! under a deadline, retry the full cycle once on a transient failure, and
//! validate the echoed tag.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::record::Record;
use super::serial::{clear_buffers, configure_port, open_port};
use super::stream::{CommunicationChannel, SerialChannel, TcpChannel};
use super::{
    Command, ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, DEVICE_SIGNATURE,
    MAX_RESPONSE_LEN, TERMINATOR,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connecting (handshake in progress)
    Connecting,
    /// Connected and ready
    Connected,
    /// Connection error
    Error,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port name, or `host:port` when `tcp` is set
    pub port_name: String,
    /// Baud rate (serial only)
    pub baud_rate: u32,
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
    /// Connect through a TCP serial bridge instead of a local port
    pub tcp: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tcp: false,
        }
    }
}

/// Controller connection
///
/// Exactly one transaction is in flight at a time: the protocol has no
/// request IDs and relies purely on read-after-write ordering, so the caller
/// serializes user requests and the periodic poll onto one execution context.
pub struct Connection {
    channel: Option<Box<dyn CommunicationChannel>>,
    state: ConnectionState,
    config: ConnectionConfig,
    signature: Option<String>,
    tx_bytes: u64,
    rx_bytes: u64,
    transactions: u64,
    retries: u64,
}

impl Connection {
    /// Create a new connection (not yet connected)
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            channel: None,
            state: ConnectionState::Disconnected,
            config,
            signature: None,
            tx_bytes: 0,
            rx_bytes: 0,
            transactions: 0,
            retries: 0,
        }
    }

    /// Create a connection driving an already-open channel
    ///
    /// Used by the simulator and by callers that configure the port
    /// themselves. The handshake still has to be run before the device is
    /// considered connected.
    pub fn over(channel: Box<dyn CommunicationChannel>, config: ConnectionConfig) -> Self {
        let mut conn = Self::new(config);
        conn.channel = Some(channel);
        conn.state = ConnectionState::Connecting;
        conn
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Device signature reported by the handshake (if connected)
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Cumulative tx/rx byte and transaction/retry counters
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (self.tx_bytes, self.rx_bytes, self.transactions, self.retries)
    }

    /// Open the configured port and perform the handshake
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.state == ConnectionState::Connected {
            return Err(ProtocolError::AlreadyConnected);
        }
        self.state = ConnectionState::Connecting;

        let channel: Box<dyn CommunicationChannel> = if self.config.tcp {
            let stream = TcpStream::connect(&self.config.port_name)
                .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
            let mut channel = TcpChannel::new(stream);
            channel.set_timeout(Duration::from_millis(100))?;
            Box::new(channel)
        } else {
            let mut port = open_port(&self.config.port_name, Some(self.config.baud_rate))?;
            configure_port(port.as_mut())?;
            clear_buffers(port.as_mut())?;
            Box::new(SerialChannel::new(port))
        };
        self.channel = Some(channel);

        match self.handshake() {
            Ok(_) => Ok(()),
            Err(e) => {
                self.state = ConnectionState::Error;
                self.channel = None;
                Err(e)
            }
        }
    }

    /// Drop the channel and reset the connection
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Connected {
            info!(port = %self.config.port_name, "disconnected");
        }
        self.channel = None;
        self.signature = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Exchange the identification command and validate the device signature
    pub fn handshake(&mut self) -> Result<String, ProtocolError> {
        let response = self.execute(&Command::handshake())?;
        let line = response.to_line();

        if !line.starts_with(DEVICE_SIGNATURE) {
            warn!(response = %line, "handshake rejected");
            self.state = ConnectionState::Error;
            return Err(ProtocolError::DeviceNotRecognized(line));
        }

        info!(signature = %line, "device connected");
        self.signature = Some(line.clone());
        self.state = ConnectionState::Connected;
        Ok(line)
    }

    /// Run one command/response transaction
    ///
    /// A timeout or a read that captured only the terminator is transient:
    /// the full write+read cycle is repeated exactly once more before the
    /// transaction fails with [`ProtocolError::NoResponse`]. A tag mismatch
    /// means the stream is desynchronized and is surfaced immediately,
    /// without a retry.
    pub fn execute(&mut self, command: &Command) -> Result<Record, ProtocolError> {
        if self.channel.is_none() {
            return Err(ProtocolError::NotConnected);
        }

        let framed = command.to_bytes();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        self.transactions += 1;

        for attempt in 0..2 {
            if attempt > 0 {
                self.retries += 1;
                warn!(command = command.text(), "no response, retrying transaction");
            }

            let channel = self
                .channel
                .as_mut()
                .ok_or(ProtocolError::NotConnected)?;

            // Discard stale bytes from a previous aborted transaction so the
            // next read cannot pick up a misaligned response.
            channel.clear_input_buffer()?;

            trace!(tx = command.text(), "write");
            channel.write_all(&framed)?;
            channel.flush()?;
            self.tx_bytes += framed.len() as u64;

            if !command.expects_response() {
                return Ok(Record::empty());
            }

            let line = match read_line(channel.as_mut(), timeout)? {
                Some(line) if !line.is_empty() => line,
                // Timeout, or a frame carrying nothing but the terminator
                _ => continue,
            };
            self.rx_bytes += line.len() as u64 + 1;
            channel.clear_input_buffer()?;

            trace!(rx = %line, "read");
            let received = line.chars().next().unwrap_or('\0');
            if received != command.tag() {
                debug!(sent = %command.tag(), received = %received, "tag mismatch");
                return Err(ProtocolError::TagMismatch {
                    sent: command.tag(),
                    received,
                });
            }
            return Ok(Record::parse(&line));
        }

        Err(ProtocolError::NoResponse)
    }
}

/// Read bytes until the frame terminator or the deadline
///
/// Returns `None` on timeout. The terminator is stripped, as is a carriage
/// return in front of it (some firmware revisions echo CRLF).
fn read_line(
    channel: &mut dyn CommunicationChannel,
    timeout: Duration,
) -> Result<Option<String>, ProtocolError> {
    let deadline = Instant::now() + timeout;
    let mut line: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 64];

    while Instant::now() < deadline {
        let available = channel.bytes_to_read()?;
        if available == 0 {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        }

        let to_read = (available as usize).min(buffer.len());
        let n = match channel.read(&mut buffer[..to_read]) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        for &byte in &buffer[..n] {
            if byte == TERMINATOR {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            line.push(byte);
            if line.len() > MAX_RESPONSE_LEN {
                return Err(ProtocolError::SerialError(
                    "response exceeds frame limit".to_string(),
                ));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(!config.tcp);
    }

    #[test]
    fn test_execute_requires_channel() {
        let mut conn = Connection::new(ConnectionConfig::default());
        let err = conn.execute(&Command::telemetry()).unwrap_err();
        assert!(matches!(err, ProtocolError::NotConnected));
    }

    #[test]
    fn test_state_transitions() {
        let mut conn = Connection::new(ConnectionConfig::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.signature().is_none());
    }
}
