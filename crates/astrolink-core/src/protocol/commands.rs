//! Protocol commands
//!
//! Typed constructors for the controller's command set. Every command is a
//! short ASCII string whose first character is the tag; the response must
//! echo the same tag or the transaction is treated as desynchronized.

use serde::{Deserialize, Serialize};

use super::TERMINATOR;

/// A framed protocol command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    text: String,
    expects_response: bool,
}

impl Command {
    /// Handshake / device identification (`#`)
    pub fn handshake() -> Self {
        Self::query("#")
    }

    /// Telemetry poll (`q`)
    pub fn telemetry() -> Self {
        Self::query("q")
    }

    /// Read the shared settings record (`u`)
    pub fn get_settings() -> Self {
        Self::query("u")
    }

    /// Read the auxiliary settings record (`n`)
    pub fn get_other_settings() -> Self {
        Self::query("n")
    }

    /// Move stepper `axis` to an absolute position (`R:<axis>:<pos>`)
    pub fn move_absolute(axis: u8, position: u32) -> Self {
        Self::query(format!("R:{}:{}", axis, position))
    }

    /// Overwrite the current stepper position without moving (`P:<pos>`)
    pub fn sync_position(position: u32) -> Self {
        Self::query(format!("P:{}", position))
    }

    /// Abort stepper motion (`H`)
    pub fn halt() -> Self {
        Self::query("H")
    }

    /// Switch power relay `line` on or off (`C:<line>:<0|1>`)
    pub fn set_relay(line: u8, on: bool) -> Self {
        Self::query(format!("C:{}:{}", line, u8::from(on)))
    }

    /// Set PWM channel duty cycle in percent (`B:<ch>:<duty>`)
    pub fn set_pwm(channel: u8, duty: u8) -> Self {
        Self::query(format!("B:{}:{}", channel, duty))
    }

    /// Apply the pending temperature compensation now (`S:<steps>`)
    pub fn apply_compensation(steps: i32) -> Self {
        Self::query(format!("S:{}", steps))
    }

    /// Pulse the DC focuser output (`G:<pwm>:<time>:<dir>`)
    pub fn dc_pulse(pwm: u8, time_ms: u32, outward: bool) -> Self {
        Self::query(format!("G:{}:{}:{}", pwm, time_ms, u8::from(outward)))
    }

    /// Abort a DC focuser pulse (`K`)
    pub fn dc_halt() -> Self {
        Self::query("K")
    }

    /// A preassembled command line (settings-record writes built by the
    /// patcher)
    pub fn raw(text: impl Into<String>) -> Self {
        Self::query(text)
    }

    fn query(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expects_response: true,
        }
    }

    /// Mark the command fire-and-forget: transmit without reading a response
    pub fn fire_and_forget(mut self) -> Self {
        self.expects_response = false;
        self
    }

    /// Command text without the frame terminator
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tag character validated against the response
    pub fn tag(&self) -> char {
        self.text.chars().next().unwrap_or('\0')
    }

    /// Whether a response frame should be read back
    pub fn expects_response(&self) -> bool {
        self.expects_response
    }

    /// Frame the command for transmission, terminator appended
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.text.as_bytes().to_vec();
        bytes.push(TERMINATOR);
        bytes
    }
}
