//! Device handle
//!
//! One [`AstroLink`] owns one connection and the reconciler behind it. The
//! external property layer constructs the handle, drives [`AstroLink::poll`]
//! from its timer, and funnels user requests through the typed methods here,
//! which keeps every transaction on a single execution context. There is no
//! process-wide instance; the owner decides lifetime and scheduling.
//!
//! Moves are asynchronous: the move methods return as soon as the command
//! transaction completes, report the subsystem busy, and let the periodic
//! poll observe completion. Pairing that with a move timeout is the caller's
//! policy.

use tracing::debug;

use crate::protocol::{
    Command, CommunicationChannel, Connection, ConnectionConfig, ConnectionState, ProtocolError,
};
use crate::reconciler::{DeviceState, PollResult, Reconciler, Subsystem};
use crate::settings::{self, Setting, SettingsGroup};

/// Handle to one AstroLink 4 mini unit
pub struct AstroLink {
    connection: Connection,
    reconciler: Reconciler,
}

impl AstroLink {
    /// Create a handle for the configured port (not yet connected)
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            connection: Connection::new(config),
            reconciler: Reconciler::new(),
        }
    }

    /// Create a handle driving an already-open channel (simulator, tests)
    ///
    /// The handshake still runs on [`AstroLink::connect`].
    pub fn over(channel: Box<dyn CommunicationChannel>, config: ConnectionConfig) -> Self {
        Self {
            connection: Connection::over(channel, config),
            reconciler: Reconciler::new(),
        }
    }

    /// Connect and handshake; observed state starts fresh on success
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.connection.state() == ConnectionState::Connecting {
            // pre-attached channel: only the handshake is outstanding
            self.connection.handshake()?;
        } else {
            self.connection.connect()?;
        }
        self.reconciler.reset();
        Ok(())
    }

    /// Disconnect and discard observed state
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
        self.reconciler.reset();
    }

    /// The connection, for state and transaction counters
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Read-only snapshot of the accumulated device state
    pub fn state(&self) -> &DeviceState {
        self.reconciler.state()
    }

    /// Run one poll cycle (called at a fixed cadence by the owner)
    pub fn poll(&mut self) -> PollResult {
        self.reconciler.poll(&mut self.connection)
    }

    /// Apply a user-initiated setting write
    ///
    /// Patches the single field behind `setting` and invalidates its group,
    /// so the next poll re-reads the record and publishes the confirmed
    /// value.
    pub fn apply(&mut self, setting: Setting, value: f64) -> Result<(), ProtocolError> {
        debug!(?setting, value, "applying setting");
        settings::apply(&mut self.connection, setting, value)?;
        self.reconciler.mark_stale(SettingsGroup::of(setting));
        Ok(())
    }

    /// Start an absolute stepper move; completion arrives via polling
    pub fn move_focuser(&mut self, position: u32) -> Result<(), ProtocolError> {
        self.connection
            .execute(&Command::move_absolute(0, position))?;
        self.reconciler.mark_busy(Subsystem::Focuser);
        Ok(())
    }

    /// Overwrite the current stepper position without moving
    pub fn sync_position(&mut self, position: u32) -> Result<(), ProtocolError> {
        self.connection.execute(&Command::sync_position(position))?;
        Ok(())
    }

    /// Abort stepper motion
    pub fn halt(&mut self) -> Result<(), ProtocolError> {
        self.connection.execute(&Command::halt())?;
        Ok(())
    }

    /// Switch a power relay
    pub fn set_relay(&mut self, line: u8, on: bool) -> Result<(), ProtocolError> {
        self.connection.execute(&Command::set_relay(line, on))?;
        Ok(())
    }

    /// Set a PWM channel duty cycle in percent
    pub fn set_pwm(&mut self, channel: u8, duty: u8) -> Result<(), ProtocolError> {
        self.connection.execute(&Command::set_pwm(channel, duty))?;
        Ok(())
    }

    /// Apply the pending temperature compensation now
    pub fn apply_compensation(&mut self, steps: i32) -> Result<(), ProtocolError> {
        self.connection
            .execute(&Command::apply_compensation(steps))?;
        Ok(())
    }

    /// Pulse the DC focuser output; completion arrives via polling
    pub fn dc_pulse(&mut self, pwm: u8, time_ms: u32, outward: bool) -> Result<(), ProtocolError> {
        self.connection
            .execute(&Command::dc_pulse(pwm, time_ms, outward))?;
        self.reconciler.mark_busy(Subsystem::DcFocuser);
        Ok(())
    }

    /// Abort a DC focuser pulse
    pub fn dc_halt(&mut self) -> Result<(), ProtocolError> {
        self.connection.execute(&Command::dc_halt())?;
        Ok(())
    }
}
