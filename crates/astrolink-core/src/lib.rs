//! # AstroLink Core Library
//!
//! Communication and state-synchronization core for the AstroLink 4 mini
//! astronomy power/focuser/environment unit.
//!
//! This library provides:
//! - Serial protocol communication with the controller (framed ASCII
//!   transactions with retry and tag validation)
//! - Colon-delimited record parsing and reassembly
//! - Settings-group synchronization via read-modify-write patching
//! - Polling-driven telemetry reconciliation with change events
//! - A simulated controller for tests and demo mode
//!
//! The device-framework property layer, connection UI and client
//! presentation are external collaborators. This crate exposes a typed
//! [`device::AstroLink`] handle, change-event notifications and an
//! `apply(setting, value)` entry point, and consumes an opened serial port
//! plus a scheduler that drives [`device::AstroLink::poll`] at a fixed
//! period (2-3 s works well for the sensor readout).
//!
//! ## Example
//!
//! ```rust,no_run
//! use astrolink_core::prelude::*;
//!
//! # fn main() -> Result<(), ProtocolError> {
//! let mut device = AstroLink::new(ConnectionConfig {
//!     port_name: "/dev/ttyACM0".to_string(),
//!     ..Default::default()
//! });
//! device.connect()?;
//!
//! // issue a move; completion is observed by the periodic poll
//! device.move_focuser(1500)?;
//! if let PollResult::Updated(events) = device.poll() {
//!     for event in events {
//!         println!("{:?}", event);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod device;
pub mod protocol;
pub mod reconciler;
pub mod settings;
pub mod sim;
pub mod telemetry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::device::AstroLink;
    pub use crate::protocol::{
        Command, Connection, ConnectionConfig, ConnectionState, ProtocolError, Record,
    };
    pub use crate::reconciler::{
        ChangeEvent, DeviceState, PollResult, Reconciler, Subsystem, SubsystemStatus,
    };
    pub use crate::settings::{Setting, SettingsGroup, SettingsRecord};
    pub use crate::sim::{SharedSimulator, SimulatedAstroLink};
    pub use crate::telemetry::{TelemetryField, TelemetryFrame};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
