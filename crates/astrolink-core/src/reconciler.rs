//! Telemetry reconciliation
//!
//! Diffs each telemetry poll against the previously observed device state
//! and emits change events only on real transitions, so downstream
//! consumers are never notified for a value that merely got re-read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::protocol::{Command, Connection, Record};
use crate::settings::{
    FocuserMode, FocuserSettings, OtherSettings, PowerDefaultOn, SettingsGroup,
};
use crate::telemetry::{TelemetryField, TelemetryFrame, FIELD_COUNT};

/// Per-subsystem synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubsystemStatus {
    /// No value observed yet
    Unknown,
    /// In sync with the device
    Ok,
    /// An operation is in progress
    Busy,
    /// Degraded: the last cycle could not read or parse this sub-state
    Alert,
}

/// Logical sub-states tracked by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subsystem {
    /// Stepper focuser position and motion
    Focuser,
    /// DC focuser output
    DcFocuser,
    /// Environment sensors
    Sensors,
    /// PWM outputs
    Pwm,
    /// Relay outputs
    Outputs,
    /// Supply voltages, current draw and energy counters
    Power,
    /// Temperature compensation
    Compensation,
    /// Overcurrent protection
    Protection,
    /// Focuser settings group
    FocuserSettings,
    /// Stepper drive mode setting
    FocuserMode,
    /// Relay power-up defaults
    PowerDefaults,
    /// Auxiliary settings record
    OtherSettings,
}

/// Sub-state a telemetry field belongs to, for degradation marking
const fn subsystem_of(field: TelemetryField) -> Subsystem {
    match field {
        TelemetryField::StepperPosition | TelemetryField::StepsToGo => Subsystem::Focuser,
        TelemetryField::Current
        | TelemetryField::Vin
        | TelemetryField::Vreg
        | TelemetryField::AmpHours
        | TelemetryField::WattHours => Subsystem::Power,
        TelemetryField::Sensor1Present
        | TelemetryField::Sensor1Temp
        | TelemetryField::Sensor1Humidity
        | TelemetryField::Sensor1Dewpoint
        | TelemetryField::Sensor2Present
        | TelemetryField::Sensor2Temp => Subsystem::Sensors,
        TelemetryField::PwmA | TelemetryField::PwmB => Subsystem::Pwm,
        TelemetryField::Out1 | TelemetryField::Out2 | TelemetryField::Out3 => Subsystem::Outputs,
        TelemetryField::DcMoving => Subsystem::DcFocuser,
        TelemetryField::CompensationDelta => Subsystem::Compensation,
        TelemetryField::ProtectionTripped | TelemetryField::ProtectionValue => {
            Subsystem::Protection
        }
    }
}

/// Subsystem tracking a settings group's synchronization
const fn subsystem_of_group(group: SettingsGroup) -> Subsystem {
    match group {
        SettingsGroup::Focuser => Subsystem::FocuserSettings,
        SettingsGroup::FocuserMode => Subsystem::FocuserMode,
        SettingsGroup::PowerDefaultOn => Subsystem::PowerDefaults,
        SettingsGroup::Other => Subsystem::OtherSettings,
    }
}

/// Status of every tracked subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSet {
    /// Stepper focuser
    pub focuser: SubsystemStatus,
    /// DC focuser
    pub dc_focuser: SubsystemStatus,
    /// Environment sensors
    pub sensors: SubsystemStatus,
    /// PWM outputs
    pub pwm: SubsystemStatus,
    /// Relay outputs
    pub outputs: SubsystemStatus,
    /// Power rails and energy counters
    pub power: SubsystemStatus,
    /// Temperature compensation
    pub compensation: SubsystemStatus,
    /// Overcurrent protection
    pub protection: SubsystemStatus,
    /// Focuser settings group
    pub focuser_settings: SubsystemStatus,
    /// Stepper drive mode setting
    pub focuser_mode: SubsystemStatus,
    /// Relay power-up defaults
    pub power_defaults: SubsystemStatus,
    /// Auxiliary settings record
    pub other_settings: SubsystemStatus,
}

impl Default for StatusSet {
    fn default() -> Self {
        Self {
            focuser: SubsystemStatus::Unknown,
            dc_focuser: SubsystemStatus::Unknown,
            sensors: SubsystemStatus::Unknown,
            pwm: SubsystemStatus::Unknown,
            outputs: SubsystemStatus::Unknown,
            power: SubsystemStatus::Unknown,
            compensation: SubsystemStatus::Unknown,
            protection: SubsystemStatus::Unknown,
            focuser_settings: SubsystemStatus::Unknown,
            focuser_mode: SubsystemStatus::Unknown,
            power_defaults: SubsystemStatus::Unknown,
            other_settings: SubsystemStatus::Unknown,
        }
    }
}

impl StatusSet {
    fn get(&self, subsystem: Subsystem) -> SubsystemStatus {
        match subsystem {
            Subsystem::Focuser => self.focuser,
            Subsystem::DcFocuser => self.dc_focuser,
            Subsystem::Sensors => self.sensors,
            Subsystem::Pwm => self.pwm,
            Subsystem::Outputs => self.outputs,
            Subsystem::Power => self.power,
            Subsystem::Compensation => self.compensation,
            Subsystem::Protection => self.protection,
            Subsystem::FocuserSettings => self.focuser_settings,
            Subsystem::FocuserMode => self.focuser_mode,
            Subsystem::PowerDefaults => self.power_defaults,
            Subsystem::OtherSettings => self.other_settings,
        }
    }

    fn set(&mut self, subsystem: Subsystem, status: SubsystemStatus) {
        let slot = match subsystem {
            Subsystem::Focuser => &mut self.focuser,
            Subsystem::DcFocuser => &mut self.dc_focuser,
            Subsystem::Sensors => &mut self.sensors,
            Subsystem::Pwm => &mut self.pwm,
            Subsystem::Outputs => &mut self.outputs,
            Subsystem::Power => &mut self.power,
            Subsystem::Compensation => &mut self.compensation,
            Subsystem::Protection => &mut self.protection,
            Subsystem::FocuserSettings => &mut self.focuser_settings,
            Subsystem::FocuserMode => &mut self.focuser_mode,
            Subsystem::PowerDefaults => &mut self.power_defaults,
            Subsystem::OtherSettings => &mut self.other_settings,
        };
        *slot = status;
    }
}

/// A change detected by the reconciler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// A telemetry field changed value
    Value {
        /// Field that changed
        field: TelemetryField,
        /// Previous value, `None` on first observation
        old: Option<f64>,
        /// Newly observed value
        new: f64,
    },
    /// A subsystem changed status
    Status {
        /// Subsystem whose status changed
        subsystem: Subsystem,
        /// Previous status
        old: SubsystemStatus,
        /// New status
        new: SubsystemStatus,
    },
    /// A motion finished (busy to idle transition)
    MoveComplete {
        /// Subsystem that finished moving
        subsystem: Subsystem,
        /// Final position, where the subsystem has one
        position: Option<f64>,
    },
    /// A settings group was synchronized from the device
    SettingsSynced {
        /// Group that is now in sync
        group: SettingsGroup,
    },
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PollResult {
    /// The telemetry transaction failed; device state is untouched
    Unavailable,
    /// The cycle completed with zero or more change events
    Updated(Vec<ChangeEvent>),
}

/// Most recently observed device state, accumulated across polls
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceState {
    values: [Option<f64>; FIELD_COUNT],
    status: StatusSet,
    telemetry: Option<TelemetryFrame>,
    focuser_settings: Option<FocuserSettings>,
    focuser_mode: Option<FocuserMode>,
    power_defaults: Option<PowerDefaultOn>,
    other_settings: Option<OtherSettings>,
    last_poll: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// Last observed value of a telemetry field (booleans as 0/1)
    pub fn value(&self, field: TelemetryField) -> Option<f64> {
        self.values[field.index()]
    }

    /// Current status of a subsystem
    pub fn status(&self, subsystem: Subsystem) -> SubsystemStatus {
        self.status.get(subsystem)
    }

    /// Last fully parsed telemetry snapshot
    pub fn telemetry(&self) -> Option<&TelemetryFrame> {
        self.telemetry.as_ref()
    }

    /// Synchronized focuser settings
    pub fn focuser_settings(&self) -> Option<FocuserSettings> {
        self.focuser_settings
    }

    /// Synchronized stepper drive mode
    pub fn focuser_mode(&self) -> Option<FocuserMode> {
        self.focuser_mode
    }

    /// Synchronized relay power-up defaults
    pub fn power_defaults(&self) -> Option<PowerDefaultOn> {
        self.power_defaults
    }

    /// Synchronized auxiliary settings
    pub fn other_settings(&self) -> Option<OtherSettings> {
        self.other_settings
    }

    /// Completion time of the last successful poll
    pub fn last_poll(&self) -> Option<DateTime<Utc>> {
        self.last_poll
    }
}

/// Polling-driven state reconciler
///
/// Owned per connection; created at handshake and discarded at disconnect.
/// All mutation happens inside [`Reconciler::poll`], which the caller drives
/// at a fixed cadence from the same execution context as user requests.
#[derive(Debug, Default)]
pub struct Reconciler {
    state: DeviceState,
}

impl Reconciler {
    /// A reconciler with no observed state
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only snapshot of the accumulated device state
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Forget all observed state (fresh connection)
    pub fn reset(&mut self) {
        self.state = DeviceState::default();
    }

    /// Force a settings group to be re-pulled on the next poll
    pub fn mark_stale(&mut self, group: SettingsGroup) {
        self.state
            .status
            .set(subsystem_of_group(group), SubsystemStatus::Unknown);
    }

    /// Report a subsystem busy immediately (a move was just issued)
    pub fn mark_busy(&mut self, subsystem: Subsystem) {
        self.state.status.set(subsystem, SubsystemStatus::Busy);
    }

    /// Run one poll cycle against the connection
    ///
    /// Issues the telemetry transaction, diffs the result into change
    /// events, and pulls the settings records for any group that is not yet
    /// synchronized. A failed telemetry transaction skips the cycle without
    /// touching the accumulated state.
    pub fn poll(&mut self, conn: &mut Connection) -> PollResult {
        let record = match conn.execute(&Command::telemetry()) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "telemetry poll failed, skipping cycle");
                return PollResult::Unavailable;
            }
        };

        let mut events = Vec::new();
        self.reconcile_values(&record, &mut events);
        self.derive_motion(&record, &mut events);
        self.refresh_frame(&record);
        self.sync_settings(conn, &mut events);
        self.state.last_poll = Some(Utc::now());

        PollResult::Updated(events)
    }

    /// Diff every field present in the record against the last observation.
    ///
    /// Values are compared exactly: the firmware quantizes before
    /// transmission, so inequality means a real change and an epsilon would
    /// only mask updates.
    fn reconcile_values(&mut self, record: &Record, events: &mut Vec<ChangeEvent>) {
        let available = record.field_count().min(FIELD_COUNT);
        let mut alerted = Vec::new();

        for field in TelemetryField::ALL {
            if field.index() >= available {
                // short busy record: the remaining fields were not sent
                break;
            }
            match record.numeric_field(field.index(), 1.0) {
                Ok(raw) => {
                    let new = if field.is_boolean() {
                        if raw > 0.0 {
                            1.0
                        } else {
                            0.0
                        }
                    } else {
                        raw
                    };
                    let old = self.state.values[field.index()];
                    if old != Some(new) {
                        trace!(field = field.name(), ?old, new, "field changed");
                        self.state.values[field.index()] = Some(new);
                        events.push(ChangeEvent::Value { field, old, new });
                    }
                }
                Err(e) => {
                    warn!(field = field.name(), error = %e, "telemetry field unreadable");
                    let subsystem = subsystem_of(field);
                    self.set_status(subsystem, SubsystemStatus::Alert, events);
                    alerted.push(subsystem);
                }
            }
        }

        // Passive subsystems with all fields readable in a long-form record
        // are in sync by definition.
        if available == FIELD_COUNT {
            for subsystem in [
                Subsystem::Sensors,
                Subsystem::Pwm,
                Subsystem::Outputs,
                Subsystem::Power,
                Subsystem::Compensation,
            ] {
                if !alerted.contains(&subsystem) {
                    self.set_status(subsystem, SubsystemStatus::Ok, events);
                }
            }
        }
    }

    /// Busy/idle derivation for the stepper and DC focuser, and the
    /// protection trip ladder
    fn derive_motion(&mut self, record: &Record, events: &mut Vec<ChangeEvent>) {
        let position = record.numeric_field(TelemetryField::StepperPosition.index(), 1.0);
        let steps_to_go = record.numeric_field(TelemetryField::StepsToGo.index(), 1.0);
        if let (Ok(position), Ok(steps_to_go)) = (position, steps_to_go) {
            let was = self.state.status.get(Subsystem::Focuser);
            if steps_to_go > 0.0 {
                self.set_status(Subsystem::Focuser, SubsystemStatus::Busy, events);
            } else {
                if was == SubsystemStatus::Busy {
                    info!(position, "focuser move complete");
                    events.push(ChangeEvent::MoveComplete {
                        subsystem: Subsystem::Focuser,
                        position: Some(position),
                    });
                }
                self.set_status(Subsystem::Focuser, SubsystemStatus::Ok, events);
            }
        }

        if record.field_count() >= FIELD_COUNT {
            if let Ok(dc_moving) = record.bool_field(TelemetryField::DcMoving.index()) {
                let was = self.state.status.get(Subsystem::DcFocuser);
                if dc_moving {
                    self.set_status(Subsystem::DcFocuser, SubsystemStatus::Busy, events);
                } else {
                    if was == SubsystemStatus::Busy {
                        info!("DC focuser move complete");
                        events.push(ChangeEvent::MoveComplete {
                            subsystem: Subsystem::DcFocuser,
                            position: None,
                        });
                    }
                    self.set_status(Subsystem::DcFocuser, SubsystemStatus::Ok, events);
                }
            }

            if let Ok(tripped) = record.bool_field(TelemetryField::ProtectionTripped.index()) {
                let status = if tripped {
                    SubsystemStatus::Alert
                } else {
                    SubsystemStatus::Ok
                };
                self.set_status(Subsystem::Protection, status, events);
            }
        }
    }

    /// Keep the typed snapshot current when the record parses cleanly
    fn refresh_frame(&mut self, record: &Record) {
        if let Ok(frame) = TelemetryFrame::from_record(record) {
            self.state.telemetry = Some(frame);
        }
    }

    /// Pull the settings records for any group not yet in sync.
    ///
    /// Once every dependent group is Ok the settings records are not polled
    /// again, which keeps steady-state transaction volume at one `q` per
    /// cycle.
    fn sync_settings(&mut self, conn: &mut Connection, events: &mut Vec<ChangeEvent>) {
        let main_groups = [
            SettingsGroup::Focuser,
            SettingsGroup::FocuserMode,
            SettingsGroup::PowerDefaultOn,
        ];
        if main_groups
            .iter()
            .any(|&g| self.group_status(g) != SubsystemStatus::Ok)
        {
            match conn.execute(&Command::get_settings()) {
                Ok(record) => self.populate_main(&record, events),
                Err(e) => {
                    warn!(error = %e, "settings record fetch failed");
                    for group in main_groups {
                        if self.group_status(group) != SubsystemStatus::Ok {
                            self.set_status(
                                subsystem_of_group(group),
                                SubsystemStatus::Alert,
                                events,
                            );
                        }
                    }
                }
            }
        }

        if self.group_status(SettingsGroup::Other) != SubsystemStatus::Ok {
            match conn.execute(&Command::get_other_settings()) {
                Ok(record) => match OtherSettings::from_record(&record) {
                    Ok(parsed) => {
                        self.state.other_settings = Some(parsed);
                        self.mark_synced(SettingsGroup::Other, events);
                    }
                    Err(e) => {
                        warn!(error = %e, "auxiliary settings record unreadable");
                        self.set_status(
                            Subsystem::OtherSettings,
                            SubsystemStatus::Alert,
                            events,
                        );
                    }
                },
                Err(e) => {
                    warn!(error = %e, "auxiliary settings fetch failed");
                    self.set_status(Subsystem::OtherSettings, SubsystemStatus::Alert, events);
                }
            }
        }
    }

    /// Populate the three main-record groups from one fetched record
    fn populate_main(&mut self, record: &Record, events: &mut Vec<ChangeEvent>) {
        match FocuserSettings::from_record(record) {
            Ok(parsed) => {
                self.state.focuser_settings = Some(parsed);
                self.mark_synced(SettingsGroup::Focuser, events);
            }
            Err(e) => {
                warn!(error = %e, "focuser settings unreadable");
                self.set_status(Subsystem::FocuserSettings, SubsystemStatus::Alert, events);
            }
        }
        match FocuserMode::from_record(record) {
            Ok(parsed) => {
                self.state.focuser_mode = Some(parsed);
                self.mark_synced(SettingsGroup::FocuserMode, events);
            }
            Err(e) => {
                warn!(error = %e, "focuser mode unreadable");
                self.set_status(Subsystem::FocuserMode, SubsystemStatus::Alert, events);
            }
        }
        match PowerDefaultOn::from_record(record) {
            Ok(parsed) => {
                self.state.power_defaults = Some(parsed);
                self.mark_synced(SettingsGroup::PowerDefaultOn, events);
            }
            Err(e) => {
                warn!(error = %e, "power defaults unreadable");
                self.set_status(Subsystem::PowerDefaults, SubsystemStatus::Alert, events);
            }
        }
    }

    fn group_status(&self, group: SettingsGroup) -> SubsystemStatus {
        self.state.status.get(subsystem_of_group(group))
    }

    fn mark_synced(&mut self, group: SettingsGroup, events: &mut Vec<ChangeEvent>) {
        let subsystem = subsystem_of_group(group);
        if self.state.status.get(subsystem) != SubsystemStatus::Ok {
            self.set_status(subsystem, SubsystemStatus::Ok, events);
            events.push(ChangeEvent::SettingsSynced { group });
        }
    }

    fn set_status(
        &mut self,
        subsystem: Subsystem,
        new: SubsystemStatus,
        events: &mut Vec<ChangeEvent>,
    ) {
        let old = self.state.status.get(subsystem);
        if old != new {
            self.state.status.set(subsystem, new);
            events.push(ChangeEvent::Status {
                subsystem,
                old,
                new,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_unknown() {
        let reconciler = Reconciler::new();
        let state = reconciler.state();
        assert_eq!(state.status(Subsystem::Focuser), SubsystemStatus::Unknown);
        assert_eq!(state.value(TelemetryField::StepperPosition), None);
        assert!(state.telemetry().is_none());
        assert!(state.last_poll().is_none());
    }

    #[test]
    fn test_mark_stale_resets_group_status() {
        let mut reconciler = Reconciler::new();
        reconciler
            .state
            .status
            .set(Subsystem::FocuserSettings, SubsystemStatus::Ok);
        reconciler.mark_stale(SettingsGroup::Focuser);
        assert_eq!(
            reconciler.state().status(Subsystem::FocuserSettings),
            SubsystemStatus::Unknown
        );
    }

    #[test]
    fn test_mark_busy() {
        let mut reconciler = Reconciler::new();
        reconciler.mark_busy(Subsystem::Focuser);
        assert_eq!(
            reconciler.state().status(Subsystem::Focuser),
            SubsystemStatus::Busy
        );
    }

    #[test]
    fn test_subsystem_mapping_is_total() {
        for field in TelemetryField::ALL {
            // every field maps to some subsystem without panicking
            let _ = subsystem_of(field);
        }
    }
}
