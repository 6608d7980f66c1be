//! Telemetry record layout and typed frame parsing
//!
//! The `q` record carries the full device status snapshot. Post-tag field
//! layout (authoritative, firmware-defined; older shorter layouts are
//! obsolete and not supported):
//!
//! | Index | Field                  | Index | Field                 |
//! |-------|------------------------|-------|-----------------------|
//! | 0     | stepper position       | 11    | relay output 1        |
//! | 1     | steps to go            | 12    | relay output 2        |
//! | 2     | total current [A]      | 13    | relay output 3        |
//! | 3     | sensor 1 present       | 14    | Vin [V]               |
//! | 4     | sensor 1 temp [C]      | 15    | Vreg [V]              |
//! | 5     | sensor 1 humidity [%]  | 16    | Ah consumed           |
//! | 6     | sensor 1 dew point [C] | 17    | Wh consumed           |
//! | 7     | sensor 2 present       | 18    | DC motor moving       |
//! | 8     | sensor 2 temp [C]      | 19    | compensation delta    |
//! | 9     | PWM A duty [%]         | 20    | protection trip flag  |
//! | 10    | PWM B duty [%]         | 21    | protection trip value |
//!
//! While a stepper move is in progress the firmware answers with a short
//! record carrying only the leading fields (position, steps to go, current).
//! That is a normal "busy" response, not an error.

use serde::{Deserialize, Serialize};

use crate::protocol::{ProtocolError, Record};

/// Number of post-tag fields in the full telemetry record
pub const FIELD_COUNT: usize = 22;

/// Symbolic names for the telemetry record's positional fields
///
/// The positional contract lives here and nowhere else; callers never spell
/// raw indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryField {
    /// Stepper position in steps
    StepperPosition,
    /// Steps remaining in the current move
    StepsToGo,
    /// Total current draw
    Current,
    /// Environment sensor 1 detected
    Sensor1Present,
    /// Sensor 1 temperature
    Sensor1Temp,
    /// Sensor 1 relative humidity
    Sensor1Humidity,
    /// Sensor 1 dew point
    Sensor1Dewpoint,
    /// Environment sensor 2 detected
    Sensor2Present,
    /// Sensor 2 temperature
    Sensor2Temp,
    /// PWM channel A duty
    PwmA,
    /// PWM channel B duty
    PwmB,
    /// Relay output 1 state
    Out1,
    /// Relay output 2 state
    Out2,
    /// Relay output 3 state
    Out3,
    /// Input voltage
    Vin,
    /// Regulated voltage
    Vreg,
    /// Amp-hours consumed
    AmpHours,
    /// Watt-hours consumed
    WattHours,
    /// DC focuser output active
    DcMoving,
    /// Pending temperature compensation in steps
    CompensationDelta,
    /// Overcurrent protection tripped
    ProtectionTripped,
    /// Current value that tripped the protection
    ProtectionValue,
}

impl TelemetryField {
    /// Every field in positional order
    pub const ALL: [TelemetryField; FIELD_COUNT] = [
        TelemetryField::StepperPosition,
        TelemetryField::StepsToGo,
        TelemetryField::Current,
        TelemetryField::Sensor1Present,
        TelemetryField::Sensor1Temp,
        TelemetryField::Sensor1Humidity,
        TelemetryField::Sensor1Dewpoint,
        TelemetryField::Sensor2Present,
        TelemetryField::Sensor2Temp,
        TelemetryField::PwmA,
        TelemetryField::PwmB,
        TelemetryField::Out1,
        TelemetryField::Out2,
        TelemetryField::Out3,
        TelemetryField::Vin,
        TelemetryField::Vreg,
        TelemetryField::AmpHours,
        TelemetryField::WattHours,
        TelemetryField::DcMoving,
        TelemetryField::CompensationDelta,
        TelemetryField::ProtectionTripped,
        TelemetryField::ProtectionValue,
    ];

    /// Zero-based post-tag index of this field
    pub const fn index(self) -> usize {
        match self {
            TelemetryField::StepperPosition => 0,
            TelemetryField::StepsToGo => 1,
            TelemetryField::Current => 2,
            TelemetryField::Sensor1Present => 3,
            TelemetryField::Sensor1Temp => 4,
            TelemetryField::Sensor1Humidity => 5,
            TelemetryField::Sensor1Dewpoint => 6,
            TelemetryField::Sensor2Present => 7,
            TelemetryField::Sensor2Temp => 8,
            TelemetryField::PwmA => 9,
            TelemetryField::PwmB => 10,
            TelemetryField::Out1 => 11,
            TelemetryField::Out2 => 12,
            TelemetryField::Out3 => 13,
            TelemetryField::Vin => 14,
            TelemetryField::Vreg => 15,
            TelemetryField::AmpHours => 16,
            TelemetryField::WattHours => 17,
            TelemetryField::DcMoving => 18,
            TelemetryField::CompensationDelta => 19,
            TelemetryField::ProtectionTripped => 20,
            TelemetryField::ProtectionValue => 21,
        }
    }

    /// Whether the field is boolean-coded (`value > 0`)
    pub const fn is_boolean(self) -> bool {
        matches!(
            self,
            TelemetryField::Sensor1Present
                | TelemetryField::Sensor2Present
                | TelemetryField::Out1
                | TelemetryField::Out2
                | TelemetryField::Out3
                | TelemetryField::DcMoving
                | TelemetryField::ProtectionTripped
        )
    }

    /// Field name for events and logging
    pub const fn name(self) -> &'static str {
        match self {
            TelemetryField::StepperPosition => "stepper_position",
            TelemetryField::StepsToGo => "steps_to_go",
            TelemetryField::Current => "current",
            TelemetryField::Sensor1Present => "sensor1_present",
            TelemetryField::Sensor1Temp => "sensor1_temp",
            TelemetryField::Sensor1Humidity => "sensor1_humidity",
            TelemetryField::Sensor1Dewpoint => "sensor1_dewpoint",
            TelemetryField::Sensor2Present => "sensor2_present",
            TelemetryField::Sensor2Temp => "sensor2_temp",
            TelemetryField::PwmA => "pwm_a",
            TelemetryField::PwmB => "pwm_b",
            TelemetryField::Out1 => "out1",
            TelemetryField::Out2 => "out2",
            TelemetryField::Out3 => "out3",
            TelemetryField::Vin => "vin",
            TelemetryField::Vreg => "vreg",
            TelemetryField::AmpHours => "amp_hours",
            TelemetryField::WattHours => "watt_hours",
            TelemetryField::DcMoving => "dc_moving",
            TelemetryField::CompensationDelta => "compensation_delta",
            TelemetryField::ProtectionTripped => "protection_tripped",
            TelemetryField::ProtectionValue => "protection_value",
        }
    }
}

/// One environment sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvSensor {
    /// Temperature in degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
    /// Dew point in degrees Celsius
    pub dewpoint: f64,
}

/// Extended telemetry, absent while the device answers with the short
/// "busy moving" record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedTelemetry {
    /// Sensor 1 reading, `None` when the sensor is not detected
    pub sensor1: Option<EnvSensor>,
    /// Sensor 2 temperature, `None` when the sensor is not detected
    pub sensor2_temp: Option<f64>,
    /// PWM duty cycles for channels A and B
    pub pwm: [f64; 2],
    /// Relay output states 1 to 3
    pub outputs: [bool; 3],
    /// Input voltage
    pub vin: f64,
    /// Regulated voltage
    pub vreg: f64,
    /// Amp-hours consumed
    pub amp_hours: f64,
    /// Watt-hours consumed
    pub watt_hours: f64,
    /// DC focuser output active
    pub dc_moving: bool,
    /// Pending temperature compensation in steps
    pub compensation_delta: f64,
    /// Overcurrent protection tripped
    pub protection_tripped: bool,
    /// Current value that tripped the protection
    pub protection_value: f64,
}

/// One parsed telemetry snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Stepper position in steps
    pub stepper_position: f64,
    /// Steps remaining in the current move
    pub steps_to_go: f64,
    /// Total current draw
    pub current: f64,
    /// Extended fields; `None` for the short busy record
    pub extended: Option<ExtendedTelemetry>,
}

impl TelemetryFrame {
    /// Decode a `q` record
    ///
    /// Position, steps to go and current are guaranteed by the firmware in
    /// every response; a missing or non-numeric value there is a contract
    /// violation and is propagated, never defaulted.
    pub fn from_record(record: &Record) -> Result<Self, ProtocolError> {
        let number =
            |field: TelemetryField| record.numeric_field(field.index(), 1.0);
        let flag = |field: TelemetryField| record.bool_field(field.index());

        let frame = Self {
            stepper_position: number(TelemetryField::StepperPosition)?,
            steps_to_go: number(TelemetryField::StepsToGo)?,
            current: number(TelemetryField::Current)?,
            extended: None,
        };

        if record.field_count() < FIELD_COUNT {
            return Ok(frame);
        }

        let sensor1 = if flag(TelemetryField::Sensor1Present)? {
            Some(EnvSensor {
                temperature: number(TelemetryField::Sensor1Temp)?,
                humidity: number(TelemetryField::Sensor1Humidity)?,
                dewpoint: number(TelemetryField::Sensor1Dewpoint)?,
            })
        } else {
            None
        };
        let sensor2_temp = if flag(TelemetryField::Sensor2Present)? {
            Some(number(TelemetryField::Sensor2Temp)?)
        } else {
            None
        };

        Ok(Self {
            extended: Some(ExtendedTelemetry {
                sensor1,
                sensor2_temp,
                pwm: [number(TelemetryField::PwmA)?, number(TelemetryField::PwmB)?],
                outputs: [
                    flag(TelemetryField::Out1)?,
                    flag(TelemetryField::Out2)?,
                    flag(TelemetryField::Out3)?,
                ],
                vin: number(TelemetryField::Vin)?,
                vreg: number(TelemetryField::Vreg)?,
                amp_hours: number(TelemetryField::AmpHours)?,
                watt_hours: number(TelemetryField::WattHours)?,
                dc_moving: flag(TelemetryField::DcMoving)?,
                compensation_delta: number(TelemetryField::CompensationDelta)?,
                protection_tripped: flag(TelemetryField::ProtectionTripped)?,
                protection_value: number(TelemetryField::ProtectionValue)?,
            }),
            ..frame
        })
    }

    /// True while the device reports a stepper move in progress
    pub fn is_moving(&self) -> bool {
        self.steps_to_go > 0.0
    }
}
