//! Settings groups and the read-modify-write patcher
//!
//! Device settings live in two shared colon-delimited records: the main
//! frame (`u` get / `U` set) and the auxiliary frame (`n` get / `N` set).
//! Logical settings groups alias field index subsets within those records;
//! writes always go through fetch, patch, reassemble, transmit, so fields
//! outside the edit set are never clobbered. The positional schema is kept
//! in one place here; callers use symbolic [`Setting`] identifiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::{record, Command, Connection, ProtocolError, Record};

/// Which shared settings record a field lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingsRecord {
    /// Main settings frame (`u`/`U`)
    Main,
    /// Auxiliary settings frame (`n`/`N`)
    Other,
}

impl SettingsRecord {
    /// Tag of the read command
    pub fn get_tag(self) -> &'static str {
        match self {
            SettingsRecord::Main => "u",
            SettingsRecord::Other => "n",
        }
    }

    /// Tag of the write command
    pub fn set_tag(self) -> &'static str {
        match self {
            SettingsRecord::Main => "U",
            SettingsRecord::Other => "N",
        }
    }

    /// Minimum field count a fetched record must have to cover the schema
    ///
    /// A shorter response means the firmware is answering with a different
    /// record shape than this driver was built for; patching through it
    /// would write fields blind.
    pub const fn min_fields(self) -> usize {
        match self {
            SettingsRecord::Main => 16,
            SettingsRecord::Other => 3,
        }
    }
}

/// A device setting addressable by the external layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Setting {
    /// Focuser travel limit in steps
    FocuserMaxPosition,
    /// Stepper motion speed
    FocuserSpeed,
    /// Stepper drive mode
    FocuserMode,
    /// Temperature compensation coefficient in steps per degree
    FocuserCompensation,
    /// Power-up default for relay output 1
    PowerDefaultOn1,
    /// Power-up default for relay output 2
    PowerDefaultOn2,
    /// Power-up default for relay output 3
    PowerDefaultOn3,
    /// Buzzer feedback enabled
    BuzzerEnabled,
    /// Automatic temperature compensation enabled
    AutoCompensation,
    /// Temperature change that triggers compensation, in degrees
    CompensationThreshold,
}

/// Schema entry binding a symbolic setting to its positional field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    /// Record the field lives in
    pub record: SettingsRecord,
    /// Zero-based post-tag field index
    pub index: usize,
    /// Decimal scale divisor between the wire integer and the physical value
    pub scale: f64,
}

impl Setting {
    /// Positional schema for this setting
    pub const fn spec(self) -> FieldSpec {
        use SettingsRecord::{Main, Other};
        let (record, index, scale) = match self {
            Setting::FocuserMaxPosition => (Main, 0, 1.0),
            Setting::FocuserSpeed => (Main, 1, 1.0),
            Setting::FocuserMode => (Main, 2, 1.0),
            Setting::FocuserCompensation => (Main, 8, 100.0),
            Setting::PowerDefaultOn1 => (Main, 13, 1.0),
            Setting::PowerDefaultOn2 => (Main, 14, 1.0),
            Setting::PowerDefaultOn3 => (Main, 15, 1.0),
            Setting::BuzzerEnabled => (Other, 0, 1.0),
            Setting::AutoCompensation => (Other, 1, 1.0),
            Setting::CompensationThreshold => (Other, 2, 100.0),
        };
        FieldSpec {
            record,
            index,
            scale,
        }
    }

    /// Encode a physical value as the wire field text
    pub fn encode(self, value: f64) -> String {
        format!("{}", (value * self.spec().scale).round() as i64)
    }
}

/// Read a setting's value out of a fetched record
pub fn read_setting(record: &Record, setting: Setting) -> Result<f64, ProtocolError> {
    let spec = setting.spec();
    record.numeric_field(spec.index, spec.scale)
}

/// Named settings group synchronized (and invalidated) as a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingsGroup {
    /// Focuser travel/speed/compensation fields of the main record
    Focuser,
    /// Stepper drive mode field of the main record
    FocuserMode,
    /// Relay power-up defaults of the main record
    PowerDefaultOn,
    /// The auxiliary record
    Other,
}

impl SettingsGroup {
    /// Record the group's fields live in
    pub const fn record(self) -> SettingsRecord {
        match self {
            SettingsGroup::Other => SettingsRecord::Other,
            _ => SettingsRecord::Main,
        }
    }

    /// Field indices the group aliases within its record
    pub const fn indices(self) -> &'static [usize] {
        match self {
            SettingsGroup::Focuser => &[0, 1, 8],
            SettingsGroup::FocuserMode => &[2],
            SettingsGroup::PowerDefaultOn => &[13, 14, 15],
            SettingsGroup::Other => &[0, 1, 2],
        }
    }

    /// Group a setting belongs to
    pub const fn of(setting: Setting) -> Self {
        match setting {
            Setting::FocuserMaxPosition
            | Setting::FocuserSpeed
            | Setting::FocuserCompensation => SettingsGroup::Focuser,
            Setting::FocuserMode => SettingsGroup::FocuserMode,
            Setting::PowerDefaultOn1
            | Setting::PowerDefaultOn2
            | Setting::PowerDefaultOn3 => SettingsGroup::PowerDefaultOn,
            Setting::BuzzerEnabled
            | Setting::AutoCompensation
            | Setting::CompensationThreshold => SettingsGroup::Other,
        }
    }
}

/// Focuser settings decoded from the main record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocuserSettings {
    /// Travel limit in steps
    pub max_position: f64,
    /// Stepper motion speed
    pub speed: f64,
    /// Compensation coefficient in steps per degree
    pub compensation: f64,
}

impl FocuserSettings {
    /// Decode from a fetched main settings record
    pub fn from_record(record: &Record) -> Result<Self, ProtocolError> {
        Ok(Self {
            max_position: read_setting(record, Setting::FocuserMaxPosition)?,
            speed: read_setting(record, Setting::FocuserSpeed)?,
            compensation: read_setting(record, Setting::FocuserCompensation)?,
        })
    }
}

/// Stepper drive mode decoded from the main record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocuserMode {
    /// Unipolar stepper drive
    Unipolar,
    /// Bipolar stepper drive
    Bipolar,
    /// Brushed DC motor drive
    Dc,
}

impl FocuserMode {
    /// Decode from a fetched main settings record
    pub fn from_record(record: &Record) -> Result<Self, ProtocolError> {
        let raw = read_setting(record, Setting::FocuserMode)? as i64;
        Ok(match raw {
            1 => FocuserMode::Bipolar,
            2 => FocuserMode::Dc,
            _ => FocuserMode::Unipolar,
        })
    }
}

/// Relay power-up defaults decoded from the main record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerDefaultOn {
    /// Power-up state of relay outputs 1 to 3
    pub outputs: [bool; 3],
}

impl PowerDefaultOn {
    /// Decode from a fetched main settings record
    pub fn from_record(record: &Record) -> Result<Self, ProtocolError> {
        Ok(Self {
            outputs: [
                read_setting(record, Setting::PowerDefaultOn1)? > 0.0,
                read_setting(record, Setting::PowerDefaultOn2)? > 0.0,
                read_setting(record, Setting::PowerDefaultOn3)? > 0.0,
            ],
        })
    }
}

/// Auxiliary settings decoded from the `n` record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OtherSettings {
    /// Buzzer feedback enabled
    pub buzzer: bool,
    /// Automatic temperature compensation enabled
    pub auto_compensation: bool,
    /// Temperature change that triggers compensation, in degrees
    pub compensation_threshold: f64,
}

impl OtherSettings {
    /// Decode from a fetched auxiliary settings record
    pub fn from_record(record: &Record) -> Result<Self, ProtocolError> {
        Ok(Self {
            buzzer: read_setting(record, Setting::BuzzerEnabled)? > 0.0,
            auto_compensation: read_setting(record, Setting::AutoCompensation)? > 0.0,
            compensation_threshold: read_setting(record, Setting::CompensationThreshold)?,
        })
    }
}

/// Overwrite selected zero-based fields of a shared settings record
///
/// Fetches the record under `get_tag`, patches the requested indices in a
/// working copy, and transmits the reassembled record under `set_tag`.
/// Nothing is transmitted unless every edit index fits the fetched record,
/// so a failed patch leaves the device untouched. When `edits` repeats an
/// index the last entry in iteration order wins; callers must not rely on
/// map order for colliding indices.
pub fn patch(
    conn: &mut Connection,
    get_tag: &str,
    set_tag: &str,
    edits: &BTreeMap<usize, String>,
) -> Result<(), ProtocolError> {
    patch_fields(conn, get_tag, set_tag, 0, edits)
}

/// Patch a settings record addressed symbolically
///
/// On top of [`patch`], the fetched record must be wide enough to cover the
/// whole schema of the target record, so a firmware answering with an
/// unexpected record shape is rejected before anything is written.
pub fn patch_record(
    conn: &mut Connection,
    target: SettingsRecord,
    edits: &BTreeMap<usize, String>,
) -> Result<(), ProtocolError> {
    patch_fields(
        conn,
        target.get_tag(),
        target.set_tag(),
        target.min_fields(),
        edits,
    )
}

fn patch_fields(
    conn: &mut Connection,
    get_tag: &str,
    set_tag: &str,
    min_fields: usize,
    edits: &BTreeMap<usize, String>,
) -> Result<(), ProtocolError> {
    let fetched = conn.execute(&Command::raw(get_tag))?;
    let mut fields: Vec<String> = fetched.fields().to_vec();

    if fields.len() < min_fields {
        return Err(ProtocolError::RecordTooShort {
            fields: fields.len(),
            index: min_fields - 1,
        });
    }
    if let Some((&highest, _)) = edits.iter().next_back() {
        if highest >= fields.len() {
            return Err(ProtocolError::RecordTooShort {
                fields: fields.len(),
                index: highest,
            });
        }
    }
    for (&index, value) in edits {
        fields[index] = value.clone();
    }

    conn.execute(&Command::raw(record::join(set_tag, &fields)))?;
    Ok(())
}

/// Apply a single user-initiated setting write
pub fn apply(conn: &mut Connection, setting: Setting, value: f64) -> Result<(), ProtocolError> {
    let spec = setting.spec();
    let mut edits = BTreeMap::new();
    edits.insert(spec.index, setting.encode(value));
    patch_record(conn, spec.record, &edits)
}
