//! Bed command protocol - intents, wire commands and status readings
//!
//! Everything in this crate is pure: turning an [`Intent`] into bytes and bytes
//! back into a [`Reading`] never touches the radio.

pub mod ble;
mod codec;
pub mod profile;

pub use ble::Characteristic;
pub use codec::{Codec, Exchange};
pub use profile::{DEFAULT_MODEL, DeviceProfile, NativeRange, ProfileError, ProfileTable};

/// Named bed positions and the stop command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    Flat,
    ZeroG,
    NoSnore,
    /// Stops both massage motors
    Stop,
}

impl Preset {
    pub fn name(self) -> &'static str {
        match self {
            Preset::Flat => "flat",
            Preset::ZeroG => "zero G",
            Preset::NoSnore => "no snore",
            Preset::Stop => "stop",
        }
    }

    /// Target percentage per characteristic, in the order they must be sent
    pub fn steps(self) -> &'static [(Characteristic, u8)] {
        match self {
            // head before feet so the frame never lifts from one end only
            Preset::Flat => &[(Characteristic::UpperLift, 0), (Characteristic::LowerLift, 0)],
            Preset::ZeroG => &[(Characteristic::UpperLift, 70), (Characteristic::LowerLift, 31)],
            Preset::NoSnore => &[(Characteristic::UpperLift, 11)],
            Preset::Stop => &[
                (Characteristic::LowerVibration, 0),
                (Characteristic::UpperVibration, 0),
            ],
        }
    }
}

/// One requested bed or light operation, before encoding
///
/// Percentages are carried as received; [`Intent::validate`] rejects anything
/// outside `0..=100` before the intent can reach the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    MoveUpper(i64),
    MoveLower(i64),
    SetUpperVibration(i64),
    SetLowerVibration(i64),
    EnterPreset(Preset),
    LightSet(bool),
    LightQuery,
    UpperHeightQuery,
    LowerHeightQuery,
    UpperVibrationQuery,
    LowerVibrationQuery,
    /// Read every characteristic into a [`DeviceStatus`]
    StatusQuery,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("percentage {value} for {target} is outside 0..=100")]
pub struct InvalidPercent {
    pub target: Characteristic,
    pub value: i64,
}

impl Intent {
    /// The characteristic a percentage intent writes, with its raw percentage
    fn percentage(&self) -> Option<(Characteristic, i64)> {
        match *self {
            Intent::MoveUpper(p) => Some((Characteristic::UpperLift, p)),
            Intent::MoveLower(p) => Some((Characteristic::LowerLift, p)),
            Intent::SetUpperVibration(p) => Some((Characteristic::UpperVibration, p)),
            Intent::SetLowerVibration(p) => Some((Characteristic::LowerVibration, p)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidPercent> {
        match self.percentage() {
            Some((target, value)) if !(0..=100).contains(&value) => {
                Err(InvalidPercent { target, value })
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::MoveUpper(p) => write!(f, "move upper to {p}%"),
            Intent::MoveLower(p) => write!(f, "move lower to {p}%"),
            Intent::SetUpperVibration(p) => write!(f, "set upper vib to {p}%"),
            Intent::SetLowerVibration(p) => write!(f, "set lower vib to {p}%"),
            Intent::EnterPreset(p) => write!(f, "preset {}", p.name()),
            Intent::LightSet(true) => f.write_str("light on"),
            Intent::LightSet(false) => f.write_str("light off"),
            Intent::LightQuery => f.write_str("light status"),
            Intent::UpperHeightQuery => f.write_str("get upper height"),
            Intent::LowerHeightQuery => f.write_str("get lower height"),
            Intent::UpperVibrationQuery => f.write_str("get upper vib"),
            Intent::LowerVibrationQuery => f.write_str("get lower vib"),
            Intent::StatusQuery => f.write_str("status"),
        }
    }
}

/// Bytes to write to one characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCommand {
    pub target: Characteristic,
    pub payload: Vec<u8>,
}

/// A decoded value read from one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    UpperHeight(u8),
    LowerHeight(u8),
    UpperVibration(u8),
    LowerVibration(u8),
    Light(bool),
}

impl Reading {
    pub fn characteristic(&self) -> Characteristic {
        match self {
            Reading::UpperHeight(_) => Characteristic::UpperLift,
            Reading::LowerHeight(_) => Characteristic::LowerLift,
            Reading::UpperVibration(_) => Characteristic::UpperVibration,
            Reading::LowerVibration(_) => Characteristic::LowerVibration,
            Reading::Light(_) => Characteristic::Light,
        }
    }

    /// Position or intensity in percent, `None` for the light
    pub fn percent(&self) -> Option<u8> {
        match *self {
            Reading::UpperHeight(p)
            | Reading::LowerHeight(p)
            | Reading::UpperVibration(p)
            | Reading::LowerVibration(p) => Some(p),
            Reading::Light(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{target}: expected {expected} byte(s), got {got}")]
    Malformed {
        target: Characteristic,
        expected: usize,
        got: usize,
    },
    #[error("{target}: native value {value} outside {min}..={max}")]
    OutOfRange {
        target: Characteristic,
        value: u16,
        min: u16,
        max: u16,
    },
    #[error("{0} is not supported by this firmware")]
    Unsupported(Characteristic),
}

/// Snapshot of every characteristic, `light_on` is `None` when the firmware
/// can't report it
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DeviceStatus {
    pub upper_height_pct: u8,
    pub lower_height_pct: u8,
    pub upper_vib_pct: u8,
    pub lower_vib_pct: u8,
    pub light_on: Option<bool>,
}

impl DeviceStatus {
    /// Assemble a snapshot, all four actuator readings are required
    pub fn from_readings<I: IntoIterator<Item = Reading>>(
        readings: I,
    ) -> Result<Self, DecodeError> {
        let (mut upper, mut lower, mut upper_vib, mut lower_vib, mut light) =
            (None, None, None, None, None);
        for reading in readings {
            match reading {
                Reading::UpperHeight(v) => upper = Some(v),
                Reading::LowerHeight(v) => lower = Some(v),
                Reading::UpperVibration(v) => upper_vib = Some(v),
                Reading::LowerVibration(v) => lower_vib = Some(v),
                Reading::Light(v) => light = Some(v),
            }
        }

        let missing = |target| DecodeError::Malformed {
            target,
            expected: 1,
            got: 0,
        };
        Ok(Self {
            upper_height_pct: upper.ok_or_else(|| missing(Characteristic::UpperLift))?,
            lower_height_pct: lower.ok_or_else(|| missing(Characteristic::LowerLift))?,
            upper_vib_pct: upper_vib.ok_or_else(|| missing(Characteristic::UpperVibration))?,
            lower_vib_pct: lower_vib.ok_or_else(|| missing(Characteristic::LowerVibration))?,
            light_on: light,
        })
    }
}
