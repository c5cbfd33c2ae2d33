//! BLE GATT service layout of the bed controller
//!
//! The bed exposes one vendor service with one characteristic per actuator.
//! Every characteristic is read/write: writing sets the target value, reading
//! reports the current one.

use uuid::Uuid;

/// Vendor service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xdb801000_f324_29c3_38d1_85c0c2e86885);

/// Upper (head) lift position (read/write)
pub const UPPER_LIFT_UUID: Uuid = Uuid::from_u128(0xdb801041_f324_29c3_38d1_85c0c2e86885);

/// Lower (foot) lift position (read/write)
pub const LOWER_LIFT_UUID: Uuid = Uuid::from_u128(0xdb801042_f324_29c3_38d1_85c0c2e86885);

/// Lower massage motor intensity (read/write)
pub const LOWER_VIBRATION_UUID: Uuid = Uuid::from_u128(0xdb801060_f324_29c3_38d1_85c0c2e86885);

/// Upper massage motor intensity (read/write)
pub const UPPER_VIBRATION_UUID: Uuid = Uuid::from_u128(0xdb801061_f324_29c3_38d1_85c0c2e86885);

/// Under-bed light (write, read on newer firmware only)
pub const LIGHT_UUID: Uuid = Uuid::from_u128(0xdb8010a0_f324_29c3_38d1_85c0c2e86885);

/// Light command bytes
pub mod light {
    /// Light off
    pub const OFF: u8 = 0x00;

    /// Light on, used by profiles that don't override it
    pub const ON: u8 = 0x64;
}

/// A characteristic of the bed service the codec knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Characteristic {
    UpperLift,
    LowerLift,
    UpperVibration,
    LowerVibration,
    Light,
}

impl Characteristic {
    pub const ALL: [Characteristic; 5] = [
        Characteristic::UpperLift,
        Characteristic::LowerLift,
        Characteristic::UpperVibration,
        Characteristic::LowerVibration,
        Characteristic::Light,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Characteristic::UpperLift => UPPER_LIFT_UUID,
            Characteristic::LowerLift => LOWER_LIFT_UUID,
            Characteristic::UpperVibration => UPPER_VIBRATION_UUID,
            Characteristic::LowerVibration => LOWER_VIBRATION_UUID,
            Characteristic::Light => LIGHT_UUID,
        }
    }

    /// Find the characteristic a discovered UUID belongs to
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    /// Lift actuators take time to reach a written position
    pub fn is_lift(self) -> bool {
        matches!(self, Characteristic::UpperLift | Characteristic::LowerLift)
    }

    pub fn name(self) -> &'static str {
        match self {
            Characteristic::UpperLift => "upper lift",
            Characteristic::LowerLift => "lower lift",
            Characteristic::UpperVibration => "upper vib",
            Characteristic::LowerVibration => "lower vib",
            Characteristic::Light => "light",
        }
    }
}

impl std::fmt::Display for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::{Characteristic, SERVICE_UUID};
    use uuid::Uuid;

    #[test]
    fn uuid_lookup_ignores_case() {
        let light = Uuid::parse_str("DB8010A0-F324-29C3-38D1-85C0C2E86885").unwrap();
        assert_eq!(Characteristic::from_uuid(light), Some(Characteristic::Light));
        assert_eq!(Characteristic::from_uuid(SERVICE_UUID), None);
    }

    #[test]
    fn uuids_match_the_advertised_strings() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "db801000-f324-29c3-38d1-85c0c2e86885"
        );
        assert_eq!(
            Characteristic::LowerVibration.uuid().to_string(),
            "db801060-f324-29c3-38d1-85c0c2e86885"
        );
    }

    #[test]
    fn every_characteristic_has_a_distinct_uuid() {
        for c in Characteristic::ALL {
            assert_eq!(Characteristic::from_uuid(c.uuid()), Some(c));
        }
    }
}
