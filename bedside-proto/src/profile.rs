//! Firmware profiles: native actuator ranges per bed model
//!
//! Different controller firmware revisions use different native value ranges
//! for the same percentage. The codec never hard codes a range; it is always
//! handed a [`DeviceProfile`] resolved from a [`ProfileTable`].

use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the profile used when nothing else is configured
pub const DEFAULT_MODEL: &str = "default";

/// Inclusive native value range an actuator accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NativeRange {
    pub min: u16,
    pub max: u16,
}

impl NativeRange {
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn span(&self) -> u16 {
        self.max.saturating_sub(self.min)
    }

    pub fn contains(&self, native: u16) -> bool {
        (self.min..=self.max).contains(&native)
    }

    /// Bytes needed on the wire for a value of this range
    pub fn width(&self) -> usize {
        if self.max > u8::MAX as u16 { 2 } else { 1 }
    }

    /// Map a percentage (already validated to 0..=100) onto this range
    pub fn from_pct(&self, pct: u8) -> u16 {
        let span = self.span() as u32;
        let scaled = (pct as u32 * span + 50) / 100;
        self.min + scaled as u16
    }

    /// Map a native value (already checked with [`NativeRange::contains`]) back to a percentage
    pub fn to_pct(&self, native: u16) -> u8 {
        let span = self.span() as u32;
        if span == 0 {
            return 0;
        }
        let offset = (native - self.min) as u32;
        ((offset * 100 + span / 2) / span) as u8
    }

    /// Worst case difference, in percent, between a requested and a reported value
    pub fn quantization_pct(&self) -> u8 {
        match self.span() {
            0 => 100,
            span => 100u16.div_ceil(span).min(100) as u8,
        }
    }
}

/// How one firmware model maps percentages and light state onto the wire
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceProfile {
    pub lift: NativeRange,
    pub vibration: NativeRange,
    #[serde(default = "default_light_on")]
    pub light_on: u8,
    /// Time a lift actuator needs to travel from 0% to 100%
    #[serde(default = "default_full_travel_ms")]
    pub full_travel_ms: u64,
}

fn default_light_on() -> u8 {
    crate::ble::light::ON
}

fn default_full_travel_ms() -> u64 {
    30_000
}

impl DeviceProfile {
    /// Reject ranges the codec can't map percentages onto
    pub fn validate(&self, model: &str) -> Result<(), ProfileError> {
        for (actuator, range) in [("lift", self.lift), ("vibration", self.vibration)] {
            if range.min >= range.max {
                return Err(ProfileError::InvalidRange {
                    model: model.to_string(),
                    actuator,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        Ok(())
    }

    /// How long a lift takes to move between two percentages
    pub fn travel_time(&self, from_pct: u8, to_pct: u8) -> Duration {
        let distance = from_pct.abs_diff(to_pct).min(100) as u64;
        Duration::from_millis(self.full_travel_ms * distance / 100)
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            lift: NativeRange::new(0, 100),
            vibration: NativeRange::new(0, 100),
            light_on: default_light_on(),
            full_travel_ms: default_full_travel_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("unknown bed model: {0}")]
    UnknownModel(String),
    #[error("profile {model}: {actuator} range {min}..={max} is empty or inverted")]
    InvalidRange {
        model: String,
        actuator: &'static str,
        min: u16,
        max: u16,
    },
}

/// Lookup table of known profiles, keyed by model name
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: BTreeMap<String, DeviceProfile>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileTable {
    /// The table with only the known firmware in it
    pub fn builtin() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_MODEL.to_string(), DeviceProfile::default());
        Self { profiles }
    }

    /// Add or replace a profile, rejecting ranges the codec can't map onto
    pub fn insert(&mut self, model: &str, profile: DeviceProfile) -> Result<(), ProfileError> {
        profile.validate(model)?;
        self.profiles.insert(model.to_string(), profile);
        Ok(())
    }

    pub fn resolve(&self, model: &str) -> Result<DeviceProfile, ProfileError> {
        self.profiles
            .get(model)
            .cloned()
            .ok_or_else(|| ProfileError::UnknownModel(model.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_is_identity() {
        let range = DeviceProfile::default().lift;
        for pct in 0..=100u8 {
            assert_eq!(range.from_pct(pct), pct as u16);
            assert_eq!(range.to_pct(pct as u16), pct);
        }
        assert_eq!(range.quantization_pct(), 1);
        assert_eq!(range.width(), 1);
    }

    #[test]
    fn offset_range_maps_end_points() {
        let range = NativeRange::new(16, 79);
        assert_eq!(range.from_pct(0), 16);
        assert_eq!(range.from_pct(100), 79);
        assert_eq!(range.to_pct(16), 0);
        assert_eq!(range.to_pct(79), 100);
        assert_eq!(range.quantization_pct(), 2);
    }

    #[test]
    fn wide_range_needs_two_bytes() {
        assert_eq!(NativeRange::new(0, 1000).width(), 2);
        assert_eq!(NativeRange::new(0, 255).width(), 1);
    }

    #[test]
    fn table_rejects_inverted_range() {
        let mut table = ProfileTable::builtin();
        let profile = DeviceProfile {
            lift: NativeRange::new(10, 10),
            ..DeviceProfile::default()
        };
        assert!(matches!(
            table.insert("broken", profile),
            Err(ProfileError::InvalidRange { actuator: "lift", .. })
        ));
        assert!(matches!(
            table.resolve("broken"),
            Err(ProfileError::UnknownModel(_))
        ));
    }

    #[test]
    fn profile_parses_without_light_byte() {
        let profile: DeviceProfile = serde_json::from_str(
            r#"{"lift": {"min": 0, "max": 63}, "vibration": {"min": 0, "max": 10}}"#,
        )
        .unwrap();
        assert_eq!(profile.light_on, 0x64);
        assert_eq!(profile.full_travel_ms, 30_000);
        assert_eq!(profile.lift, NativeRange::new(0, 63));
    }

    #[test]
    fn travel_is_proportional_to_distance() {
        let profile = DeviceProfile::default();
        assert_eq!(profile.travel_time(100, 0), Duration::from_secs(30));
        assert_eq!(profile.travel_time(20, 60), Duration::from_secs(12));
        assert_eq!(profile.travel_time(50, 50), Duration::ZERO);
    }
}
