use std::time::Duration;

use crate::{
    Characteristic, DecodeError, DeviceProfile, Intent, InvalidPercent, NativeRange, Preset,
    ProfileError, Reading, WireCommand, ble,
};

/// What the session has to do on the wire for one intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// Write `commands` one after the other. `observe` is the characteristic
    /// whose read-back confirms the effect, if there is exactly one.
    Write {
        commands: Vec<WireCommand>,
        observe: Option<Characteristic>,
    },
    /// Read these characteristics, in order
    Read(Vec<Characteristic>),
}

/// Encoder/decoder for one firmware profile
#[derive(Debug, Clone, Default)]
pub struct Codec {
    profile: DeviceProfile,
}

impl Codec {
    /// Build the codec for `model`, refusing ranges it can't map onto
    pub fn new(model: &str, profile: DeviceProfile) -> Result<Self, ProfileError> {
        profile.validate(model)?;
        Ok(Self { profile })
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn range(&self, target: Characteristic) -> Option<NativeRange> {
        match target {
            Characteristic::UpperLift | Characteristic::LowerLift => Some(self.profile.lift),
            Characteristic::UpperVibration | Characteristic::LowerVibration => {
                Some(self.profile.vibration)
            }
            Characteristic::Light => None,
        }
    }

    /// Write `pct` (0..=100) to a lift or vibration characteristic
    fn percent_command(&self, target: Characteristic, pct: u8) -> WireCommand {
        let payload = match self.range(target) {
            Some(range) => {
                let native = range.from_pct(pct);
                match range.width() {
                    1 => vec![native as u8],
                    _ => native.to_le_bytes().to_vec(),
                }
            }
            None => vec![if pct > 0 { self.profile.light_on } else { ble::light::OFF }],
        };
        WireCommand { target, payload }
    }

    pub fn light(&self, on: bool) -> WireCommand {
        WireCommand {
            target: Characteristic::Light,
            payload: vec![if on { self.profile.light_on } else { ble::light::OFF }],
        }
    }

    pub fn preset(&self, preset: Preset) -> Vec<WireCommand> {
        preset
            .steps()
            .iter()
            .map(|&(target, pct)| self.percent_command(target, pct))
            .collect()
    }

    pub fn encode(&self, intent: &Intent) -> Result<Exchange, InvalidPercent> {
        intent.validate()?;

        let single = |command: WireCommand| {
            let observe = Some(command.target);
            Exchange::Write {
                commands: vec![command],
                observe,
            }
        };

        Ok(match *intent {
            Intent::MoveUpper(p) => single(self.percent_command(Characteristic::UpperLift, p as u8)),
            Intent::MoveLower(p) => single(self.percent_command(Characteristic::LowerLift, p as u8)),
            Intent::SetUpperVibration(p) => {
                single(self.percent_command(Characteristic::UpperVibration, p as u8))
            }
            Intent::SetLowerVibration(p) => {
                single(self.percent_command(Characteristic::LowerVibration, p as u8))
            }
            Intent::LightSet(on) => single(self.light(on)),
            Intent::EnterPreset(preset) => Exchange::Write {
                commands: self.preset(preset),
                observe: None,
            },
            Intent::LightQuery => Exchange::Read(vec![Characteristic::Light]),
            Intent::UpperHeightQuery => Exchange::Read(vec![Characteristic::UpperLift]),
            Intent::LowerHeightQuery => Exchange::Read(vec![Characteristic::LowerLift]),
            Intent::UpperVibrationQuery => Exchange::Read(vec![Characteristic::UpperVibration]),
            Intent::LowerVibrationQuery => Exchange::Read(vec![Characteristic::LowerVibration]),
            Intent::StatusQuery => Exchange::Read(Characteristic::ALL.to_vec()),
        })
    }

    /// Time to wait after `command` for a lift to get there from `from_pct`.
    /// An unknown start position is assumed to be the far end.
    pub fn travel(&self, command: &WireCommand, from_pct: Option<u8>) -> Duration {
        if !command.target.is_lift() {
            return Duration::ZERO;
        }
        let Some(to) = self
            .decode(command.target, &command.payload)
            .ok()
            .and_then(|r| r.percent())
        else {
            return Duration::ZERO;
        };
        let from = from_pct.unwrap_or(if to < 50 { 100 } else { 0 });
        self.profile.travel_time(from, to)
    }

    pub fn decode(&self, target: Characteristic, raw: &[u8]) -> Result<Reading, DecodeError> {
        let Some(range) = self.range(target) else {
            return match raw {
                [] => Err(DecodeError::Unsupported(Characteristic::Light)),
                [v] => Ok(Reading::Light(*v != ble::light::OFF)),
                _ => Err(DecodeError::Malformed {
                    target,
                    expected: 1,
                    got: raw.len(),
                }),
            };
        };

        let native = match (range.width(), raw) {
            (1, [v]) => *v as u16,
            (2, [lo, hi]) => u16::from_le_bytes([*lo, *hi]),
            (expected, _) => {
                return Err(DecodeError::Malformed {
                    target,
                    expected,
                    got: raw.len(),
                });
            }
        };

        if !range.contains(native) {
            return Err(DecodeError::OutOfRange {
                target,
                value: native,
                min: range.min,
                max: range.max,
            });
        }

        let pct = range.to_pct(native);
        Ok(match target {
            Characteristic::UpperLift => Reading::UpperHeight(pct),
            Characteristic::LowerLift => Reading::LowerHeight(pct),
            Characteristic::UpperVibration => Reading::UpperVibration(pct),
            Characteristic::LowerVibration => Reading::LowerVibration(pct),
            Characteristic::Light => Reading::Light(native != 0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coarse() -> Codec {
        Codec::new(
            "coarse",
            DeviceProfile {
                lift: NativeRange::new(16, 79),
                vibration: NativeRange::new(0, 10),
                light_on: 0x01,
                ..DeviceProfile::default()
            },
        )
        .unwrap()
    }

    fn percent_of(reading: Reading) -> u8 {
        reading
            .percent()
            .unwrap_or_else(|| panic!("not a percentage: {reading:?}"))
    }

    fn echo(codec: &Codec, intent: Intent) -> Reading {
        let Exchange::Write { commands, observe } = codec.encode(&intent).unwrap() else {
            panic!("{intent} should write");
        };
        let target = observe.unwrap();
        codec.decode(target, &commands[0].payload).unwrap()
    }

    #[test]
    fn upper_round_trip_within_quantization() {
        for codec in [Codec::default(), coarse()] {
            let tolerance = codec.profile().lift.quantization_pct() as i64;
            for pct in 0..=100 {
                let got = percent_of(echo(&codec, Intent::MoveUpper(pct))) as i64;
                assert!(
                    (got - pct).abs() <= tolerance,
                    "{pct}% came back as {got}% (tolerance {tolerance})"
                );
            }
        }
    }

    #[test]
    fn vibration_round_trip_on_ten_step_motor() {
        let codec = coarse();
        let tolerance = codec.profile().vibration.quantization_pct() as i64;
        assert_eq!(tolerance, 10);
        for pct in 0..=100 {
            let got = percent_of(echo(&codec, Intent::SetLowerVibration(pct))) as i64;
            assert!((got - pct).abs() <= tolerance);
        }
    }

    #[test]
    fn default_profile_writes_percent_as_byte() {
        let codec = Codec::default();
        let Exchange::Write { commands, observe } = codec.encode(&Intent::MoveLower(42)).unwrap()
        else {
            panic!()
        };
        assert_eq!(observe, Some(Characteristic::LowerLift));
        assert_eq!(
            commands,
            [WireCommand {
                target: Characteristic::LowerLift,
                payload: vec![0x2a]
            }]
        );
    }

    #[test]
    fn wide_range_is_little_endian() {
        let codec = Codec::new(
            "wide",
            DeviceProfile {
                lift: NativeRange::new(0, 1000),
                ..DeviceProfile::default()
            },
        )
        .unwrap();
        let Exchange::Write { commands, .. } = codec.encode(&Intent::MoveUpper(50)).unwrap() else {
            panic!()
        };
        assert_eq!(commands[0].payload, vec![0xf4, 0x01]);
        assert_eq!(
            codec.decode(Characteristic::UpperLift, &[0xf4, 0x01]),
            Ok(Reading::UpperHeight(50))
        );
    }

    #[test]
    fn out_of_range_never_encodes() {
        assert!(Codec::default().encode(&Intent::SetUpperVibration(101)).is_err());
        assert!(Codec::default().encode(&Intent::MoveUpper(-5)).is_err());
    }

    #[test]
    fn presets_keep_their_order() {
        let codec = Codec::default();
        let Exchange::Write { commands, observe } =
            codec.encode(&Intent::EnterPreset(Preset::ZeroG)).unwrap()
        else {
            panic!()
        };
        assert_eq!(observe, None);
        assert_eq!(
            commands,
            [
                WireCommand {
                    target: Characteristic::UpperLift,
                    payload: vec![0x46]
                },
                WireCommand {
                    target: Characteristic::LowerLift,
                    payload: vec![0x1f]
                },
            ]
        );

        let stop: Vec<_> = codec
            .preset(Preset::Stop)
            .into_iter()
            .map(|c| (c.target, c.payload))
            .collect();
        assert_eq!(
            stop,
            [
                (Characteristic::LowerVibration, vec![0]),
                (Characteristic::UpperVibration, vec![0])
            ]
        );
    }

    #[test]
    fn light_uses_profile_byte() {
        assert_eq!(Codec::default().light(true).payload, vec![0x64]);
        assert_eq!(coarse().light(true).payload, vec![0x01]);
        assert_eq!(coarse().light(false).payload, vec![0x00]);
    }

    #[test]
    fn decode_rejects_bad_payloads() {
        let codec = Codec::default();
        assert_eq!(
            codec.decode(Characteristic::UpperLift, &[]),
            Err(DecodeError::Malformed {
                target: Characteristic::UpperLift,
                expected: 1,
                got: 0
            })
        );
        assert!(matches!(
            codec.decode(Characteristic::LowerLift, &[1, 2]),
            Err(DecodeError::Malformed { got: 2, .. })
        ));
        assert!(matches!(
            codec.decode(Characteristic::UpperVibration, &[101]),
            Err(DecodeError::OutOfRange { value: 101, .. })
        ));
        assert!(matches!(
            coarse().decode(Characteristic::UpperLift, &[3]),
            Err(DecodeError::OutOfRange { min: 16, .. })
        ));
    }

    #[test]
    fn light_status_tolerates_unreadable_firmware() {
        let codec = Codec::default();
        assert_eq!(
            codec.decode(Characteristic::Light, &[]),
            Err(DecodeError::Unsupported(Characteristic::Light))
        );
        assert_eq!(codec.decode(Characteristic::Light, &[0x64]), Ok(Reading::Light(true)));
        assert_eq!(codec.decode(Characteristic::Light, &[0x00]), Ok(Reading::Light(false)));
    }

    #[test]
    fn queries_read_without_writing() {
        let codec = Codec::default();
        assert_eq!(
            codec.encode(&Intent::UpperVibrationQuery).unwrap(),
            Exchange::Read(vec![Characteristic::UpperVibration])
        );
        let Exchange::Read(all) = codec.encode(&Intent::StatusQuery).unwrap() else {
            panic!()
        };
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn inverted_range_is_refused() {
        let inverted = DeviceProfile {
            vibration: NativeRange::new(10, 0),
            ..DeviceProfile::default()
        };
        assert!(matches!(
            Codec::new("backwards", inverted),
            Err(ProfileError::InvalidRange {
                actuator: "vibration",
                min: 10,
                max: 0,
                ..
            })
        ));
    }

    #[test]
    fn travel_only_applies_to_lifts() {
        let codec = Codec::default();
        let head_down = codec.percent_command(Characteristic::UpperLift, 0);
        assert_eq!(codec.travel(&head_down, Some(100)), Duration::from_secs(30));
        assert_eq!(codec.travel(&head_down, Some(10)), Duration::from_secs(3));
        assert_eq!(codec.travel(&head_down, None), Duration::from_secs(30));

        let massage = codec.percent_command(Characteristic::UpperVibration, 0);
        assert_eq!(codec.travel(&massage, Some(100)), Duration::ZERO);
    }
}
