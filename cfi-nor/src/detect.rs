use crate::bus::NorBus;
use crate::command::CommandSequencer;
use crate::profile::{resolve_builtin_profile, BuiltInProfile, NorProfile};
use crate::types::Error;

/// Autoselect word offsets of the manufacturer code and the three device id cycles.
const MANUFACTURER_WORD: u32 = 0x00;
const DEVICE_ID_WORDS: [u32; 3] = [0x01, 0x0E, 0x0F];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NorId {
    pub manufacturer: u16,
    pub device: [u16; 3],
}

impl NorId {
    pub const SPANSION: u16 = 0x0001;
    pub const MICRON: u16 = 0x0020;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DetectedNorInfo {
    pub id: NorId,
    pub profile_name: &'static str,
}

/// Enters autoselect mode, reads the id words and returns to read-array mode.
pub(crate) fn read_id<B: NorBus>(bus: &mut B, seq: &CommandSequencer) -> NorId {
    seq.autoselect(bus);
    let manufacturer = bus.read16(seq.command_address(MANUFACTURER_WORD));
    let mut device = [0u16; 3];
    for (word, id) in DEVICE_ID_WORDS.iter().zip(device.iter_mut()) {
        *id = bus.read16(seq.command_address(*word));
    }
    seq.reset(bus, seq.command_address(0));
    NorId {
        manufacturer,
        device,
    }
}

fn detect_builtin(id: NorId) -> Option<BuiltInProfile> {
    match (id.manufacturer & 0x00FF, id.device) {
        (NorId::SPANSION, [0x227E, 0x2221, 0x2201]) => Some(BuiltInProfile::S29GL128P),
        (NorId::SPANSION, [0x227E, 0x2222, 0x2201]) => Some(BuiltInProfile::S29GL256P),
        (NorId::MICRON, [0x227E, 0x2221, 0x2201]) => Some(BuiltInProfile::M29W128G),
        _ => None,
    }
}

pub(crate) fn detect_profile(
    id: NorId,
) -> Result<(&'static dyn NorProfile, DetectedNorInfo), Error> {
    let profile = detect_builtin(id).ok_or(Error::UnknownDeviceId)?;
    let profile = resolve_builtin_profile(profile);
    Ok((
        profile,
        DetectedNorInfo {
            id,
            profile_name: profile.name(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNor;
    use crate::profile::NorCommandSet;

    const BASE: u32 = 0x6000_0000;

    #[test]
    fn detect_known_spansion_parts() {
        let id = NorId {
            manufacturer: 0x0001,
            device: [0x227E, 0x2222, 0x2201],
        };
        let (profile, detected) = detect_profile(id).unwrap();

        assert_eq!(profile.name(), "s29gl256p");
        assert_eq!(detected.profile_name, "s29gl256p");
        assert_eq!(detected.id, id);
    }

    #[test]
    fn detect_ignores_upper_manufacturer_byte() {
        let id = NorId {
            manufacturer: 0xFF20,
            device: [0x227E, 0x2221, 0x2201],
        };
        let (profile, _) = detect_profile(id).unwrap();
        assert_eq!(profile.name(), "m29w128g");
    }

    #[test]
    fn detect_unknown_id_returns_explicit_error() {
        let unknown = NorId {
            manufacturer: 0x00C2,
            device: [0x227E, 0x2221, 0x2201],
        };
        assert_eq!(detect_profile(unknown).err(), Some(Error::UnknownDeviceId));
    }

    #[test]
    fn read_id_uses_autoselect_and_returns_to_read_mode() {
        let mut nor = MockNor::new(BASE, 1024 * 1024, 64 * 1024);
        nor.load(BASE, &[0x34, 0x12]);
        let seq = CommandSequencer::new(BASE, 1, NorCommandSet::amd_standard());

        let id = read_id(&mut nor, &seq);

        assert_eq!(id, MockNor::DEFAULT_ID);
        assert_eq!(nor.writes().last().map(|w| w.value), Some(0xF0));
        assert_eq!(nor.read16(BASE), 0x1234);
    }
}
