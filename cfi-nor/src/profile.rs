use crate::types::Error;

pub const DEFAULT_MAX_TOGGLE_POLLS: u32 = 2_000_000;
pub const UNIFORM_SECTOR_BYTES: usize = 128 * 1024;
pub const DEFAULT_PAGE_BYTES: usize = 1024;
/// 16-bit data bus: command word addresses are doubled on the byte-addressed bus.
pub const X16_ADDRESS_SHIFT: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NorConfig {
    /// Upper bound on toggle-bit reads per erase or program operation.
    pub max_toggle_polls: u32,
    /// Program a trailing odd byte as `byte | 0xFF00` instead of rejecting the buffer.
    pub pad_odd_length: bool,
}

impl Default for NorConfig {
    fn default() -> Self {
        Self {
            max_toggle_polls: DEFAULT_MAX_TOGGLE_POLLS,
            pad_odd_length: true,
        }
    }
}

/// Unlock addresses (device word units) and command codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NorCommandSet {
    pub unlock_addr1: u32,
    pub unlock_addr2: u32,
    pub unlock_data1: u16,
    pub unlock_data2: u16,
    pub erase_setup: u16,
    pub chip_erase: u16,
    pub sector_erase: u16,
    pub program: u16,
    pub autoselect: u16,
    pub reset: u16,
}

impl NorCommandSet {
    pub const fn amd_standard() -> Self {
        Self {
            unlock_addr1: 0x555,
            unlock_addr2: 0x2AA,
            unlock_data1: 0xAA,
            unlock_data2: 0x55,
            erase_setup: 0x80,
            chip_erase: 0x10,
            sector_erase: 0x30,
            program: 0xA0,
            autoselect: 0x90,
            reset: 0xF0,
        }
    }
}

impl Default for NorCommandSet {
    fn default() -> Self {
        Self::amd_standard()
    }
}

pub trait NorProfile: Sync {
    fn name(&self) -> &'static str;
    fn capacity_bytes(&self) -> usize;

    /// Uniform erase granule.
    fn sector_size(&self) -> usize {
        UNIFORM_SECTOR_BYTES
    }

    /// Largest buffer a loader hands to `program_page` in one call.
    fn page_size(&self) -> usize {
        DEFAULT_PAGE_BYTES
    }

    fn address_shift(&self) -> u8 {
        X16_ADDRESS_SHIFT
    }

    fn command_set(&self) -> NorCommandSet {
        NorCommandSet::amd_standard()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BuiltInProfile {
    S29GL128P,
    S29GL256P,
    M29W128G,
}

pub enum ProfileSource {
    BuiltIn(BuiltInProfile),
    Custom(&'static dyn NorProfile),
}

#[derive(Clone, Copy)]
pub(crate) struct ResolvedProfile {
    pub profile: &'static dyn NorProfile,
    pub commands: NorCommandSet,
    pub capacity_bytes: usize,
    pub sector_size: usize,
    pub page_size: usize,
    pub address_shift: u8,
}

#[derive(Clone, Copy)]
struct StaticNorProfile {
    name: &'static str,
    capacity_bytes: usize,
}

impl NorProfile for StaticNorProfile {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

static S29GL128P: StaticNorProfile = StaticNorProfile {
    name: "s29gl128p",
    capacity_bytes: 16 * 1024 * 1024,
};

static S29GL256P: StaticNorProfile = StaticNorProfile {
    name: "s29gl256p",
    capacity_bytes: 32 * 1024 * 1024,
};

static M29W128G: StaticNorProfile = StaticNorProfile {
    name: "m29w128g",
    capacity_bytes: 16 * 1024 * 1024,
};

pub(crate) fn resolve_builtin_profile(profile: BuiltInProfile) -> &'static dyn NorProfile {
    match profile {
        BuiltInProfile::S29GL128P => &S29GL128P,
        BuiltInProfile::S29GL256P => &S29GL256P,
        BuiltInProfile::M29W128G => &M29W128G,
    }
}

pub(crate) fn resolve_profile_source(source: ProfileSource) -> &'static dyn NorProfile {
    match source {
        ProfileSource::BuiltIn(profile) => resolve_builtin_profile(profile),
        ProfileSource::Custom(profile) => profile,
    }
}

impl BuiltInProfile {
    pub const ALL: [Self; 3] = [Self::S29GL128P, Self::S29GL256P, Self::M29W128G];

    pub fn profile(self) -> &'static dyn NorProfile {
        resolve_builtin_profile(self)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.profile().name().eq_ignore_ascii_case(name))
    }
}

pub(crate) fn validate_and_resolve(
    profile: &'static dyn NorProfile,
    config: &NorConfig,
) -> Result<ResolvedProfile, Error> {
    if config.max_toggle_polls == 0 {
        return Err(Error::InvalidConfiguration);
    }

    let capacity = profile.capacity_bytes();
    let sector_size = profile.sector_size();
    let page_size = profile.page_size();
    let address_shift = profile.address_shift();
    let commands = profile.command_set();

    if !sector_size.is_power_of_two() || !page_size.is_power_of_two() || page_size < 2 {
        return Err(Error::InvalidConfiguration);
    }
    if capacity == 0 || capacity % sector_size != 0 || sector_size < page_size {
        return Err(Error::InvalidConfiguration);
    }
    // `NorFlash::ERASE_SIZE` is fixed, so every erase granule it allows must be
    // made of whole sectors.
    if sector_size > UNIFORM_SECTOR_BYTES || capacity % UNIFORM_SECTOR_BYTES != 0 {
        return Err(Error::InvalidConfiguration);
    }
    if u32::try_from(capacity).is_err() || address_shift > X16_ADDRESS_SHIFT {
        return Err(Error::InvalidConfiguration);
    }

    if commands.unlock_addr1 == 0
        || commands.unlock_addr2 == 0
        || commands.erase_setup == 0
        || commands.chip_erase == 0
        || commands.sector_erase == 0
        || commands.program == 0
        || commands.reset == 0
    {
        return Err(Error::InvalidConfiguration);
    }

    let highest_unlock = commands.unlock_addr1.max(commands.unlock_addr2) as usize;
    if (highest_unlock << address_shift) >= capacity {
        return Err(Error::InvalidConfiguration);
    }

    Ok(ResolvedProfile {
        profile,
        commands,
        capacity_bytes: capacity,
        sector_size,
        page_size,
        address_shift,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OddSectorProfile;

    impl NorProfile for OddSectorProfile {
        fn name(&self) -> &'static str {
            "odd-sector"
        }

        fn capacity_bytes(&self) -> usize {
            1024 * 1024
        }

        fn sector_size(&self) -> usize {
            96 * 1024
        }
    }

    struct MissingProgramProfile;

    impl NorProfile for MissingProgramProfile {
        fn name(&self) -> &'static str {
            "missing-program"
        }

        fn capacity_bytes(&self) -> usize {
            1024 * 1024
        }

        fn command_set(&self) -> NorCommandSet {
            let mut commands = NorCommandSet::amd_standard();
            commands.program = 0;
            commands
        }
    }

    struct FarUnlockProfile;

    impl NorProfile for FarUnlockProfile {
        fn name(&self) -> &'static str {
            "far-unlock"
        }

        fn capacity_bytes(&self) -> usize {
            128 * 1024
        }

        fn command_set(&self) -> NorCommandSet {
            let mut commands = NorCommandSet::amd_standard();
            commands.unlock_addr1 = 0x1_0555;
            commands
        }
    }

    struct HugeSectorProfile;

    impl NorProfile for HugeSectorProfile {
        fn name(&self) -> &'static str {
            "huge-sector"
        }

        fn capacity_bytes(&self) -> usize {
            16 * 1024 * 1024
        }

        fn sector_size(&self) -> usize {
            256 * 1024
        }
    }

    struct PartialGranuleProfile;

    impl NorProfile for PartialGranuleProfile {
        fn name(&self) -> &'static str {
            "partial-granule"
        }

        fn capacity_bytes(&self) -> usize {
            64 * 1024
        }

        fn sector_size(&self) -> usize {
            8 * 1024
        }

        fn page_size(&self) -> usize {
            256
        }
    }

    #[test]
    fn default_config_matches_contract() {
        let cfg = NorConfig::default();
        assert_eq!(cfg.max_toggle_polls, 2_000_000);
        assert!(cfg.pad_odd_length);
    }

    #[test]
    fn amd_command_set_codes() {
        let commands = NorCommandSet::amd_standard();
        assert_eq!(commands.unlock_addr1, 0x555);
        assert_eq!(commands.unlock_addr2, 0x2AA);
        assert_eq!((commands.unlock_data1, commands.unlock_data2), (0xAA, 0x55));
        assert_eq!(commands.erase_setup, 0x80);
        assert_eq!(commands.chip_erase, 0x10);
        assert_eq!(commands.sector_erase, 0x30);
        assert_eq!(commands.program, 0xA0);
        assert_eq!(commands.reset, 0xF0);
    }

    #[test]
    fn builtin_profiles_resolve_by_name() {
        assert_eq!(
            BuiltInProfile::from_name("S29GL256P"),
            Some(BuiltInProfile::S29GL256P)
        );
        assert_eq!(
            BuiltInProfile::from_name("m29w128g"),
            Some(BuiltInProfile::M29W128G)
        );
        assert_eq!(BuiltInProfile::from_name("w25q128"), None);
    }

    #[test]
    fn validate_accepts_builtin_profiles() {
        let cfg = NorConfig::default();
        for builtin in BuiltInProfile::ALL {
            let resolved = validate_and_resolve(builtin.profile(), &cfg).unwrap();
            assert_eq!(resolved.sector_size, 128 * 1024);
            assert_eq!(resolved.page_size, 1024);
            assert_eq!(resolved.address_shift, 1);
        }
    }

    #[test]
    fn validate_rejects_zero_poll_cap() {
        let profile = resolve_builtin_profile(BuiltInProfile::S29GL128P);
        let mut cfg = NorConfig::default();
        cfg.max_toggle_polls = 0;

        assert_eq!(
            validate_and_resolve(profile, &cfg).err(),
            Some(Error::InvalidConfiguration)
        );
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        static ODD: OddSectorProfile = OddSectorProfile;
        static FAR: FarUnlockProfile = FarUnlockProfile;
        let cfg = NorConfig::default();

        assert_eq!(
            validate_and_resolve(&ODD, &cfg).err(),
            Some(Error::InvalidConfiguration)
        );
        // Unlock word 0x10555 lands past the end of a 128 KiB part.
        assert_eq!(
            validate_and_resolve(&FAR, &cfg).err(),
            Some(Error::InvalidConfiguration)
        );
    }

    #[test]
    fn validate_requires_geometry_to_tile_erase_granule() {
        static HUGE: HugeSectorProfile = HugeSectorProfile;
        static PARTIAL: PartialGranuleProfile = PartialGranuleProfile;
        let cfg = NorConfig::default();

        assert_eq!(
            validate_and_resolve(&HUGE, &cfg).err(),
            Some(Error::InvalidConfiguration)
        );
        assert_eq!(
            validate_and_resolve(&PARTIAL, &cfg).err(),
            Some(Error::InvalidConfiguration)
        );
    }

    #[test]
    fn validate_rejects_missing_command() {
        static PROFILE: MissingProgramProfile = MissingProgramProfile;
        assert_eq!(
            validate_and_resolve(&PROFILE, &NorConfig::default()).err(),
            Some(Error::InvalidConfiguration)
        );
    }
}
