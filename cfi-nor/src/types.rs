use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The platform could not configure the external memory controller.
    ControllerInit,
    /// DQ5 was raised while DQ6 kept toggling. The device was reset to read-array mode.
    PollTimeout,
    /// DQ6 never settled and DQ5 never rose within `NorConfig::max_toggle_polls`.
    DeviceUnresponsive,
    InvalidConfiguration,
    UnknownDeviceId,
    NotAligned,
    OutOfBounds,
    VerifyMismatch {
        address: u32,
    },
}

impl NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::NotAligned => NorFlashErrorKind::NotAligned,
            Self::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Self::ControllerInit
            | Self::PollTimeout
            | Self::DeviceUnresponsive
            | Self::InvalidConfiguration
            | Self::UnknownDeviceId
            | Self::VerifyMismatch { .. } => NorFlashErrorKind::Other,
        }
    }
}

impl From<NorFlashErrorKind> for Error {
    fn from(value: NorFlashErrorKind) -> Self {
        match value {
            NorFlashErrorKind::NotAligned => Self::NotAligned,
            NorFlashErrorKind::OutOfBounds => Self::OutOfBounds,
            _ => Self::InvalidConfiguration,
        }
    }
}

/// Operation a loader announces when it opens a programming session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Function {
    Erase,
    Program,
    Verify,
}

impl Function {
    pub const fn code(self) -> u32 {
        match self {
            Self::Erase => 1,
            Self::Program => 2,
            Self::Verify => 3,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Erase),
            2 => Some(Self::Program),
            3 => Some(Self::Verify),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_codes_match_loader_convention() {
        for function in [Function::Erase, Function::Program, Function::Verify] {
            assert_eq!(Function::from_code(function.code()), Some(function));
        }
        assert_eq!(Function::from_code(0), None);
        assert_eq!(Function::from_code(4), None);
    }

    #[test]
    fn error_kinds_map_to_embedded_storage() {
        assert_eq!(Error::NotAligned.kind(), NorFlashErrorKind::NotAligned);
        assert_eq!(Error::OutOfBounds.kind(), NorFlashErrorKind::OutOfBounds);
        assert_eq!(Error::PollTimeout.kind(), NorFlashErrorKind::Other);
        assert_eq!(
            Error::VerifyMismatch { address: 0x10 }.kind(),
            NorFlashErrorKind::Other
        );
    }
}
