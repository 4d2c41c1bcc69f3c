//! Erase and program algorithm for memory-mapped parallel NOR flash speaking the
//! AMD/Fujitsu command set.

#![no_std]

#[cfg(any(test, feature = "mock"))]
extern crate std;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod bus;
mod command;
mod detect;
mod flash;
pub mod flash_os;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod platform;
mod poll;
mod profile;
mod types;

pub use bus::{MmioBus, NorBus};
pub use detect::{DetectedNorInfo, NorId};
pub use flash::NorFlash;
pub use platform::{Platform, Preconfigured};
pub use poll::{PollOutcome, PollState, TogglePoller};
pub use profile::{
    BuiltInProfile, NorCommandSet, NorConfig, NorProfile, ProfileSource,
    DEFAULT_MAX_TOGGLE_POLLS, DEFAULT_PAGE_BYTES, UNIFORM_SECTOR_BYTES, X16_ADDRESS_SHIFT,
};
pub use types::{Error, Function};
