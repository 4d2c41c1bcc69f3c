//! Board bring-up hook invoked once per session.

use crate::types::Function;

/// Clock, pin and memory-controller setup that maps the NOR device into the
/// address space. Supplied by the board, called by `NorFlash::init`.
pub trait Platform {
    type Error;

    fn bring_up(&mut self, clock_hz: u32, function: Function) -> Result<(), Self::Error>;
}

/// For controllers already configured by a bootloader or a debugger script.
#[derive(Clone, Copy, Debug, Default)]
pub struct Preconfigured;

impl Platform for Preconfigured {
    type Error = core::convert::Infallible;

    fn bring_up(&mut self, _clock_hz: u32, _function: Function) -> Result<(), Self::Error> {
        Ok(())
    }
}
