//! Flash loader image: the debugger copies it to RAM and calls the exported
//! `Init`/`EraseSector`/`ProgramPage`/... entry points directly.

#![no_std]
#![no_main]

use cfi_nor::{BuiltInProfile, MmioBus, NorConfig, ProfileSource};
use cortex_m_rt::entry;
use defmt_rtt as _;
use panic_probe as _;

use stm32_fmc_nor::board::FmcNorBank1;

cfi_nor::flash_os_entry! {
    // SAFETY: FMC bank 1 maps the NOR device; the loader is the only bus master.
    bus: MmioBus => unsafe { MmioBus::new() },
    platform: FmcNorBank1::default(),
    profile: ProfileSource::BuiltIn(BuiltInProfile::S29GL128P),
    config: NorConfig::default(),
}

// Never run by the debugger, which enters through the exported functions.
#[entry]
fn main() -> ! {
    loop {
        cortex_m::asm::bkpt();
    }
}
