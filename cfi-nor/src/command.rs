//! Unlock/command cycles of the AMD command-set interface.
//!
//! Every cycle is a single halfword write followed by a barrier; the device latches
//! the command state machine on each write, so no write may be reordered with the
//! next write or with the status read that follows the sequence.

use crate::bus::NorBus;
use crate::profile::NorCommandSet;

#[derive(Clone, Copy)]
pub(crate) struct CommandSequencer {
    base: u32,
    address_shift: u8,
    commands: NorCommandSet,
}

impl CommandSequencer {
    pub(crate) const fn new(base: u32, address_shift: u8, commands: NorCommandSet) -> Self {
        Self {
            base,
            address_shift,
            commands,
        }
    }

    #[inline(always)]
    pub(crate) const fn commands(&self) -> &NorCommandSet {
        &self.commands
    }

    /// Bus address of a command cycle given in device word units.
    #[inline(always)]
    pub(crate) const fn command_address(&self, word: u32) -> u32 {
        self.base.wrapping_add(word << self.address_shift)
    }

    #[inline(always)]
    fn write<B: NorBus>(bus: &mut B, addr: u32, value: u16) {
        bus.write16(addr, value);
        bus.barrier();
    }

    fn unlock<B: NorBus>(&self, bus: &mut B) {
        Self::write(
            bus,
            self.command_address(self.commands.unlock_addr1),
            self.commands.unlock_data1,
        );
        Self::write(
            bus,
            self.command_address(self.commands.unlock_addr2),
            self.commands.unlock_data2,
        );
    }

    fn unlock_command<B: NorBus>(&self, bus: &mut B, cmd: u16) {
        self.unlock(bus);
        Self::write(bus, self.command_address(self.commands.unlock_addr1), cmd);
    }

    pub(crate) fn chip_erase<B: NorBus>(&self, bus: &mut B) {
        self.unlock_command(bus, self.commands.erase_setup);
        self.unlock_command(bus, self.commands.chip_erase);
    }

    pub(crate) fn sector_erase<B: NorBus>(&self, bus: &mut B, sector_addr: u32) {
        self.unlock_command(bus, self.commands.erase_setup);
        self.unlock(bus);
        Self::write(bus, sector_addr, self.commands.sector_erase);
    }

    /// The data cycle goes to `addr` itself, not through the address shift.
    pub(crate) fn program<B: NorBus>(&self, bus: &mut B, addr: u32, value: u16) {
        self.unlock_command(bus, self.commands.program);
        Self::write(bus, addr, value);
    }

    pub(crate) fn autoselect<B: NorBus>(&self, bus: &mut B) {
        self.unlock_command(bus, self.commands.autoselect);
    }

    pub(crate) fn reset<B: NorBus>(&self, bus: &mut B, addr: u32) {
        Self::write(bus, addr, self.commands.reset);
    }
}
