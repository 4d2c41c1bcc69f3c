//! Software models of the NOR bus.
//!
//! [`MockNor`] behaves like an AMD command-set device on a 16-bit bus: it decodes
//! unlock/command cycles, runs erase and program "algorithms" that toggle DQ6 for
//! a configurable number of reads, and can be told to fail in the ways real parts
//! fail. [`ScriptedBus`] replays a fixed sequence of status values, for driving
//! the poller through exact read patterns.
//!
//! Both record every write and flag accesses that follow a write without an
//! intervening barrier.

use std::vec::Vec;

use crate::bus::NorBus;
use crate::detect::NorId;
use crate::poll::{DQ5_TIMEOUT, DQ6_TOGGLE};
use crate::profile::NorCommandSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BusWrite {
    pub addr: u32,
    pub value: u16,
}

#[derive(Default)]
struct FenceTracker {
    pending: bool,
    barriers: u32,
    violations: u32,
}

impl FenceTracker {
    fn access(&mut self) {
        if self.pending {
            self.violations += 1;
            self.pending = false;
        }
    }

    fn write(&mut self) {
        self.access();
        self.pending = true;
    }

    fn barrier(&mut self) {
        self.pending = false;
        self.barriers += 1;
    }
}

pub struct ScriptedBus {
    script: Vec<u16>,
    alternate: Option<[u16; 2]>,
    reads: u32,
    writes: Vec<BusWrite>,
    fences: FenceTracker,
}

impl ScriptedBus {
    /// Reads return `script` in order, then keep repeating its last value
    /// (`0xFFFF` for an empty script).
    pub fn new(script: &[u16]) -> Self {
        Self {
            script: script.to_vec(),
            alternate: None,
            reads: 0,
            writes: Vec::new(),
            fences: FenceTracker::default(),
        }
    }

    /// Reads alternate between `first` and `second` forever.
    pub fn toggling(first: u16, second: u16) -> Self {
        let mut bus = Self::new(&[]);
        bus.alternate = Some([first, second]);
        bus
    }

    pub fn reads(&self) -> u32 {
        self.reads
    }

    pub fn writes(&self) -> &[BusWrite] {
        &self.writes
    }

    pub fn barriers(&self) -> u32 {
        self.fences.barriers
    }

    pub fn ordering_violations(&self) -> u32 {
        self.fences.violations
    }
}

impl NorBus for ScriptedBus {
    fn read16(&mut self, _addr: u32) -> u16 {
        self.fences.access();
        let index = self.reads as usize;
        self.reads += 1;
        if let Some(values) = self.alternate {
            return values[index % 2];
        }
        self.script
            .get(index)
            .or(self.script.last())
            .copied()
            .unwrap_or(0xFFFF)
    }

    fn write16(&mut self, addr: u32, value: u16) {
        self.fences.write();
        self.writes.push(BusWrite { addr, value });
    }

    fn barrier(&mut self) {
        self.fences.barrier();
    }
}

/// Misbehaviour applied to one embedded erase/program operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    /// DQ5 rises after `after` toggling reads and the operation never finishes.
    /// Array contents are left untouched.
    TimeoutStuck { after: u32 },
    /// DQ5 rises on the last toggling read; the operation still completes.
    TimeoutRace,
    /// DQ6 toggles forever and DQ5 never rises.
    Hang,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    ChipErase,
    SectorErase { addr: u32 },
    Program { addr: u32, value: u16 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CommandState {
    ReadArray,
    Unlocked1,
    Unlocked2,
    EraseSetup,
    EraseUnlocked1,
    EraseUnlocked2,
    ProgramSetup,
    Autoselect,
}

#[derive(Clone, Copy)]
struct Embedded {
    busy_reads: u32,
    toggling_reads: u32,
    toggle: bool,
    dq5: bool,
    fault: Option<Fault>,
}

pub struct MockNor {
    base: u32,
    capacity: usize,
    sector_size: usize,
    address_shift: u8,
    commands: NorCommandSet,
    id: NorId,
    mem: Vec<u16>,
    state: CommandState,
    busy: Option<Embedded>,
    faults: Vec<(Option<u32>, Fault)>,
    program_busy_reads: u32,
    erase_busy_reads: u32,
    reads: u32,
    writes: Vec<BusWrite>,
    fences: FenceTracker,
    operations: Vec<Operation>,
    resets_while_busy: u32,
}

impl MockNor {
    pub const DEFAULT_ID: NorId = NorId {
        manufacturer: NorId::SPANSION,
        device: [0x227E, 0x2221, 0x2201],
    };

    /// An erased x16 device of `capacity` bytes mapped at `base`.
    pub fn new(base: u32, capacity: usize, sector_size: usize) -> Self {
        Self {
            base,
            capacity,
            sector_size,
            address_shift: 1,
            commands: NorCommandSet::amd_standard(),
            id: Self::DEFAULT_ID,
            mem: std::vec![0xFFFF; capacity / 2],
            state: CommandState::ReadArray,
            busy: None,
            faults: Vec::new(),
            program_busy_reads: 2,
            erase_busy_reads: 8,
            reads: 0,
            writes: Vec::new(),
            fences: FenceTracker::default(),
            operations: Vec::new(),
            resets_while_busy: 0,
        }
    }

    pub fn with_id(mut self, id: NorId) -> Self {
        self.id = id;
        self
    }

    pub fn with_address_shift(mut self, address_shift: u8) -> Self {
        self.address_shift = address_shift;
        self
    }

    /// Number of toggling status reads before a program or erase completes.
    pub fn with_busy_reads(mut self, program: u32, erase: u32) -> Self {
        self.program_busy_reads = program;
        self.erase_busy_reads = erase;
        self
    }

    /// Applies `fault` to the next embedded operation.
    pub fn inject_fault(&mut self, fault: Fault) {
        self.faults.push((None, fault));
    }

    /// Applies `fault` to the next operation started at `addr`.
    pub fn inject_fault_at(&mut self, addr: u32, fault: Fault) {
        self.faults.push((Some(addr), fault));
    }

    /// Writes raw bytes into the array, bypassing the command interface.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let a = addr + i as u32;
            if let Some(index) = self.index(a) {
                let word = &mut self.mem[index];
                *word = if a & 1 == 0 {
                    (*word & 0xFF00) | *byte as u16
                } else {
                    (*word & 0x00FF) | (*byte as u16) << 8
                };
            }
        }
    }

    /// Array word at `addr`, without touching the command state machine.
    pub fn peek(&self, addr: u32) -> u16 {
        self.index(addr).map_or(0xFFFF, |index| self.mem[index])
    }

    pub fn contents(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| {
                let a = addr + i;
                let word = self.peek(a & !1);
                if a & 1 == 0 {
                    word as u8
                } else {
                    (word >> 8) as u8
                }
            })
            .collect()
    }

    pub fn is_erased(&self, addr: u32, len: usize) -> bool {
        (0..len as u32)
            .step_by(2)
            .all(|i| self.peek(addr + i) == 0xFFFF)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_some()
    }

    pub fn reads(&self) -> u32 {
        self.reads
    }

    pub fn writes(&self) -> &[BusWrite] {
        &self.writes
    }

    pub fn barriers(&self) -> u32 {
        self.fences.barriers
    }

    pub fn ordering_violations(&self) -> u32 {
        self.fences.violations
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn resets_while_busy(&self) -> u32 {
        self.resets_while_busy
    }

    pub fn clear_log(&mut self) {
        self.reads = 0;
        self.writes.clear();
        self.operations.clear();
    }

    fn index(&self, addr: u32) -> Option<usize> {
        let offset = addr.checked_sub(self.base)? as usize;
        (offset < self.capacity).then_some(offset >> 1)
    }

    fn is_command_address(&self, addr: u32, word: u32) -> bool {
        addr == self.base.wrapping_add(word << self.address_shift)
    }

    fn take_fault(&mut self, addr: u32) -> Option<Fault> {
        let position = self
            .faults
            .iter()
            .position(|(target, _)| target.map_or(true, |target| target == addr))?;
        Some(self.faults.remove(position).1)
    }

    fn begin(&mut self, op: Operation, addr: u32, busy_reads: u32) {
        let fault = self.take_fault(addr);
        let completes = !matches!(
            fault,
            Some(Fault::TimeoutStuck { .. }) | Some(Fault::Hang)
        );

        if completes {
            match op {
                Operation::ChipErase => self.mem.fill(0xFFFF),
                Operation::SectorErase { addr } => {
                    if let Some(index) = self.index(addr) {
                        let words = self.sector_size / 2;
                        let start = index / words * words;
                        let end = (start + words).min(self.mem.len());
                        self.mem[start..end].fill(0xFFFF);
                    }
                }
                Operation::Program { addr, value } => {
                    if let Some(index) = self.index(addr) {
                        self.mem[index] &= value;
                    }
                }
            }
        }

        self.operations.push(op);
        self.state = CommandState::ReadArray;
        self.busy = Some(Embedded {
            busy_reads: busy_reads.max(1),
            toggling_reads: 0,
            toggle: false,
            dq5: false,
            fault,
        });
    }

    fn status_read(&mut self, addr: u32, mut op: Embedded) -> u16 {
        let finished = match op.fault {
            None | Some(Fault::TimeoutRace) => op.toggling_reads >= op.busy_reads,
            Some(Fault::TimeoutStuck { .. }) | Some(Fault::Hang) => false,
        };
        if finished {
            self.busy = None;
            return self.peek(addr);
        }

        op.toggling_reads += 1;
        op.toggle = !op.toggle;
        match op.fault {
            Some(Fault::TimeoutStuck { after }) if op.toggling_reads > after => op.dq5 = true,
            Some(Fault::TimeoutRace) if op.toggling_reads == op.busy_reads => op.dq5 = true,
            _ => {}
        }
        self.busy = Some(op);

        let mut status = 0;
        if op.toggle {
            status |= DQ6_TOGGLE;
        }
        if op.dq5 {
            status |= DQ5_TIMEOUT;
        }
        status
    }

    fn autoselect_read(&self, addr: u32) -> u16 {
        let word = (addr.wrapping_sub(self.base) >> self.address_shift) & 0xFF;
        match word {
            0x00 => self.id.manufacturer,
            0x01 => self.id.device[0],
            0x0E => self.id.device[1],
            0x0F => self.id.device[2],
            _ => 0,
        }
    }

    fn command_write(&mut self, addr: u32, value: u16) {
        let c = self.commands;

        if self.state == CommandState::ProgramSetup {
            self.begin(
                Operation::Program { addr, value },
                addr,
                self.program_busy_reads,
            );
            return;
        }
        if value == c.reset {
            self.state = CommandState::ReadArray;
            return;
        }

        self.state = match self.state {
            CommandState::ReadArray | CommandState::Autoselect
                if value == c.unlock_data1 && self.is_command_address(addr, c.unlock_addr1) =>
            {
                CommandState::Unlocked1
            }
            CommandState::ReadArray | CommandState::Autoselect => self.state,
            CommandState::Unlocked1
                if value == c.unlock_data2 && self.is_command_address(addr, c.unlock_addr2) =>
            {
                CommandState::Unlocked2
            }
            CommandState::Unlocked2 if self.is_command_address(addr, c.unlock_addr1) => {
                if value == c.erase_setup {
                    CommandState::EraseSetup
                } else if value == c.program {
                    CommandState::ProgramSetup
                } else if value == c.autoselect {
                    CommandState::Autoselect
                } else {
                    CommandState::ReadArray
                }
            }
            CommandState::EraseSetup
                if value == c.unlock_data1 && self.is_command_address(addr, c.unlock_addr1) =>
            {
                CommandState::EraseUnlocked1
            }
            CommandState::EraseUnlocked1
                if value == c.unlock_data2 && self.is_command_address(addr, c.unlock_addr2) =>
            {
                CommandState::EraseUnlocked2
            }
            CommandState::EraseUnlocked2
                if value == c.chip_erase && self.is_command_address(addr, c.unlock_addr1) =>
            {
                self.begin(Operation::ChipErase, self.base, self.erase_busy_reads);
                return;
            }
            CommandState::EraseUnlocked2 if value == c.sector_erase => {
                self.begin(
                    Operation::SectorErase { addr },
                    addr,
                    self.erase_busy_reads,
                );
                return;
            }
            _ => CommandState::ReadArray,
        };
    }
}

impl NorBus for MockNor {
    fn read16(&mut self, addr: u32) -> u16 {
        self.fences.access();
        self.reads += 1;
        if let Some(op) = self.busy {
            return self.status_read(addr, op);
        }
        if self.state == CommandState::Autoselect {
            return self.autoselect_read(addr);
        }
        self.peek(addr)
    }

    fn write16(&mut self, addr: u32, value: u16) {
        self.fences.write();
        self.writes.push(BusWrite { addr, value });

        if self.busy.is_some() {
            // Only reset is decoded while an embedded operation runs.
            if value == self.commands.reset {
                self.busy = None;
                self.state = CommandState::ReadArray;
                self.resets_while_busy += 1;
            }
            return;
        }
        self.command_write(addr, value);
    }

    fn barrier(&mut self) {
        self.fences.barrier();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x6000_0000;

    fn unlock(nor: &mut MockNor, cmd: u16) {
        for (addr, value) in [(0xAAA, 0xAA), (0x554, 0x55), (0xAAA, cmd)] {
            nor.write16(BASE + addr, value);
            nor.barrier();
        }
    }

    #[test]
    fn program_toggles_then_returns_data() {
        let mut nor = MockNor::new(BASE, 64 * 1024, 8 * 1024).with_busy_reads(3, 3);
        unlock(&mut nor, 0xA0);
        nor.write16(BASE + 0x10, 0x1234);
        nor.barrier();

        let statuses: Vec<u16> = (0..3).map(|_| nor.read16(BASE + 0x10)).collect();
        assert_eq!(statuses, [DQ6_TOGGLE, 0, DQ6_TOGGLE]);
        assert_eq!(nor.read16(BASE + 0x10), 0x1234);
        assert!(!nor.is_busy());
        assert_eq!(nor.ordering_violations(), 0);
    }

    #[test]
    fn program_only_clears_bits() {
        let mut nor = MockNor::new(BASE, 64 * 1024, 8 * 1024).with_busy_reads(1, 1);
        nor.load(BASE, &[0x0F, 0xF0]);
        unlock(&mut nor, 0xA0);
        nor.write16(BASE, 0xFF00);
        nor.barrier();
        nor.read16(BASE);
        assert_eq!(nor.peek(BASE), 0xF000);
    }

    #[test]
    fn broken_unlock_falls_back_to_read_array() {
        let mut nor = MockNor::new(BASE, 64 * 1024, 8 * 1024);
        nor.write16(BASE + 0xAAA, 0xAA);
        nor.barrier();
        nor.write16(BASE + 0x100, 0x55);
        nor.barrier();
        nor.write16(BASE + 0xAAA, 0xA0);
        nor.barrier();
        nor.write16(BASE + 0x20, 0x0000);
        nor.barrier();

        assert!(nor.operations().is_empty());
        assert_eq!(nor.peek(BASE + 0x20), 0xFFFF);
    }

    #[test]
    fn missing_barrier_is_flagged() {
        let mut nor = MockNor::new(BASE, 64 * 1024, 8 * 1024);
        nor.write16(BASE + 0xAAA, 0xAA);
        nor.write16(BASE + 0x554, 0x55);
        assert_eq!(nor.ordering_violations(), 1);
    }

    #[test]
    fn reset_aborts_stuck_operation() {
        let mut nor = MockNor::new(BASE, 64 * 1024, 8 * 1024);
        nor.inject_fault(Fault::TimeoutStuck { after: 1 });
        unlock(&mut nor, 0xA0);
        nor.write16(BASE, 0x0000);
        nor.barrier();

        assert_eq!(nor.read16(BASE), DQ6_TOGGLE);
        assert_eq!(nor.read16(BASE), DQ5_TIMEOUT);
        nor.write16(BASE, 0xF0);
        nor.barrier();

        assert!(!nor.is_busy());
        assert_eq!(nor.resets_while_busy(), 1);
        assert_eq!(nor.read16(BASE), 0xFFFF);
    }

    #[test]
    fn sector_erase_clears_whole_sector_only() {
        let mut nor = MockNor::new(BASE, 64 * 1024, 8 * 1024).with_busy_reads(1, 1);
        nor.load(BASE + 0x2000, &[0u8; 0x2000]);
        nor.load(BASE + 0x4000, &[0u8; 4]);

        unlock(&mut nor, 0x80);
        nor.write16(BASE + 0xAAA, 0xAA);
        nor.barrier();
        nor.write16(BASE + 0x554, 0x55);
        nor.barrier();
        nor.write16(BASE + 0x2100, 0x30);
        nor.barrier();
        nor.read16(BASE + 0x2100);

        assert!(nor.is_erased(BASE + 0x2000, 0x2000));
        assert_eq!(nor.contents(BASE + 0x4000, 4), [0, 0, 0, 0]);
        assert_eq!(
            nor.operations(),
            [Operation::SectorErase { addr: BASE + 0x2100 }]
        );
    }
}
