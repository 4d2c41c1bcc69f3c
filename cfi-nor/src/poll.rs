//! Toggle-bit completion detection.
//!
//! While an embedded erase or program algorithm runs, every read of the device
//! returns status instead of array data and DQ6 flips on each read. Once the
//! algorithm ends, reads return array data and DQ6 stays put. DQ5 rises when the
//! device's internal timer expired.

use crate::bus::NorBus;
use crate::types::Error;

pub(crate) const DQ6_TOGGLE: u16 = 1 << 6;
pub(crate) const DQ5_TIMEOUT: u16 = 1 << 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollOutcome {
    Success,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollState {
    Polling { toggle: u16 },
    Done(PollOutcome),
}

pub struct TogglePoller {
    addr: u32,
    reset_cmd: u16,
    state: PollState,
    reads: u32,
}

impl TogglePoller {
    /// Takes the first status snapshot at `addr`.
    pub fn start<B: NorBus>(bus: &mut B, addr: u32, reset_cmd: u16) -> Self {
        let toggle = bus.read16(addr) & DQ6_TOGGLE;
        Self {
            addr,
            reset_cmd,
            state: PollState::Polling { toggle },
            reads: 1,
        }
    }

    pub const fn state(&self) -> PollState {
        self.state
    }

    pub const fn reads(&self) -> u32 {
        self.reads
    }

    #[inline(always)]
    fn read_toggle<B: NorBus>(&mut self, bus: &mut B) -> (u16, u16) {
        let status = bus.read16(self.addr);
        self.reads += 1;
        (status & DQ6_TOGGLE, status)
    }

    fn reset<B: NorBus>(&self, bus: &mut B) {
        bus.write16(self.addr, self.reset_cmd);
        bus.barrier();
    }

    /// One poll iteration. A no-op once the poller reached `Done`.
    pub fn step<B: NorBus>(&mut self, bus: &mut B) -> PollState {
        let PollState::Polling { toggle } = self.state else {
            return self.state;
        };

        let (now, status) = self.read_toggle(bus);
        self.state = if now == toggle {
            PollState::Done(PollOutcome::Success)
        } else if status & DQ5_TIMEOUT == 0 {
            PollState::Polling { toggle: now }
        } else {
            // DQ5 can rise in the same cycle the algorithm completes: one more
            // read decides whether DQ6 stopped at the value just seen.
            let (settled, _) = self.read_toggle(bus);
            if settled == now {
                PollState::Done(PollOutcome::Success)
            } else {
                self.reset(bus);
                PollState::Done(PollOutcome::Failed)
            }
        };
        self.state
    }

    /// Steps until done or until `max_polls` iterations passed without a verdict.
    pub fn run<B: NorBus>(&mut self, bus: &mut B, max_polls: u32) -> Result<(), Error> {
        for _ in 0..max_polls {
            match self.step(bus) {
                PollState::Polling { .. } => continue,
                PollState::Done(PollOutcome::Success) => return Ok(()),
                PollState::Done(PollOutcome::Failed) => {
                    warn!("nor: DQ5 timeout at {:#x}", self.addr);
                    return Err(Error::PollTimeout);
                }
            }
        }

        error!(
            "nor: no completion at {:#x} after {} status reads",
            self.addr, self.reads
        );
        self.reset(bus);
        Err(Error::DeviceUnresponsive)
    }
}

/// Blocks until the operation started at `addr` completes.
pub(crate) fn wait_for_completion<B: NorBus>(
    bus: &mut B,
    addr: u32,
    reset_cmd: u16,
    max_polls: u32,
) -> Result<(), Error> {
    TogglePoller::start(bus, addr, reset_cmd).run(bus, max_polls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BusWrite, ScriptedBus};

    const ADDR: u32 = 0x6000_0100;
    const RESET: u16 = 0xF0;
    const T: u16 = DQ6_TOGGLE;
    const E: u16 = DQ5_TIMEOUT;

    #[test]
    fn stops_after_k_plus_one_reads() {
        for k in 1..6u32 {
            // Reads 1..=k alternate DQ6; read k+1 repeats read k.
            let mut script = std::vec::Vec::new();
            for i in 0..k {
                script.push(if i % 2 == 0 { T } else { 0 });
            }
            script.push(*script.last().unwrap());

            let mut bus = ScriptedBus::new(&script);
            assert_eq!(wait_for_completion(&mut bus, ADDR, RESET, 100), Ok(()));
            assert_eq!(bus.reads(), k + 1);
            assert!(bus.writes().is_empty());
        }
    }

    #[test]
    fn already_idle_device_needs_two_reads() {
        let mut bus = ScriptedBus::new(&[0xFFFF, 0xFFFF]);
        let mut poller = TogglePoller::start(&mut bus, ADDR, RESET);
        assert_eq!(poller.state(), PollState::Polling { toggle: T });
        assert_eq!(
            poller.step(&mut bus),
            PollState::Done(PollOutcome::Success)
        );
        assert_eq!(poller.reads(), 2);
    }

    #[test]
    fn dq5_with_settled_toggle_is_success() {
        // Third read raises DQ5 while still toggling; the fourth keeps its DQ6.
        let mut bus = ScriptedBus::new(&[T, 0, T | E, T, 0]);
        assert_eq!(wait_for_completion(&mut bus, ADDR, RESET, 100), Ok(()));
        assert_eq!(bus.reads(), 4);
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn dq5_decision_compares_against_the_dq5_read() {
        // The two reads after DQ5 agree with each other but not with the DQ5 read.
        let mut bus = ScriptedBus::new(&[T, 0, T | E, 0, 0]);
        assert_eq!(
            wait_for_completion(&mut bus, ADDR, RESET, 100),
            Err(Error::PollTimeout)
        );
        assert_eq!(bus.reads(), 4);
        assert_eq!(
            bus.writes(),
            [BusWrite {
                addr: ADDR,
                value: RESET
            }]
        );
    }

    #[test]
    fn dq5_with_toggle_still_running_resets_and_fails() {
        let mut bus = ScriptedBus::new(&[T, 0, T | E, E]);
        let mut poller = TogglePoller::start(&mut bus, ADDR, RESET);
        assert_eq!(poller.step(&mut bus), PollState::Polling { toggle: 0 });
        assert_eq!(poller.step(&mut bus), PollState::Done(PollOutcome::Failed));
        // One extra read after the DQ5 read, then the reset.
        assert_eq!(poller.reads(), 4);
        assert_eq!(
            bus.writes(),
            [BusWrite {
                addr: ADDR,
                value: RESET
            }]
        );
        assert_eq!(bus.ordering_violations(), 0);
    }

    #[test]
    fn done_state_is_sticky() {
        let mut bus = ScriptedBus::new(&[T, T]);
        let mut poller = TogglePoller::start(&mut bus, ADDR, RESET);
        poller.step(&mut bus);
        let reads = poller.reads();
        assert_eq!(
            poller.step(&mut bus),
            PollState::Done(PollOutcome::Success)
        );
        assert_eq!(poller.reads(), reads);
    }

    #[test]
    fn endless_toggle_is_reported_as_unresponsive() {
        let mut bus = ScriptedBus::toggling(T, 0);
        assert_eq!(
            wait_for_completion(&mut bus, ADDR, RESET, 50),
            Err(Error::DeviceUnresponsive)
        );
        assert_eq!(bus.reads(), 51);
        assert_eq!(
            bus.writes(),
            [BusWrite {
                addr: ADDR,
                value: RESET
            }]
        );
    }
}
