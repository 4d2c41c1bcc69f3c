use embedded_storage::nor_flash::{ErrorType, NorFlash as EmbeddedNorFlash, ReadNorFlash};

use crate::bus::NorBus;
use crate::command::CommandSequencer;
use crate::detect::{self, DetectedNorInfo, NorId};
use crate::platform::Platform;
use crate::poll::wait_for_completion;
use crate::profile::{
    self, NorCommandSet, NorConfig, NorProfile, ProfileSource, ResolvedProfile,
    UNIFORM_SECTOR_BYTES,
};
use crate::types::{Error, Function};

/// One programming session on a NOR device mapped at a fixed base address.
///
/// Every operation blocks until the device reports completion. The session owns
/// the bus, so nothing else in the program can reach the device between `init`
/// and `uninit`.
pub struct NorFlash<B: NorBus> {
    bus: B,
    base: u32,
    profile: ResolvedProfile,
    config: NorConfig,
    seq: CommandSequencer,
    function: Function,
    detected: Option<DetectedNorInfo>,
}

impl<B: NorBus> NorFlash<B> {
    /// Brings up the memory controller through `platform` and opens a session on
    /// the device at `base_address`.
    pub fn init<P: Platform>(
        bus: B,
        platform: &mut P,
        base_address: u32,
        clock_hz: u32,
        function: Function,
        profile: ProfileSource,
        config: NorConfig,
    ) -> Result<Self, Error> {
        let profile = profile::resolve_profile_source(profile);
        let resolved = profile::validate_and_resolve(profile, &config)?;
        Self::bring_up(platform, clock_hz, function)?;
        Self::from_parts(bus, base_address, resolved, config, function, None)
    }

    /// Like [`NorFlash::init`], but picks the profile from the device's autoselect id.
    pub fn init_auto<P: Platform>(
        mut bus: B,
        platform: &mut P,
        base_address: u32,
        clock_hz: u32,
        function: Function,
        config: NorConfig,
    ) -> Result<Self, Error> {
        if config.max_toggle_polls == 0 {
            return Err(Error::InvalidConfiguration);
        }
        Self::bring_up(platform, clock_hz, function)?;

        let autoselect = CommandSequencer::new(
            base_address,
            profile::X16_ADDRESS_SHIFT,
            NorCommandSet::amd_standard(),
        );
        let id = detect::read_id(&mut bus, &autoselect);
        let (profile, detected) = detect::detect_profile(id)?;
        let resolved = profile::validate_and_resolve(profile, &config)?;
        Self::from_parts(bus, base_address, resolved, config, function, Some(detected))
    }

    fn bring_up<P: Platform>(
        platform: &mut P,
        clock_hz: u32,
        function: Function,
    ) -> Result<(), Error> {
        platform.bring_up(clock_hz, function).map_err(|_| {
            error!("nor: memory controller bring-up failed");
            Error::ControllerInit
        })
    }

    fn from_parts(
        bus: B,
        base: u32,
        profile: ResolvedProfile,
        config: NorConfig,
        function: Function,
        detected: Option<DetectedNorInfo>,
    ) -> Result<Self, Error> {
        // The whole device window must be addressable.
        base.checked_add(profile.capacity_bytes as u32 - 1)
            .ok_or(Error::OutOfBounds)?;
        if base & 1 != 0 {
            return Err(Error::NotAligned);
        }

        debug!(
            "nor: {:?} session on {} at {:#x}",
            function,
            profile.profile.name(),
            base
        );

        Ok(Self {
            seq: CommandSequencer::new(base, profile.address_shift, profile.commands),
            bus,
            base,
            profile,
            config,
            function,
            detected,
        })
    }

    /// Closes the session and hands the bus back. Never fails.
    pub fn uninit(self, function: Function) -> Result<B, Error> {
        debug!("nor: uninit ({:?}), opened for {:?}", function, self.function);
        Ok(self.bus)
    }

    pub fn base_address(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.profile.capacity_bytes
    }

    pub fn sector_size(&self) -> usize {
        self.profile.sector_size
    }

    pub fn page_size(&self) -> usize {
        self.profile.page_size
    }

    pub fn function(&self) -> Function {
        self.function
    }

    pub fn profile(&self) -> &'static dyn NorProfile {
        self.profile.profile
    }

    pub fn detected_info(&self) -> Option<DetectedNorInfo> {
        self.detected
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn read_id(&mut self) -> NorId {
        detect::read_id(&mut self.bus, &self.seq)
    }

    /// Returns the device to read-array mode.
    pub fn reset(&mut self) {
        self.seq.reset(&mut self.bus, self.base);
    }

    pub fn erase_chip(&mut self) -> Result<(), Error> {
        debug!("nor: chip erase");
        self.seq.chip_erase(&mut self.bus);
        self.wait(self.base)
    }

    /// Erases the sector starting at absolute address `sector_address`.
    pub fn erase_sector(&mut self, sector_address: u32) -> Result<(), Error> {
        let offset = self.ensure_range(sector_address, self.profile.sector_size)?;
        if offset % self.profile.sector_size != 0 {
            return Err(Error::NotAligned);
        }

        trace!("nor: erase sector {:#x}", sector_address);
        self.seq.sector_erase(&mut self.bus, sector_address);
        self.wait(sector_address)
    }

    /// Programs `data` at absolute address `address`, one halfword at a time.
    ///
    /// Stops at the first halfword the device fails to program; earlier halfwords
    /// stay programmed. A trailing odd byte is padded with `0xFF` when
    /// `NorConfig::pad_odd_length` is set.
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        if address & 1 != 0 || (data.len() & 1 != 0 && !self.config.pad_odd_length) {
            return Err(Error::NotAligned);
        }
        self.ensure_range(address, data.len().next_multiple_of(2))?;

        trace!("nor: program {} bytes at {:#x}", data.len(), address);
        let mut addr = address;
        for chunk in data.chunks(2) {
            let halfword = u16::from_le_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0xFF)]);
            self.seq.program(&mut self.bus, addr, halfword);
            self.wait(addr)?;
            addr += 2;
        }
        Ok(())
    }

    /// Reads array data starting at absolute address `address`.
    pub fn read(&mut self, address: u32, out: &mut [u8]) -> Result<(), Error> {
        if out.is_empty() {
            return Ok(());
        }
        self.ensure_range(address, out.len())?;

        let mut cached: Option<(u32, u16)> = None;
        for (i, byte) in out.iter_mut().enumerate() {
            let addr = address + i as u32;
            let aligned = addr & !1;
            let word = match cached {
                Some((at, word)) if at == aligned => word,
                _ => {
                    let word = self.bus.read16(aligned);
                    cached = Some((aligned, word));
                    word
                }
            };
            *byte = word.to_le_bytes()[(addr & 1) as usize];
        }
        Ok(())
    }

    /// Compares the device contents at `address` with `data`.
    pub fn verify(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.ensure_range(address, data.len())?;

        let mut buf = [0u8; 64];
        let mut done = 0usize;
        while done < data.len() {
            let step = buf.len().min(data.len() - done);
            let at = address + done as u32;
            self.read(at, &mut buf[..step])?;
            if let Some(i) = buf[..step]
                .iter()
                .zip(&data[done..done + step])
                .position(|(got, want)| got != want)
            {
                let address = at + i as u32;
                debug!("nor: verify mismatch at {:#x}", address);
                return Err(Error::VerifyMismatch { address });
            }
            done += step;
        }
        Ok(())
    }

    /// `true` when every byte in the range equals `pattern`.
    pub fn blank_check(&mut self, address: u32, len: usize, pattern: u8) -> Result<bool, Error> {
        self.ensure_range(address, len)?;

        let mut buf = [0u8; 64];
        let mut done = 0usize;
        while done < len {
            let step = buf.len().min(len - done);
            self.read(address + done as u32, &mut buf[..step])?;
            if buf[..step].iter().any(|b| *b != pattern) {
                return Ok(false);
            }
            done += step;
        }
        Ok(true)
    }

    /// Erases `[from, to)` given as offsets from the base address. Uses a chip
    /// erase when the range covers the whole device.
    pub fn erase(&mut self, from: u32, to: u32) -> Result<(), Error> {
        if from == to {
            return Ok(());
        }
        self.ensure_erase_bounds(from, to)?;

        if from == 0 && to as usize == self.profile.capacity_bytes {
            return self.erase_chip();
        }

        let mut offset = from;
        while offset < to {
            self.erase_sector(self.base + offset)?;
            offset += self.profile.sector_size as u32;
        }
        Ok(())
    }

    /// Programs `data` at `offset` from the base address, split into pages.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let address = self.base.checked_add(offset).ok_or(Error::OutOfBounds)?;
        self.ensure_range(address, data.len())?;

        let mut done = 0usize;
        while done < data.len() {
            let addr = address as usize + done;
            let page_remaining = self.profile.page_size - (addr % self.profile.page_size);
            let step = page_remaining.min(data.len() - done);
            self.program_page(addr as u32, &data[done..done + step])?;
            done += step;
        }
        Ok(())
    }

    #[inline(always)]
    fn wait(&mut self, addr: u32) -> Result<(), Error> {
        let reset = self.seq.commands().reset;
        wait_for_completion(&mut self.bus, addr, reset, self.config.max_toggle_polls)
    }

    /// Offset of `address` from the base once `[address, address + len)` is
    /// known to lie inside the device.
    fn ensure_range(&self, address: u32, len: usize) -> Result<usize, Error> {
        let offset = address.checked_sub(self.base).ok_or(Error::OutOfBounds)? as usize;
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds)?;
        if end > self.profile.capacity_bytes {
            return Err(Error::OutOfBounds);
        }
        Ok(offset)
    }

    fn ensure_erase_bounds(&self, from: u32, to: u32) -> Result<(), Error> {
        if to < from {
            return Err(Error::OutOfBounds);
        }
        let sector = self.profile.sector_size as u32;
        if from % sector != 0 || to % sector != 0 {
            return Err(Error::NotAligned);
        }
        if to as usize > self.profile.capacity_bytes {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }
}

impl<B: NorBus> ErrorType for NorFlash<B> {
    type Error = Error;
}

impl<B: NorBus> ReadNorFlash for NorFlash<B> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let address = self.base.checked_add(offset).ok_or(Error::OutOfBounds)?;
        NorFlash::read(self, address, bytes)
    }

    fn capacity(&self) -> usize {
        self.profile.capacity_bytes
    }
}

impl<B: NorBus> EmbeddedNorFlash for NorFlash<B> {
    const WRITE_SIZE: usize = 2;
    /// Profiles are validated so that their sectors tile this granule.
    const ERASE_SIZE: usize = UNIFORM_SECTOR_BYTES;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        NorFlash::erase(self, from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        NorFlash::write(self, offset, bytes)
    }
}
