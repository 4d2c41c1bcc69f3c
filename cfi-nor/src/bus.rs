//! Halfword access to the memory window the NOR device is mapped into.

/// Capability the command sequencer and the completion poller run on.
///
/// Addresses are absolute bus addresses. Implementations must not reorder or merge
/// accesses; `barrier` must not return before every preceding write is observable
/// by the device.
pub trait NorBus {
    fn read16(&mut self, addr: u32) -> u16;
    fn write16(&mut self, addr: u32, value: u16);
    fn barrier(&mut self);
}

impl<B: NorBus + ?Sized> NorBus for &mut B {
    #[inline(always)]
    fn read16(&mut self, addr: u32) -> u16 {
        (**self).read16(addr)
    }

    #[inline(always)]
    fn write16(&mut self, addr: u32, value: u16) {
        (**self).write16(addr, value)
    }

    #[inline(always)]
    fn barrier(&mut self) {
        (**self).barrier()
    }
}

/// Volatile access to the external memory controller window.
pub struct MmioBus {
    _private: (),
}

impl MmioBus {
    /// # Safety
    ///
    /// Every address later passed to this bus must lie inside a window the memory
    /// controller maps to the NOR device, and nothing else may access that window
    /// while the bus is alive.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl NorBus for MmioBus {
    #[inline(always)]
    fn read16(&mut self, addr: u32) -> u16 {
        // SAFETY: `MmioBus::new` contract.
        unsafe { core::ptr::read_volatile(addr as usize as *const u16) }
    }

    #[inline(always)]
    fn write16(&mut self, addr: u32, value: u16) {
        // SAFETY: `MmioBus::new` contract.
        unsafe { core::ptr::write_volatile(addr as usize as *mut u16, value) }
    }

    #[inline(always)]
    fn barrier(&mut self) {
        #[cfg(target_arch = "arm")]
        cortex_m::asm::dsb();
        #[cfg(not(target_arch = "arm"))]
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
