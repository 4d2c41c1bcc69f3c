//! Loader entry points in the CMSIS FlashOS calling convention.
//!
//! A debugger loads the algorithm into RAM and calls plain `extern "C"`
//! functions, so the session lives in a single static slot between calls. The
//! helpers here translate `Result`s into the status words the debugger expects;
//! [`flash_os_entry!`](crate::flash_os_entry) generates the exported symbols.

use core::cell::UnsafeCell;

use crate::bus::NorBus;
use crate::flash::NorFlash;
use crate::platform::Platform;
use crate::profile::{NorConfig, ProfileSource};
use crate::types::{Error, Function};

pub const STATUS_OK: u32 = 0;
pub const STATUS_FAILED: u32 = 1;

#[inline]
pub fn status(result: Result<(), Error>) -> u32 {
    match result {
        Ok(()) => STATUS_OK,
        Err(_) => STATUS_FAILED,
    }
}

/// Static storage for the session of a loader image.
pub struct SessionSlot<S>(UnsafeCell<Option<S>>);

// The debugger drives the loader from a single halted core and never reenters it.
unsafe impl<S> Sync for SessionSlot<S> {}

impl<S> SessionSlot<S> {
    pub const fn new() -> Self {
        Self(UnsafeCell::new(None))
    }

    /// # Safety
    ///
    /// The caller must not hold another reference obtained from this slot.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut Option<S> {
        &mut *self.0.get()
    }
}

impl<S> Default for SessionSlot<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the page slice handed over by the debugger.
///
/// # Safety
///
/// `buf` must be null or point to `sz` readable bytes that stay valid for `'a`.
pub unsafe fn loader_slice<'a>(buf: *const u8, sz: u32) -> Option<&'a [u8]> {
    if sz == 0 {
        return Some(&[]);
    }
    if buf.is_null() {
        return None;
    }
    Some(core::slice::from_raw_parts(buf, sz as usize))
}

/// Opens a session and stores it in `slot`, replacing any previous one.
#[allow(clippy::too_many_arguments)]
pub fn init<B: NorBus, P: Platform>(
    slot: &mut Option<NorFlash<B>>,
    bus: B,
    platform: &mut P,
    adr: u32,
    clk: u32,
    fnc: u32,
    profile: ProfileSource,
    config: NorConfig,
) -> u32 {
    *slot = None;
    let Some(function) = Function::from_code(fnc) else {
        warn!("flash_os: unknown function code {}", fnc);
        return STATUS_FAILED;
    };

    match NorFlash::init(bus, platform, adr, clk, function, profile, config) {
        Ok(flash) => {
            *slot = Some(flash);
            STATUS_OK
        }
        Err(e) => {
            error!("flash_os: init failed: {:?}", e);
            STATUS_FAILED
        }
    }
}

/// Closes the session. Succeeds even when no session is open.
pub fn uninit<B: NorBus>(slot: &mut Option<NorFlash<B>>, fnc: u32) -> u32 {
    if let (Some(flash), Some(function)) = (slot.take(), Function::from_code(fnc)) {
        let _bus = flash.uninit(function);
    }
    STATUS_OK
}

pub fn erase_chip<B: NorBus>(slot: &mut Option<NorFlash<B>>) -> u32 {
    match slot {
        Some(flash) => status(flash.erase_chip()),
        None => STATUS_FAILED,
    }
}

pub fn erase_sector<B: NorBus>(slot: &mut Option<NorFlash<B>>, adr: u32) -> u32 {
    match slot {
        Some(flash) => status(flash.erase_sector(adr)),
        None => STATUS_FAILED,
    }
}

pub fn program_page<B: NorBus>(slot: &mut Option<NorFlash<B>>, adr: u32, data: &[u8]) -> u32 {
    match slot {
        Some(flash) => status(flash.program_page(adr, data)),
        None => STATUS_FAILED,
    }
}

/// `adr + data.len()` when the device matches `data`, otherwise the first
/// mismatching address. Any other failure reports `adr`.
pub fn verify<B: NorBus>(slot: &mut Option<NorFlash<B>>, adr: u32, data: &[u8]) -> u32 {
    let Some(flash) = slot else {
        return adr;
    };
    match flash.verify(adr, data) {
        Ok(()) => adr.wrapping_add(data.len() as u32),
        Err(Error::VerifyMismatch { address }) => address,
        Err(_) => adr,
    }
}

/// `STATUS_OK` when every byte in range equals `pat`.
pub fn blank_check<B: NorBus>(slot: &mut Option<NorFlash<B>>, adr: u32, sz: u32, pat: u8) -> u32 {
    match slot.as_mut().map(|flash| flash.blank_check(adr, sz as usize, pat)) {
        Some(Ok(true)) => STATUS_OK,
        _ => STATUS_FAILED,
    }
}

/// Exports `Init`, `UnInit`, `EraseChip`, `EraseSector`, `ProgramPage`, `Verify`
/// and `BlankCheck` for a loader image.
///
/// ```ignore
/// cfi_nor::flash_os_entry! {
///     bus: MmioBus => unsafe { MmioBus::new() },
///     platform: board::Fmc::new(),
///     profile: ProfileSource::BuiltIn(BuiltInProfile::S29GL128P),
///     config: NorConfig::default(),
/// }
/// ```
#[macro_export]
macro_rules! flash_os_entry {
    (
        bus: $bus_ty:ty => $bus:expr,
        platform: $platform:expr,
        profile: $profile:expr,
        config: $config:expr $(,)?
    ) => {
        static __CFI_NOR_SESSION: $crate::flash_os::SessionSlot<$crate::NorFlash<$bus_ty>> =
            $crate::flash_os::SessionSlot::new();

        #[no_mangle]
        #[allow(non_snake_case)]
        pub extern "C" fn Init(adr: u32, clk: u32, fnc: u32) -> u32 {
            let mut platform = $platform;
            $crate::flash_os::init(
                unsafe { __CFI_NOR_SESSION.get() },
                $bus,
                &mut platform,
                adr,
                clk,
                fnc,
                $profile,
                $config,
            )
        }

        #[no_mangle]
        #[allow(non_snake_case)]
        pub extern "C" fn UnInit(fnc: u32) -> u32 {
            $crate::flash_os::uninit(unsafe { __CFI_NOR_SESSION.get() }, fnc)
        }

        #[no_mangle]
        #[allow(non_snake_case)]
        pub extern "C" fn EraseChip() -> u32 {
            $crate::flash_os::erase_chip(unsafe { __CFI_NOR_SESSION.get() })
        }

        #[no_mangle]
        #[allow(non_snake_case)]
        pub extern "C" fn EraseSector(adr: u32) -> u32 {
            $crate::flash_os::erase_sector(unsafe { __CFI_NOR_SESSION.get() }, adr)
        }

        /// # Safety
        ///
        /// `buf` must point to `sz` readable bytes.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn ProgramPage(adr: u32, sz: u32, buf: *const u8) -> u32 {
            match $crate::flash_os::loader_slice(buf, sz) {
                Some(data) => {
                    $crate::flash_os::program_page(__CFI_NOR_SESSION.get(), adr, data)
                }
                None => $crate::flash_os::STATUS_FAILED,
            }
        }

        /// # Safety
        ///
        /// `buf` must point to `sz` readable bytes.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn Verify(adr: u32, sz: u32, buf: *const u8) -> u32 {
            match $crate::flash_os::loader_slice(buf, sz) {
                Some(data) => $crate::flash_os::verify(__CFI_NOR_SESSION.get(), adr, data),
                None => adr,
            }
        }

        #[no_mangle]
        #[allow(non_snake_case)]
        pub extern "C" fn BlankCheck(adr: u32, sz: u32, pat: u32) -> u32 {
            $crate::flash_os::blank_check(unsafe { __CFI_NOR_SESSION.get() }, adr, sz, pat as u8)
        }
    };
}
