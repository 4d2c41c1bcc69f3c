//! STM32F429 FMC bank 1 wired to a 16-bit NOR device on NE1.

use cfi_nor::{Function, Platform};
use stm32f4::stm32f429 as pac;

/// Window FMC bank 1 / NE1 maps the device into.
pub const NOR_BASE: u32 = 0x6000_0000;

/// HCLK out of reset (HSI), used when the debugger passes no clock.
const HSI_HZ: u32 = 16_000_000;

const GPIO_AF_FMC: u32 = 12;

/// MODER/OSPEEDR/AFRL/AFRH masks and values that put `pins` of one port on
/// the FMC alternate function at very high speed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct PortConfig {
    mode: (u32, u32),
    speed: (u32, u32),
    afrl: (u32, u32),
    afrh: (u32, u32),
}

impl PortConfig {
    const fn fmc(pins: u16) -> Self {
        let mut cfg = Self {
            mode: (0, 0),
            speed: (0, 0),
            afrl: (0, 0),
            afrh: (0, 0),
        };
        let mut pin = 0;
        while pin < 16 {
            if pins & (1 << pin) != 0 {
                let two = 0b11 << (pin * 2);
                cfg.mode = (cfg.mode.0 | two, cfg.mode.1 | (0b10 << (pin * 2)));
                cfg.speed = (cfg.speed.0 | two, cfg.speed.1 | two);
                let shift = (pin % 8) * 4;
                let af = (0xF << shift, GPIO_AF_FMC << shift);
                if pin < 8 {
                    cfg.afrl = (cfg.afrl.0 | af.0, cfg.afrl.1 | af.1);
                } else {
                    cfg.afrh = (cfg.afrh.0 | af.0, cfg.afrh.1 | af.1);
                }
            }
            pin += 1;
        }
        cfg
    }
}

// D0-D3, D13-D15, A16-A18, NOE, NWE, NE1
const PORT_D: PortConfig = PortConfig::fmc(0xFFB3);
// A19-A23, D4-D12
const PORT_E: PortConfig = PortConfig::fmc(0xFFFC);
// A0-A9
const PORT_F: PortConfig = PortConfig::fmc(0xF03F);
// A10-A15
const PORT_G: PortConfig = PortConfig::fmc(0x003F);

// PD0/PD1 and PD14/PD15 are AF12; PD2/PD3 keep their reset mode.
const _: () = assert!(PORT_D.mode.0 & 0xFF == 0x0F && PORT_D.mode.1 & 0xFF == 0x0A);
const _: () = assert!(PORT_D.afrl.1 == 0xC0CC_00CC && PORT_D.afrh.1 == 0xCCCC_CCCC);
const _: () = assert!(PORT_G.afrh.0 == 0 && PORT_G.speed.1 == 0x0FFF);

macro_rules! configure_port {
    ($port:expr, $cfg:expr) => {{
        let port = &$port;
        let cfg = $cfg;
        // SAFETY: the masks only touch pins owned by the FMC.
        port.ospeedr
            .modify(|r, w| unsafe { w.bits((r.bits() & !cfg.speed.0) | cfg.speed.1) });
        port.afrl
            .modify(|r, w| unsafe { w.bits((r.bits() & !cfg.afrl.0) | cfg.afrl.1) });
        port.afrh
            .modify(|r, w| unsafe { w.bits((r.bits() & !cfg.afrh.0) | cfg.afrh.1) });
        port.moder
            .modify(|r, w| unsafe { w.bits((r.bits() & !cfg.mode.0) | cfg.mode.1) });
    }};
}

/// Access timings of the attached part, in nanoseconds.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct NorTiming {
    pub address_setup_ns: u32,
    pub data_setup_ns: u32,
    pub bus_turnaround_ns: u32,
}

impl NorTiming {
    /// S29GL128P/M29W128G 70 ns speed grade.
    pub const SPEED_70NS: Self = Self {
        address_setup_ns: 10,
        data_setup_ns: 70,
        bus_turnaround_ns: 15,
    };
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, defmt::Format)]
pub enum BoardError {
    /// The requested timings do not fit the FMC timing register at this clock.
    TimingOutOfRange,
}

/// HCLK cycles covering `ns`, rounded up.
const fn cycles(ns: u32, clock_hz: u32) -> u32 {
    (ns as u64 * clock_hz as u64).div_ceil(1_000_000_000) as u32
}

/// BTR1 fields in mode 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq, defmt::Format)]
struct BankTiming {
    addset: u8,
    datast: u8,
    busturn: u8,
}

impl BankTiming {
    const fn new(timing: NorTiming, clock_hz: u32) -> Result<Self, BoardError> {
        let addset = cycles(timing.address_setup_ns, clock_hz);
        let datast = cycles(timing.data_setup_ns, clock_hz);
        let busturn = cycles(timing.bus_turnaround_ns, clock_hz);
        if addset > 0xF || datast > 0xFF || busturn > 0xF {
            return Err(BoardError::TimingOutOfRange);
        }
        Ok(Self {
            addset: if addset == 0 { 1 } else { addset as u8 },
            datast: if datast == 0 { 1 } else { datast as u8 },
            busturn: busturn as u8,
        })
    }
}

// 180 MHz: 2/13/3 cycles. The HSI clock rounds everything up to one cycle.
const _: () = assert!(matches!(
    BankTiming::new(NorTiming::SPEED_70NS, 180_000_000),
    Ok(BankTiming { addset: 2, datast: 13, busturn: 3 })
));
const _: () = assert!(matches!(
    BankTiming::new(NorTiming::SPEED_70NS, HSI_HZ),
    Ok(BankTiming { addset: 1, datast: 2, busturn: 1 })
));
const _: () = assert!(matches!(
    BankTiming::new(
        NorTiming { address_setup_ns: 100, data_setup_ns: 70, bus_turnaround_ns: 0 },
        180_000_000
    ),
    Err(BoardError::TimingOutOfRange)
));

pub struct FmcNorBank1 {
    timing: NorTiming,
}

impl FmcNorBank1 {
    pub const fn new(timing: NorTiming) -> Self {
        Self { timing }
    }
}

impl Default for FmcNorBank1 {
    fn default() -> Self {
        Self::new(NorTiming::SPEED_70NS)
    }
}

impl Platform for FmcNorBank1 {
    type Error = BoardError;

    fn bring_up(&mut self, clock_hz: u32, function: Function) -> Result<(), BoardError> {
        let clock_hz = if clock_hz == 0 { HSI_HZ } else { clock_hz };
        let bank = BankTiming::new(self.timing, clock_hz)?;
        defmt::debug!("fmc: {} Hz, {} for {}", clock_hz, bank, function);

        // SAFETY: the loader runs alone on the core and never takes the
        // peripherals anywhere else.
        let dp = unsafe { pac::Peripherals::steal() };

        dp.RCC.ahb1enr.modify(|_, w| {
            w.gpioden()
                .set_bit()
                .gpioeen()
                .set_bit()
                .gpiofen()
                .set_bit()
                .gpiogen()
                .set_bit()
        });
        dp.RCC.ahb3enr.modify(|_, w| w.fmcen().set_bit());
        cortex_m::asm::dsb();

        configure_port!(dp.GPIOD, PORT_D);
        configure_port!(dp.GPIOE, PORT_E);
        configure_port!(dp.GPIOF, PORT_F);
        configure_port!(dp.GPIOG, PORT_G);

        // ADDHLD is unused in mode 1; keep its reset value.
        dp.FMC.btr1.write(|w| unsafe {
            w.addset()
                .bits(bank.addset)
                .addhld()
                .bits(0xF)
                .datast()
                .bits(bank.datast)
                .busturn()
                .bits(bank.busturn)
        });
        // NOR memory type, 16-bit bus, writes enabled.
        dp.FMC.bcr1.write(|w| unsafe {
            w.mbken()
                .set_bit()
                .mtyp()
                .bits(0b10)
                .mwid()
                .bits(0b01)
                .faccen()
                .set_bit()
                .wren()
                .set_bit()
        });
        cortex_m::asm::dsb();
        Ok(())
    }
}
