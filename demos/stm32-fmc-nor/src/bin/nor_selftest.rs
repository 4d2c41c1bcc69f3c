#![no_std]
#![no_main]

use cfi_nor::{Function, MmioBus, NorConfig, NorFlash};
use cortex_m_rt::entry;
use defmt::*;
use defmt_rtt as _;
use embedded_storage::nor_flash::{NorFlash as EmbeddedNorFlash, ReadNorFlash};
use panic_probe as _;

use stm32_fmc_nor::board::{FmcNorBank1, NOR_BASE};

// Last 128 KiB sector of a 16 MiB part; nothing else lives there.
const TEST_OFFSET: u32 = 0x00FE_0000;
const SECTOR_SIZE: u32 = 128 * 1024;
const VERIFY_LEN: usize = 256;
const HCLK_HZ: u32 = 16_000_000;

#[entry]
fn main() -> ! {
    info!("FMC NOR self-test");

    // SAFETY: FMC bank 1 maps the NOR device and nothing else touches it.
    let bus = unsafe { MmioBus::new() };
    let mut board = FmcNorBank1::default();

    info!("Checkpoint A: before init_auto");
    let mut flash = match NorFlash::init_auto(
        bus,
        &mut board,
        NOR_BASE,
        HCLK_HZ,
        Function::Program,
        NorConfig::default(),
    ) {
        Ok(flash) => flash,
        Err(e) => {
            error!("init failed: {}", e);
            idle();
        }
    };

    if let Some(detected) = flash.detected_info() {
        info!(
            "Detected {} (manufacturer 0x{=u16:04X}, device {=[u16]:04X})",
            detected.profile_name,
            detected.id.manufacturer,
            &detected.id.device[..]
        );
    }
    info!(
        "Capacity {} KiB, sector {} KiB",
        flash.capacity() / 1024,
        flash.sector_size() / 1024
    );

    let mut head = [0u8; 16];
    unwrap!(flash.read(NOR_BASE + TEST_OFFSET, &mut head));
    info!("Before erase[0..16]: {=[u8]:02X}", &head[..]);

    warn!("Erasing sector at offset 0x{=u32:08X}", TEST_OFFSET);
    info!("Checkpoint B: before erase");
    unwrap!(EmbeddedNorFlash::erase(
        &mut flash,
        TEST_OFFSET,
        TEST_OFFSET + SECTOR_SIZE
    ));
    info!("Checkpoint C: erase complete");

    match flash.blank_check(NOR_BASE + TEST_OFFSET, VERIFY_LEN, 0xFF) {
        Ok(true) => info!("Blank check PASSED"),
        Ok(false) => error!("Blank check FAILED"),
        Err(e) => error!("Blank check error: {}", e),
    }

    let mut payload = [0u8; VERIFY_LEN];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = (i as u8) ^ 0x5a;
    }
    info!("Test pattern[0..16]: {=[u8]:02X}", &payload[..16]);

    info!("Checkpoint D: before write, len={}", VERIFY_LEN);
    unwrap!(EmbeddedNorFlash::write(&mut flash, TEST_OFFSET, &payload));
    info!("Checkpoint E: write complete");

    let mut readback = [0u8; VERIFY_LEN];
    unwrap!(ReadNorFlash::read(&mut flash, TEST_OFFSET, &mut readback));
    info!("Read back[0..16]:    {=[u8]:02X}", &readback[..16]);

    match flash.verify(NOR_BASE + TEST_OFFSET, &payload) {
        Ok(()) => info!("Verification PASSED - all {} bytes match", VERIFY_LEN),
        Err(e) => {
            error!("Verification FAILED: {}", e);
            error!("Expected[0..16]: {=[u8]:02X}", &payload[..16]);
            error!("Got[0..16]:      {=[u8]:02X}", &readback[..16]);
        }
    }

    let _bus = flash.uninit(Function::Program);
    info!("Test complete. Entering idle loop.");
    idle();
}

fn idle() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}
