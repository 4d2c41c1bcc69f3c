use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use cfi_nor::mock::MockNor;
use cfi_nor::{
    BuiltInProfile, Function, NorConfig, NorFlash, NorId, Preconfigured, ProfileSource,
};
use log::{debug, info, warn};

use crate::session::{SessionFile, Step};

/// Clock passed to the bring-up hook; the simulated controller ignores it.
const SIM_CLOCK_HZ: u32 = 12_000_000;

pub struct Simulator {
    flash: NorFlash<MockNor>,
    dir: PathBuf,
}

pub struct StepReport {
    pub index: usize,
    pub label: String,
    pub outcome: Result<String, cfi_nor::Error>,
    pub reads: u32,
    pub writes: usize,
}

impl fmt::Display for StepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>3}] {:<40} ", self.index, self.label)?;
        match &self.outcome {
            Ok(detail) if detail.is_empty() => write!(f, "ok")?,
            Ok(detail) => write!(f, "ok ({detail})")?,
            Err(e) => write!(f, "FAILED {e:?}")?,
        }
        write!(f, "  [{} reads, {} writes]", self.reads, self.writes)
    }
}

fn largest_builtin() -> usize {
    BuiltInProfile::ALL
        .iter()
        .map(|p| p.profile().capacity_bytes())
        .max()
        .unwrap_or(0)
}

impl Simulator {
    /// Opens a session on a fresh, fully erased simulated device.
    pub fn open(
        base: u32,
        profile: &str,
        id: Option<NorId>,
        config: NorConfig,
        dir: &Path,
    ) -> Result<Self> {
        let flash = if profile.eq_ignore_ascii_case("auto") {
            let mut nor = MockNor::new(base, largest_builtin(), cfi_nor::UNIFORM_SECTOR_BYTES);
            if let Some(id) = id {
                nor = nor.with_id(id);
            }
            NorFlash::init_auto(
                nor,
                &mut Preconfigured,
                base,
                SIM_CLOCK_HZ,
                Function::Program,
                config,
            )
        } else {
            let builtin = BuiltInProfile::from_name(profile)
                .ok_or_else(|| anyhow!("unknown profile `{profile}`"))?;
            let p = builtin.profile();
            let mut nor = MockNor::new(base, p.capacity_bytes(), p.sector_size());
            if let Some(id) = id {
                nor = nor.with_id(id);
            }
            NorFlash::init(
                nor,
                &mut Preconfigured,
                base,
                SIM_CLOCK_HZ,
                Function::Program,
                ProfileSource::BuiltIn(builtin),
                config,
            )
        }
        .map_err(|e| anyhow!("init failed: {e:?}"))?;

        info!(
            "session open: {} ({} KiB) at {:#010x}",
            flash.profile().name(),
            flash.capacity() / 1024,
            flash.base_address()
        );
        Ok(Self {
            flash,
            dir: dir.to_path_buf(),
        })
    }

    pub fn from_session(session: &SessionFile, dir: &Path) -> Result<Self> {
        let mut config = NorConfig::default();
        if let Some(polls) = session.max_toggle_polls {
            config.max_toggle_polls = polls;
        }
        if let Some(pad) = session.pad_odd_length {
            config.pad_odd_length = pad;
        }
        let id = session.id.as_ref().map(|id| id.to_id()).transpose()?;
        Self::open(session.base, &session.profile, id, config, dir)
    }

    pub fn flash(&self) -> &NorFlash<MockNor> {
        &self.flash
    }

    /// Executes one step. Device errors land in the report; only host-side
    /// problems such as a missing image are returned as `Err`.
    pub fn run_step(&mut self, index: usize, step: &Step) -> Result<StepReport> {
        self.flash.bus_mut().clear_log();

        let (label, outcome) = match step {
            Step::EraseChip => ("erase_chip".to_string(), self.flash.erase_chip().map(|_| String::new())),
            Step::EraseSector { addr } => (
                format!("erase_sector {addr:#010x}"),
                self.flash.erase_sector(*addr).map(|_| String::new()),
            ),
            Step::Program { addr, payload } => {
                let data = payload.bytes(&self.dir)?;
                let outcome = self.program(*addr, &data);
                (format!("program {addr:#010x} +{}", data.len()), outcome)
            }
            Step::Verify { addr, payload } => {
                let data = payload.bytes(&self.dir)?;
                (
                    format!("verify {addr:#010x} +{}", data.len()),
                    self.flash.verify(*addr, &data).map(|_| String::new()),
                )
            }
            Step::BlankCheck { addr, len, pattern } => (
                format!("blank_check {addr:#010x} +{len} ={pattern:#04x}"),
                self.flash
                    .blank_check(*addr, *len as usize, *pattern)
                    .map(|blank| if blank { "blank" } else { "not blank" }.to_string()),
            ),
            Step::Fault { kind, addr, after } => {
                let fault = kind.to_fault(*after);
                match addr {
                    Some(addr) => self.flash.bus_mut().inject_fault_at(*addr, fault),
                    None => self.flash.bus_mut().inject_fault(fault),
                }
                (format!("fault {kind:?}"), Ok(format!("{fault:?}")))
            }
            Step::Reset => {
                self.flash.reset();
                ("reset".to_string(), Ok(String::new()))
            }
            Step::ReadId => {
                let id = self.flash.read_id();
                (
                    "read_id".to_string(),
                    Ok(format!(
                        "manufacturer {:#06x} device {:04x?}",
                        id.manufacturer, id.device
                    )),
                )
            }
        };

        let nor = self.flash.bus();
        if nor.ordering_violations() != 0 {
            warn!("{} bus accesses without a barrier", nor.ordering_violations());
        }
        let report = StepReport {
            index,
            label,
            outcome,
            reads: nor.reads(),
            writes: nor.writes().len(),
        };
        debug!("{report}");
        Ok(report)
    }

    /// Programs `data` page by page, the way a debugger drives `ProgramPage`.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<String, cfi_nor::Error> {
        let page = self.flash.page_size();
        let mut pages = 0;
        let mut at = Some(addr);
        for chunk in data.chunks(page) {
            let page_addr = at.ok_or(cfi_nor::Error::OutOfBounds)?;
            self.flash.program_page(page_addr, chunk)?;
            at = page_addr.checked_add(chunk.len() as u32);
            pages += 1;
        }
        Ok(format!("{pages} page(s)"))
    }

    /// Runs every step, stopping at the first failing one.
    pub fn run_all(&mut self, steps: &[Step]) -> Result<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let report = self
                .run_step(index, step)
                .with_context(|| format!("step {index}"))?;
            let failed = report.outcome.is_err();
            reports.push(report);
            if failed {
                break;
            }
        }
        Ok(reports)
    }
}

/// Steps that erase the sectors covering `[addr, addr + len)`, program and verify.
pub fn program_plan(
    flash: &NorFlash<MockNor>,
    addr: u32,
    image: PathBuf,
    len: usize,
    erase: bool,
) -> Result<Vec<Step>> {
    if len == 0 {
        bail!("image is empty");
    }
    let sector = flash.sector_size() as u32;
    let mut steps = Vec::new();
    if erase {
        let offset = addr
            .checked_sub(flash.base_address())
            .ok_or_else(|| anyhow!("{addr:#010x} is below the device base"))?;
        let first = addr - offset % sector;
        // `end` is exclusive, so an image may run up to the last byte of the
        // address space.
        let end = u32::try_from(len)
            .ok()
            .and_then(|len| addr.checked_add(len - 1))
            .ok_or_else(|| anyhow!("image does not fit below 4 GiB"))?;
        let mut sector_addr = Some(first);
        while let Some(at) = sector_addr.filter(|at| *at <= end) {
            steps.push(Step::EraseSector { addr: at });
            sector_addr = at.checked_add(sector);
        }
    }
    let payload = crate::session::Payload {
        image: Some(image),
        fill: None,
        len: None,
    };
    steps.push(Step::Program {
        addr,
        payload: payload.clone(),
    });
    steps.push(Step::Verify { addr, payload });
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FaultKind, Payload};

    const BASE: u32 = 0x6000_0000;

    fn fill(len: u32, byte: u8) -> Payload {
        Payload {
            image: None,
            fill: Some(byte),
            len: Some(len),
        }
    }

    fn simulator() -> Simulator {
        Simulator::open(BASE, "s29gl128p", None, NorConfig::default(), Path::new(".")).unwrap()
    }

    #[test]
    fn erase_program_verify_session_succeeds() {
        let mut sim = simulator();
        let steps = [
            Step::EraseSector { addr: BASE + 0x2_0000 },
            Step::Program {
                addr: BASE + 0x2_0000,
                payload: fill(3000, 0x42),
            },
            Step::Verify {
                addr: BASE + 0x2_0000,
                payload: fill(3000, 0x42),
            },
            Step::BlankCheck {
                addr: BASE + 0x2_0000 + 3000,
                len: 512,
                pattern: 0xFF,
            },
        ];
        let reports = sim.run_all(&steps).unwrap();
        assert_eq!(reports.len(), 4);
        assert!(reports.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(reports[1].outcome.as_deref(), Ok("3 page(s)"));
        assert_eq!(reports[1].writes, 1500 * 4);
        assert_eq!(sim.flash().bus().ordering_violations(), 0);
    }

    #[test]
    fn fault_stops_session() {
        let mut sim = simulator();
        let steps = [
            Step::Fault {
                kind: FaultKind::Hang,
                addr: None,
                after: 0,
            },
            Step::EraseChip,
            Step::ReadId,
        ];
        let reports = sim.run_all(&steps).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(
            reports[1].outcome,
            Err(cfi_nor::Error::DeviceUnresponsive)
        );
    }

    #[test]
    fn auto_profile_uses_reported_id() {
        let id = NorId {
            manufacturer: NorId::SPANSION,
            device: [0x227E, 0x2222, 0x2201],
        };
        let sim = Simulator::open(BASE, "auto", Some(id), NorConfig::default(), Path::new("."))
            .unwrap();
        assert_eq!(sim.flash().profile().name(), "s29gl256p");
    }

    #[test]
    fn unknown_profile_is_an_error() {
        assert!(Simulator::open(BASE, "nope", None, NorConfig::default(), Path::new(".")).is_err());
    }

    #[test]
    fn program_plan_stops_at_top_of_address_space() {
        // A 16 MiB part whose window ends at 0xFFFF_FFFF.
        let sim = Simulator::open(
            0xFF00_0000,
            "s29gl128p",
            None,
            NorConfig::default(),
            Path::new("."),
        )
        .unwrap();
        let steps = program_plan(
            sim.flash(),
            0xFFFF_0000,
            PathBuf::from("image.bin"),
            0x1_0000,
            true,
        )
        .unwrap();
        assert!(matches!(steps[0], Step::EraseSector { addr: 0xFFFE_0000 }));
        assert_eq!(steps.len(), 3);

        assert!(program_plan(
            sim.flash(),
            0xFFFF_0000,
            PathBuf::from("image.bin"),
            0x1_0001,
            true,
        )
        .is_err());
    }

    #[test]
    fn program_past_end_of_window_reports_out_of_bounds() {
        let mut sim = Simulator::open(
            0xFF00_0000,
            "s29gl128p",
            None,
            NorConfig::default(),
            Path::new("."),
        )
        .unwrap();
        let reports = sim
            .run_all(&[Step::Program {
                addr: 0xFFFF_FC00,
                payload: fill(2048, 0x00),
            }])
            .unwrap();
        assert_eq!(reports[0].outcome, Err(cfi_nor::Error::OutOfBounds));
    }

    #[test]
    fn program_plan_erases_covering_sectors() {
        let sim = simulator();
        let steps = program_plan(
            sim.flash(),
            BASE + 0x3_F000,
            PathBuf::from("image.bin"),
            0x2000,
            true,
        )
        .unwrap();
        let erased: Vec<u32> = steps
            .iter()
            .filter_map(|s| match s {
                Step::EraseSector { addr } => Some(*addr),
                _ => None,
            })
            .collect();
        assert_eq!(erased, [BASE + 0x2_0000, BASE + 0x4_0000]);
        assert_eq!(steps.len(), 4);
    }
}
