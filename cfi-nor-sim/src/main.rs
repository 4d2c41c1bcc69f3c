mod runner;
mod session;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cfi_nor::{BuiltInProfile, NorConfig};
use clap::{Parser, Subcommand};

use crate::runner::{program_plan, Simulator, StepReport};
use crate::session::{parse_u32, FaultKind, SessionFile, Step, DEFAULT_BASE};

#[derive(Parser, Debug)]
#[command(
    name = "cfi-nor-sim",
    version,
    about = "Drives the NOR programming algorithm against a simulated device"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List built-in device profiles
    Profiles,
    /// Run a scripted Hjson session
    Run {
        session: PathBuf,
        /// Override the session's profile (`auto` detects from the device id)
        #[arg(long)]
        profile: Option<String>,
        /// Override the toggle-poll cap
        #[arg(long)]
        max_toggle_polls: Option<u32>,
    },
    /// Erase, program and verify one image
    Program {
        image: PathBuf,
        /// Absolute target address
        #[arg(long, value_parser = parse_u32, default_value = "0x60000000")]
        addr: u32,
        #[arg(long, value_parser = parse_u32, default_value = "0x60000000")]
        base: u32,
        #[arg(long, default_value = "s29gl128p")]
        profile: String,
        /// Skip erasing the sectors the image covers
        #[arg(long)]
        no_erase: bool,
        /// Inject a device fault
        #[arg(long, value_enum)]
        fault: Option<FaultKind>,
        /// Only fault the operation started at this address
        #[arg(long, value_parser = parse_u32)]
        fault_at: Option<u32>,
        /// Status reads before DQ5 rises for `timeout-stuck`
        #[arg(long, default_value_t = 1)]
        fault_after: u32,
        #[arg(long)]
        max_toggle_polls: Option<u32>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    run_cli(cli)
}

fn run_cli(cli: Cli) -> Result<()> {
    match cli.cmd {
        Command::Profiles => print_profiles(),
        Command::Run {
            session,
            profile,
            max_toggle_polls,
        } => {
            let mut file = SessionFile::load(&session)?;
            if let Some(profile) = profile {
                file.profile = profile;
            }
            if max_toggle_polls.is_some() {
                file.max_toggle_polls = max_toggle_polls;
            }
            let dir = session.parent().unwrap_or(Path::new("."));
            let mut sim = Simulator::from_session(&file, dir)?;
            finish(sim.run_all(&file.steps)?)
        }
        Command::Program {
            image,
            addr,
            base,
            profile,
            no_erase,
            fault,
            fault_at,
            fault_after,
            max_toggle_polls,
        } => {
            let len = std::fs::metadata(&image)
                .with_context(|| format!("reading {}", image.display()))?
                .len() as usize;
            let mut config = NorConfig::default();
            if let Some(polls) = max_toggle_polls {
                config.max_toggle_polls = polls;
            }

            let mut sim = Simulator::open(base, &profile, None, config, Path::new("."))?;
            let mut steps = Vec::new();
            if let Some(kind) = fault {
                steps.push(Step::Fault {
                    kind,
                    addr: fault_at,
                    after: fault_after,
                });
            }
            steps.extend(program_plan(sim.flash(), addr, image, len, !no_erase)?);
            finish(sim.run_all(&steps)?)
        }
    }
}

fn print_profiles() -> Result<()> {
    println!("{:<12} {:>10} {:>10} {:>8}", "name", "capacity", "sector", "page");
    for builtin in BuiltInProfile::ALL {
        let p = builtin.profile();
        println!(
            "{:<12} {:>7} KiB {:>6} KiB {:>8}",
            p.name(),
            p.capacity_bytes() / 1024,
            p.sector_size() / 1024,
            p.page_size()
        );
    }
    println!("default base: {DEFAULT_BASE:#010x}");
    Ok(())
}

fn finish(reports: Vec<StepReport>) -> Result<()> {
    for report in &reports {
        println!("{report}");
    }
    if let Some(failed) = reports.iter().find(|r| r.outcome.is_err()) {
        bail!("step {} failed", failed.index);
    }
    println!("{} step(s) ok", reports.len());
    Ok(())
}
