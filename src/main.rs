use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, ValueEnum};
use log::warn;

use atonce_fixer::classify::{AddressLimit, LimitPolicy};
use atonce_fixer::config::{DriveMap, DEFAULT_CONFIG};
use atonce_fixer::device::UnitIo;
use atonce_fixer::drive::DriveTable;
use atonce_fixer::report;
use atonce_fixer::shrink::{self, Confirm, ShrinkOptions, StepOutcome};

#[derive(Parser)]
#[command(name = "atonce-fixer")]
#[command(version = env!("APP_VERSION"))]
#[command(about = "Fix FAT16 partitions of MS-DOS images on Atari drives", long_about = None)]
struct Cli {
    /// Drives to check: X, X: or X:\ (C to P)
    #[arg(required = true)]
    drives: Vec<String>,

    /// Only fix partition tables, leave FAT16 boot sectors alone
    #[arg(short, long)]
    skip_fat_check: bool,

    /// Drive map (units, images and drive letters)
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Address limit in 512-byte sectors
    #[arg(long)]
    limit_sectors: Option<u32>,

    /// How partition starts are held against the address limit
    #[arg(long, value_enum)]
    limit_policy: Option<PolicyArg>,

    /// Show proposed changes without writing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Print proposed changes as JSON
    #[arg(long)]
    json: bool,

    /// More output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Fixed,
    FixedOrDriveEnd,
}

impl From<PolicyArg> for LimitPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Fixed => LimitPolicy::Fixed,
            PolicyArg::FixedOrDriveEnd => LimitPolicy::FixedOrDriveEnd,
        }
    }
}

/// Asks on the terminal. In a dry run every question is answered no.
struct TerminalConfirm {
    dry_run: bool,
}

impl Confirm for TerminalConfirm {
    fn confirm(&mut self, question: &str) -> bool {
        if self.dry_run {
            println!("{question} (dry run, no)");
            return false;
        }
        print!("{question} (y/n) ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) => matches!(line.trim(), "y" | "Y" | "yes"),
            Err(_) => false,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn effective_limit(cli: &Cli, map: &DriveMap) -> AddressLimit {
    let mut limit = map.limit.unwrap_or_default();
    if let Some(sectors) = cli.limit_sectors {
        limit.sectors = sectors;
    }
    if let Some(policy) = cli.limit_policy {
        limit.policy = policy.into();
    }
    limit
}

fn run(cli: &Cli) -> Result<ExitCode> {
    println!("ATonce MS-DOS partition fixer v{}", env!("APP_VERSION"));
    println!();

    let mut drives = match DriveTable::from_args(&cli.drives) {
        Ok(drives) => drives,
        Err(e) => Cli::command().error(ErrorKind::ValueValidation, e).exit(),
    };

    let map = DriveMap::load(&cli.config)?;
    let limit = effective_limit(cli, &map);
    let placements = map.placements()?;
    let mut io = map.open_images(cli.dry_run)?;

    let resolved = atonce_fixer::prepare_drives(&mut io, &placements, &mut drives, &limit);
    if drives.warnings() > 0 {
        println!();
    }
    print!("{}", report::summary_table(&drives));
    println!();

    if resolved == 0 {
        eprintln!("No drive could be resolved.");
        return Ok(ExitCode::FAILURE);
    }

    let options = ShrinkOptions {
        limit,
        skip_fat_check: cli.skip_fat_check,
    };
    let mut plans = Vec::new();
    for drive in drives.iter().filter(|d| d.is_eligible()) {
        let Some(placement) = drive.placement else {
            continue;
        };
        let mut unit = UnitIo::new(&mut io, placement.device);
        match shrink::scan_drive(&mut unit, drive, &options) {
            Ok(plan) => {
                print!("{}", report::plan_listing(&plan));
                plans.push(plan);
            }
            Err(e) => warn!("Skipping '{}' drive ({e})", drive.letter),
        }
    }

    if cli.json {
        let json = report::proposals_json(&plans).context("failed to serialize proposals")?;
        println!("{json}");
    }

    let mut confirm = TerminalConfirm {
        dry_run: cli.dry_run,
    };
    for plan in &plans {
        let mut unit = UnitIo::new(&mut io, plan.device);
        for proposal in plan.proposals() {
            let outcome = shrink::apply_proposal(&mut unit, proposal, &mut confirm);
            match outcome.partition {
                Ok(StepOutcome::Applied) => {
                    println!("MBR (sector {}) updated.", proposal.partition.table_sector)
                }
                Ok(StepOutcome::Declined) => {}
                Err(e) => warn!("{}: partition not shrunk ({e})", plan.letter),
            }
            match (outcome.volume, proposal.volume) {
                (Some(Ok(StepOutcome::Applied)), Some(volume)) => {
                    println!("Volume (sector {}) updated.", volume.boot_sector)
                }
                (Some(Err(e)), _) => warn!("{}: volume not shrunk ({e})", plan.letter),
                _ => {}
            }
        }
    }

    println!();
    println!("Done.");
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
