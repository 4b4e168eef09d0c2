//! Harness CLI: demo, conformance, cron, and log inspection commands.

use clap::{Parser, Subcommand};

use lodestone_core::cron::{decode_schedule, describe_schedule, CronMap};
use lodestone_core::log::{BlockLog, KIND_DEBUG2};
use lodestone_core::storage::RamStorage;
use lodestone_harness::{demo, scenarios};

#[derive(Parser)]
#[command(name = "lodestone", about = "Lodestone firmware core harness")]
struct Cli {
    /// Raise log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot, mutate, snapshot, and reboot a RAM-backed stack
    Demo {
        /// Drive the snapshot through the background services
        #[arg(long)]
        services: bool,
    },
    /// Run the conformance scenarios and emit a JSON report
    Roundtrip,
    /// Decode a crontab-style schedule and show its expansion
    Cron {
        /// Five-field schedule, e.g. "0 2 * * 1-5/2"
        schedule: String,
    },
    /// Fill a RAM log with records, remount, and walk the headers
    Log {
        /// Number of records to append
        #[arg(long, default_value_t = 9)]
        records: u8,
        /// Sector size in bytes
        #[arg(long, default_value_t = 128)]
        sector_size: usize,
        /// Number of sectors
        #[arg(long, default_value_t = 3)]
        sectors: usize,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}

fn cmd_cron(schedule: &str) -> i32 {
    let Some(decoded) = decode_schedule(schedule) else {
        eprintln!("invalid schedule: {schedule}");
        return 2;
    };

    let map = CronMap::from_schedule(&decoded);
    println!("schedule:     {schedule}");
    println!("description:  {}", describe_schedule(&decoded));
    println!("minutes:      {:#018x}", map.minutes);
    println!("hours:        {:#010x}", map.hours);
    println!("days:         {:#010x}", map.days_of_month);
    println!("months:       {:#06x}", map.months);
    println!("days_of_week: {:#06x} ({:#09b})", map.days_of_week, map.days_of_week);
    0
}

fn cmd_log(records: u8, sector_size: usize, sectors: usize) -> i32 {
    let mut log = BlockLog::new(RamStorage::new(sector_size, sectors));
    log.format();

    for i in 1..=records {
        if let Err(err) = log.append(KIND_DEBUG2, false, &[i; 16]) {
            eprintln!("append {i} failed: {err}");
            return 1;
        }
    }

    let mut log = BlockLog::new(log.into_store());
    if !log.mount() {
        eprintln!("remount failed");
        return 1;
    }

    println!(
        "mounted: head {:#x}, latest {:#x}, tail sector {}",
        log.head_offset(),
        log.latest_offset(),
        log.tail_sector()
    );

    log.read_init();
    while let Some((header, start)) = log.read_next_header() {
        println!(
            "  {:#06x}: kind {} len {} gen {}{}",
            start,
            header.kind,
            header.data_len,
            u8::from(header.generation),
            if header.compressed { " compressed" } else { "" },
        );
    }
    0
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match cli.command {
        Command::Demo { services } => {
            if demo::run(services) {
                0
            } else {
                1
            }
        }
        Command::Roundtrip => {
            let mut report = scenarios::run_all();

            // Digest a deterministic demo image so runs can be diffed
            let stack = lodestone_harness::rig::boot(None);
            let mut log = stack.log;
            let _ = lodestone_core::log::props::save_props_to_log(&stack.db, &mut log, true);
            report.attach_flash_image(log.store().image());

            println!("{}", report.to_json());
            if report.all_passed() {
                0
            } else {
                1
            }
        }
        Command::Cron { schedule } => cmd_cron(&schedule),
        Command::Log {
            records,
            sector_size,
            sectors,
        } => cmd_log(records, sector_size, sectors),
    };

    std::process::exit(code);
}
