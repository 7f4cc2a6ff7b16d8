// SPDX-License-Identifier: GPL-2.0
//
// phasectl: energy-aware phase-driven migration controller for
// big.LITTLE systems.
//
// Traces one target process, samples its PMU counter group and the
// platform's power draw every tick, asks an external phase classifier
// what kind of phase the process is in, and migrates it between the
// big and little core sets accordingly. Reports total energy, elapsed
// time and core residency when the traced process exits.

mod affinity;
mod energy;
mod events;
mod launch;
mod perf;
mod predictor;
mod residency;
mod scheduler;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::affinity::parse_cpu_list;
use crate::scheduler::{FinalReport, MigrationScheduler, SchedulerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "phasectl",
    version,
    about = "Energy-aware phase-driven process migration for big.LITTLE systems"
)]
struct Opts {
    /// 1 = apply migration decisions, 0 = observe and report only.
    #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
    run_scheduler: u8,

    /// Big (performance) core set, e.g. "4-7" or "4,5,6,7".
    big_cpus: String,

    /// Little (efficiency) core set, e.g. "0-3".
    little_cpus: String,

    /// Program to trace.
    program: String,

    /// Arguments passed to the traced program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Comma-separated PMU event list. Must include the five counters
    /// the classifier was trained on.
    #[clap(
        long,
        default_value = "cpu_cycles,inst_retired,l2d_cache,l2d_cache_refill,br_mis_pred"
    )]
    events: String,

    /// Sampling tick in milliseconds.
    #[clap(long, default_value = "200")]
    tick_ms: u64,

    /// Predicted phase at or above this value migrates to little.
    #[clap(long, default_value = "5")]
    phase_threshold: i64,

    /// Phase classifier command, launched through the shell.
    #[clap(long, default_value = "python3 ./predictor.py")]
    predictor: String,

    /// Instantaneous voltage endpoint (ASCII microvolts).
    #[clap(long, default_value = "/sys/class/power_supply/bms/voltage_now")]
    voltage_path: PathBuf,

    /// Instantaneous current endpoint (ASCII microamps).
    #[clap(long, default_value = "/sys/class/power_supply/bms/current_now")]
    current_path: PathBuf,

    /// Emit the final report as JSON instead of plain lines.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

fn print_report(report: &FinalReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{} mJ", report.energy.energy_mj);
    println!("{} ms", report.energy.elapsed_ms);
    println!(
        "{:.6} big, {:.6} LITTLE",
        report.big_residency, report.little_residency
    );
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Warn
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let cfg = SchedulerConfig {
        run_scheduler: opts.run_scheduler == 1,
        big_cpus: parse_cpu_list(&opts.big_cpus)?,
        little_cpus: parse_cpu_list(&opts.little_cpus)?,
        program: opts.program,
        args: opts.args,
        events: opts.events,
        tick: Duration::from_millis(opts.tick_ms),
        phase_threshold: opts.phase_threshold,
        predictor_cmd: opts.predictor,
        voltage_path: opts.voltage_path,
        current_path: opts.current_path,
    };

    let report = MigrationScheduler::new(cfg).run()?;
    print_report(&report, opts.json)
}
