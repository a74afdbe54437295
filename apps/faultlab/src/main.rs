// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the faultlab fault-injection harness.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the faultlab fault-injection harness.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use faultlab::campaign::ResultStore;
use faultlab::config::{load_config, resolve_config_path, FaultlabConfig};
use faultlab::fault::FaultType;
use faultlab::orchestrator::{ExperimentMode, ExperimentOrchestrator};
use faultlab::report::{load_latest, render_latex, render_report};
use faultlab::trial::TrialRunner;
use faultlab::Tier;
use log::LevelFilter;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Fault injection and tier monitoring harness")]
struct Cli {
    /// Path to the faultlab TOML configuration.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Only log warnings and errors.
    #[arg(long, default_value_t = false, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an experiment mode (sequence of campaigns or chaos trials).
    Run(RunArgs),
    /// Run trials of a single fault without persisting results.
    Trial(TrialArgs),
    /// Summarise the latest persisted campaigns.
    Report(ReportArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Experiment mode.
    #[arg(long, value_enum)]
    mode: ExperimentMode,
    /// Trials per fault (ignored by `quick`).
    #[arg(long, default_value_t = 1)]
    trials: usize,
    /// Delay between trials and campaigns in seconds.
    #[arg(long)]
    trial_delay_s: Option<u64>,
}

#[derive(Debug, Parser)]
struct TrialArgs {
    /// Fault to inject.
    #[arg(long)]
    fault: FaultType,
    /// Number of trials.
    #[arg(long, default_value_t = 1)]
    trials: usize,
    /// Tier runtime trials boot to before injecting.
    #[arg(long, default_value_t = 3)]
    target_tier: u8,
    /// Boot timeout in seconds.
    #[arg(long)]
    timeout_s: Option<u64>,
    /// Delay between trials in seconds.
    #[arg(long)]
    trial_delay_s: Option<u64>,
    /// Exercise recovery after degradation (runtime faults only).
    #[arg(long, default_value_t = false)]
    test_recovery: bool,
    /// Inject a runtime flag fault before boot instead of into a running system.
    #[arg(long, default_value_t = false)]
    boot: bool,
}

#[derive(Debug, Parser)]
struct ReportArgs {
    /// Print boot and runtime LaTeX tables instead of the availability view.
    #[arg(long, default_value_t = false)]
    latex: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);
    let config_path = resolve_config_path(cli.config);
    let config = load_config(config_path.as_deref())?;
    match cli.command {
        Command::Run(args) => run_mode(config, args),
        Command::Trial(args) => run_trials(config, args),
        Command::Report(args) => run_report(&config, args),
    }
}

fn init_logging(quiet: bool) {
    let default_level = if quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn run_mode(mut config: FaultlabConfig, args: RunArgs) -> Result<()> {
    if let Some(secs) = args.trial_delay_s {
        config.timing.trial_delay = Duration::from_secs(secs);
    }
    let orchestrator = ExperimentOrchestrator::new(&config);
    let summary = orchestrator
        .run(args.mode, args.trials, StdRng::from_entropy())
        .with_context(|| format!("experiment mode {} aborted", args.mode))?;
    println!("{summary}");
    Ok(())
}

fn run_trials(mut config: FaultlabConfig, args: TrialArgs) -> Result<()> {
    let fault = args.fault;
    if args.test_recovery && (!fault.is_runtime() || args.boot) {
        bail!("--test-recovery only works with runtime faults, not '{fault}'");
    }
    if args.boot && fault.is_process_fault() {
        bail!("'{fault}' cannot be injected before boot");
    }
    let target = Tier::from_level(args.target_tier)
        .filter(|tier| tier.is_operational())
        .ok_or_else(|| anyhow!("--target-tier must be 1, 2 or 3, got {}", args.target_tier))?;
    if let Some(secs) = args.timeout_s {
        config.timing.boot_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.trial_delay_s {
        config.timing.trial_delay = Duration::from_secs(secs);
    }

    let mut runner = TrialRunner::new(&config, StdRng::from_entropy());
    for index in 1..=args.trials {
        if index > 1 {
            thread::sleep(config.timing.trial_delay);
        }
        if fault.is_runtime() && !args.boot {
            let result = runner.run_runtime_trial(fault, index, target, args.test_recovery);
            println!(
                "Result: T{} -> T{}, MTTD: {}",
                result.initial_tier.map_or_else(|| "?".to_owned(), |tier| tier.to_string()),
                result.final_tier,
                result.mttd_s.map_or_else(|| "n/a".to_owned(), |mttd| format!("{mttd:.2}s"))
            );
        } else {
            let result = runner.run_boot_trial(fault, index);
            println!(
                "Result: tier {}, time {:.2}s",
                result.final_tier, result.boot_time_s
            );
        }
    }
    Ok(())
}

fn run_report(config: &FaultlabConfig, args: ReportArgs) -> Result<()> {
    let store = ResultStore::new(&config.paths.results_dir);
    let docs = load_latest(&store)
        .with_context(|| format!("failed to load results from {}", store.dir().display()))?;
    if args.latex {
        print!("{}", render_latex(&docs));
    } else {
        print!("{}", render_report(&docs));
    }
    Ok(())
}
