// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Sequence experiment modes onto campaigns and summarise the whole run.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Local};
use clap::ValueEnum;
use log::{info, warn};
use rand::Rng;
use serde::Deserialize;

use crate::campaign::{percent, run_campaign, CampaignPlan, ResultStore};
use crate::chaos::run_chaos;
use crate::config::FaultlabConfig;
use crate::fault::FaultType;
use crate::supervisor::cleanup_environment;
use crate::tools;
use crate::trial::TrialRunner;
use crate::verifier::{VerifierLease, VerifierService};
use crate::{Result, LOG_TARGET};

/// Trials per fault in `quick` mode.
pub const QUICK_TRIALS: usize = 3;
/// Floor for the boot timeout while campaigns run back to back.
pub const ORCHESTRATED_BOOT_TIMEOUT: Duration = Duration::from_secs(240);
/// Result files considered by the overall summary.
pub const SUMMARY_SCAN_LIMIT: usize = 20;

/// Named experiment modes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExperimentMode {
    /// Every boot-time fault.
    Boot,
    /// Every runtime fault, degradation only.
    Runtime,
    /// Every runtime fault with recovery.
    Recovery,
    /// Boot, runtime and recovery campaigns in turn.
    All,
    /// Boot and runtime campaigns with three trials each.
    Quick,
    /// Randomly composed single and cascading fault scenarios.
    Chaos,
}

impl ExperimentMode {
    /// Name shown in logs and summaries.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Runtime => "runtime",
            Self::Recovery => "recovery",
            Self::All => "all",
            Self::Quick => "quick",
            Self::Chaos => "chaos",
        }
    }

    /// Trials per fault once the mode's own override is applied.
    #[must_use]
    pub const fn iterations(self, requested: usize) -> usize {
        match self {
            Self::Quick => QUICK_TRIALS,
            _ => requested,
        }
    }
}

impl fmt::Display for ExperimentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One campaign line of the overall summary.
#[derive(Clone, Debug, PartialEq)]
pub struct CampaignLine {
    /// Campaign fault name, or `chaos`.
    pub fault_type: String,
    /// `boot`, `runtime` or `chaos`.
    pub mode: String,
    /// Trials run.
    pub total_trials: usize,
    /// Trials marked successful.
    pub successful: usize,
    /// Successful share in percent.
    pub success_rate: f64,
}

/// Cross-campaign view printed at the end of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Mode that ran.
    pub mode: ExperimentMode,
    /// Trials per fault.
    pub iterations: usize,
    /// Campaigns found among the files written by this run.
    pub campaigns: Vec<CampaignLine>,
    /// Wall-clock run length.
    pub duration: Duration,
    /// Completion time.
    pub completed: DateTime<Local>,
    /// Where the documents live.
    pub results_dir: PathBuf,
}

impl RunSummary {
    /// Trials over every campaign.
    #[must_use]
    pub fn total_trials(&self) -> usize {
        self.campaigns.iter().map(|line| line.total_trials).sum()
    }

    /// Successful trials over every campaign.
    #[must_use]
    pub fn successful(&self) -> usize {
        self.campaigns.iter().map(|line| line.successful).sum()
    }

    /// Overall success share in percent, `None` without trials.
    #[must_use]
    pub fn overall_success(&self) -> Option<f64> {
        let total = self.total_trials();
        (total > 0).then(|| percent(self.successful(), total))
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "OVERALL EXPERIMENT SUMMARY")?;
        writeln!(f, "  mode:             {}", self.mode.as_str().to_uppercase())?;
        writeln!(f, "  trials per fault: {}", self.iterations)?;
        writeln!(f)?;
        writeln!(f, "CAMPAIGNS COMPLETED:")?;
        for line in &self.campaigns {
            writeln!(
                f,
                "  {:15} ({:8}): {}/{} trials, {:.1}%",
                line.fault_type, line.mode, line.successful, line.total_trials, line.success_rate
            )?;
        }
        if !self.campaigns.is_empty() {
            let total = self.total_trials();
            writeln!(f)?;
            writeln!(f, "TOTALS:")?;
            writeln!(f, "  campaigns:        {}", self.campaigns.len())?;
            writeln!(f, "  total trials:     {total}")?;
            writeln!(f, "  successful:       {}", self.successful())?;
            writeln!(f, "  failed:           {}", total - self.successful())?;
            if let Some(rate) = self.overall_success() {
                writeln!(f, "  overall success:  {rate:.1}%")?;
            }
        }
        let secs = self.duration.as_secs_f64();
        writeln!(f)?;
        writeln!(f, "DURATION:")?;
        writeln!(f, "  completed:        {}", self.completed.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "  total time:       {:.2} hours ({:.1} minutes)", secs / 3600.0, secs / 60.0)?;
        let total = self.total_trials();
        if total > 0 {
            writeln!(f, "  avg per trial:    {:.1}s", secs / total as f64)?;
        }
        writeln!(f)?;
        write!(f, "RESULTS: {}", self.results_dir.display())
    }
}

#[derive(Debug, Deserialize)]
struct SummaryHead {
    fault_type: String,
    #[serde(default)]
    mode: Option<String>,
    total_trials: usize,
    successful: usize,
    success_rate: f64,
}

#[derive(Debug, Deserialize)]
struct DocumentHead {
    summary: SummaryHead,
}

/// Runs named modes against one lab under a verifier lease.
#[derive(Debug)]
pub struct ExperimentOrchestrator {
    config: FaultlabConfig,
    store: ResultStore,
}

impl ExperimentOrchestrator {
    /// Orchestrator over a copy of `config` with the boot timeout raised to
    /// at least [`ORCHESTRATED_BOOT_TIMEOUT`].
    #[must_use]
    pub fn new(config: &FaultlabConfig) -> Self {
        let mut config = config.clone();
        config.timing.boot_timeout = config.timing.boot_timeout.max(ORCHESTRATED_BOOT_TIMEOUT);
        let store = ResultStore::new(&config.paths.results_dir);
        Self { config, store }
    }

    /// Configuration in effect for the run.
    #[must_use]
    pub fn config(&self) -> &FaultlabConfig {
        &self.config
    }

    /// Result store the campaigns write to.
    #[must_use]
    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Run `mode` with `requested` trials per fault.
    ///
    /// A verifier that cannot be started aborts the run before any trial.
    pub fn run<R: Rng>(&self, mode: ExperimentMode, requested: usize, rng: R) -> Result<RunSummary> {
        let started = Instant::now();
        let since = SystemTime::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let iterations = mode.iterations(requested);
        info!(
            target: LOG_TARGET,
            "experiments: mode {mode}, {iterations} trials per fault, trial delay {:.0}s",
            self.config.timing.trial_delay.as_secs_f64()
        );

        let lease = VerifierLease::acquire(VerifierService::new(&self.config))?;
        let mut runner = TrialRunner::new(&self.config, rng);
        match mode {
            ExperimentMode::Boot => self.boot_campaigns(&mut runner, iterations)?,
            ExperimentMode::Runtime => self.runtime_campaigns(&mut runner, iterations, false)?,
            ExperimentMode::Recovery => self.runtime_campaigns(&mut runner, iterations, true)?,
            ExperimentMode::All => {
                self.boot_campaigns(&mut runner, iterations)?;
                self.runtime_campaigns(&mut runner, iterations, false)?;
                self.runtime_campaigns(&mut runner, iterations, true)?;
            }
            ExperimentMode::Quick => {
                self.boot_campaigns(&mut runner, iterations)?;
                self.runtime_campaigns(&mut runner, iterations, false)?;
            }
            ExperimentMode::Chaos => {
                run_chaos(&mut runner, &self.store, iterations)?;
            }
        }

        let summary = RunSummary {
            mode,
            iterations,
            campaigns: scan_campaigns(&self.store, since)?,
            duration: started.elapsed(),
            completed: Local::now(),
            results_dir: self.store.dir().to_path_buf(),
        };
        lease.release();
        Ok(summary)
    }

    fn boot_campaigns<R: Rng>(&self, runner: &mut TrialRunner<'_, R>, iterations: usize) -> Result<()> {
        let started = Instant::now();
        let faults = FaultType::BOOT_TIME;
        info!(
            target: LOG_TARGET,
            "boot-time campaigns: {} faults x {iterations} trials",
            faults.len()
        );
        cleanup_environment(&self.config);
        self.campaigns(runner, &faults, CampaignPlan::boot(iterations))?;
        info!(
            target: LOG_TARGET,
            "boot-time campaigns complete: {} trials in {:.1} min",
            faults.len() * iterations,
            started.elapsed().as_secs_f64() / 60.0
        );
        Ok(())
    }

    fn runtime_campaigns<R: Rng>(
        &self,
        runner: &mut TrialRunner<'_, R>,
        iterations: usize,
        recovery: bool,
    ) -> Result<()> {
        let started = Instant::now();
        let faults = FaultType::RUNTIME;
        info!(
            target: LOG_TARGET,
            "runtime campaigns ({}): {} faults x {iterations} trials",
            if recovery { "with recovery" } else { "degradation" },
            faults.len()
        );
        cleanup_environment(&self.config);
        info!(target: LOG_TARGET, "[runtime init] preparing clean state for a tier 3 boot");
        if let Err(err) = tools::reset_journals(&self.config) {
            warn!(target: LOG_TARGET, "journal reset failed: {err}");
        }
        tools::rebuild_image_best_effort(&self.config);
        self.campaigns(runner, &faults, CampaignPlan::runtime(iterations, recovery))?;
        info!(
            target: LOG_TARGET,
            "runtime campaigns complete: {} trials in {:.1} min",
            faults.len() * iterations,
            started.elapsed().as_secs_f64() / 60.0
        );
        Ok(())
    }

    fn campaigns<R: Rng>(
        &self,
        runner: &mut TrialRunner<'_, R>,
        faults: &[FaultType],
        plan: CampaignPlan,
    ) -> Result<()> {
        for (index, fault) in faults.iter().enumerate() {
            info!(
                target: LOG_TARGET,
                "[campaign {}/{}] {fault}",
                index + 1,
                faults.len()
            );
            run_campaign(runner, &self.store, *fault, plan)?;
            thread::sleep(self.config.timing.trial_delay);
        }
        Ok(())
    }
}

/// Summary lines for result documents written at or after `since`.
///
/// Files that do not parse as result documents are skipped.
pub fn scan_campaigns(store: &ResultStore, since: SystemTime) -> Result<Vec<CampaignLine>> {
    let mut lines = Vec::new();
    for path in store.recent_files(SUMMARY_SCAN_LIMIT, since)? {
        match read_head(&path) {
            Ok(head) => lines.push(CampaignLine {
                mode: head.summary.mode.unwrap_or_else(|| head.summary.fault_type.clone()),
                fault_type: head.summary.fault_type,
                total_trials: head.summary.total_trials,
                successful: head.summary.successful,
                success_rate: head.summary.success_rate,
            }),
            Err(err) => warn!(target: LOG_TARGET, "skipping {}: {err}", path.display()),
        }
    }
    Ok(lines)
}

fn read_head(path: &Path) -> Result<DocumentHead> {
    ResultStore::load(path)
}
