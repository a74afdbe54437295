// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Run trial batches, summarise them and persist campaign result documents.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Instant, SystemTime};

use chrono::{DateTime, Local, Utc};
use log::info;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tier_model::Tier;

use crate::fault::FaultType;
use crate::tools;
use crate::trial::{TrialMode, TrialResult, TrialRunner};
use crate::{Result, LOG_TARGET};

/// Experiment name written into result metadata.
pub const EXPERIMENT_NAME: &str = "faultlab fault injection";
/// Prefix of every result file name.
pub const RESULT_PREFIX: &str = "faultlab_results";
/// Suffix of result aliases that always hold the newest campaign.
pub const LATEST_SUFFIX: &str = "_latest.json";

/// Aggregate over one campaign, recomputed from its trial results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    /// Campaign fault name.
    pub fault_type: FaultType,
    /// Boot-time or runtime.
    pub mode: TrialMode,
    /// Trials run.
    pub total_trials: usize,
    /// Trials marked successful.
    pub successful: usize,
    /// Trials not marked successful.
    pub failed: usize,
    /// Successful share in percent.
    pub success_rate: f64,
    /// Trial count per final tier, keys 0 through 3.
    pub tier_distribution: BTreeMap<u8, usize>,
    /// Mean boot time (boot-time campaigns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_boot_time_s: Option<f64>,
    /// Shortest boot time (boot-time campaigns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_boot_time_s: Option<f64>,
    /// Longest boot time (boot-time campaigns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_boot_time_s: Option<f64>,
    /// Trials that ended below their initial tier (runtime campaigns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_count: Option<usize>,
    /// Degraded share in percent (runtime campaigns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation_rate: Option<f64>,
    /// Mean time to detect over trials that observed a change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_mttd_s: Option<f64>,
    /// Shortest time to detect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_mttd_s: Option<f64>,
    /// Longest time to detect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mttd_s: Option<f64>,
    /// Trials that recovered above the degraded tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_count: Option<usize>,
    /// Recovered share in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_rate: Option<f64>,
    /// Mean time to recover over recovered trials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_mttr_s: Option<f64>,
    /// Shortest time to recover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_mttr_s: Option<f64>,
    /// Longest time to recover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mttr_s: Option<f64>,
}

/// Mean, minimum and maximum of a sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stats {
    /// Arithmetic mean.
    pub mean: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
}

impl Stats {
    /// Statistics over `values`, `None` when empty.
    #[must_use]
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(Self {
            mean: sum / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// Share of `count` in `total`, in percent.
#[must_use]
pub fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

impl CampaignSummary {
    /// Project a summary out of `results`.
    ///
    /// Recovery statistics are included only when `recovery_tested`.
    #[must_use]
    pub fn from_results(
        fault_type: FaultType,
        mode: TrialMode,
        results: &[TrialResult],
        recovery_tested: bool,
    ) -> Self {
        let total_trials = results.len();
        let successful = results.iter().filter(|result| result.success).count();
        let mut tier_distribution: BTreeMap<u8, usize> =
            Tier::ALL.iter().map(|tier| (tier.level(), 0)).collect();
        for result in results {
            *tier_distribution.entry(result.final_tier.level()).or_default() += 1;
        }

        let mut summary = Self {
            fault_type,
            mode,
            total_trials,
            successful,
            failed: total_trials - successful,
            success_rate: percent(successful, total_trials),
            tier_distribution,
            avg_boot_time_s: None,
            min_boot_time_s: None,
            max_boot_time_s: None,
            degraded_count: None,
            degradation_rate: None,
            avg_mttd_s: None,
            min_mttd_s: None,
            max_mttd_s: None,
            recovery_count: None,
            recovery_rate: None,
            avg_mttr_s: None,
            min_mttr_s: None,
            max_mttr_s: None,
        };

        match mode {
            TrialMode::Boot => {
                let boot_times: Vec<f64> = results.iter().map(|result| result.boot_time_s).collect();
                if let Some(stats) = Stats::of(&boot_times) {
                    summary.avg_boot_time_s = Some(stats.mean);
                    summary.min_boot_time_s = Some(stats.min);
                    summary.max_boot_time_s = Some(stats.max);
                }
            }
            TrialMode::Runtime => {
                let degraded = results.iter().filter(|result| result.degraded).count();
                summary.degraded_count = Some(degraded);
                summary.degradation_rate = Some(percent(degraded, total_trials));
                let mttd: Vec<f64> = results.iter().filter_map(|result| result.mttd_s).collect();
                if let Some(stats) = Stats::of(&mttd) {
                    summary.avg_mttd_s = Some(stats.mean);
                    summary.min_mttd_s = Some(stats.min);
                    summary.max_mttd_s = Some(stats.max);
                }
                if recovery_tested {
                    let recovered = results
                        .iter()
                        .filter(|result| result.recovery.as_ref().is_some_and(|r| r.recovered))
                        .count();
                    summary.recovery_count = Some(recovered);
                    summary.recovery_rate = Some(percent(recovered, total_trials));
                    let mttr: Vec<f64> = results
                        .iter()
                        .filter_map(|result| result.recovery.as_ref().and_then(|r| r.mttr_s))
                        .collect();
                    if let Some(stats) = Stats::of(&mttr) {
                        summary.avg_mttr_s = Some(stats.mean);
                        summary.min_mttr_s = Some(stats.min);
                        summary.max_mttr_s = Some(stats.max);
                    }
                }
            }
        }
        summary
    }
}

/// Provenance block of a persisted result document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Experiment name.
    pub experiment: String,
    /// Campaign fault name, or `chaos`.
    pub fault_type: String,
    /// `boot`, `runtime` or `chaos`.
    pub mode: String,
    /// Whether recovery was exercised.
    #[serde(default)]
    pub recovery_tested: bool,
    /// Time the document was written.
    pub timestamp: DateTime<Utc>,
}

impl ResultMetadata {
    /// Metadata stamped with the current time.
    #[must_use]
    pub fn now(fault_type: impl Into<String>, mode: impl Into<String>, recovery_tested: bool) -> Self {
        Self {
            experiment: EXPERIMENT_NAME.to_owned(),
            fault_type: fault_type.into(),
            mode: mode.into(),
            recovery_tested,
            timestamp: Utc::now(),
        }
    }
}

/// Persisted document for one campaign.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CampaignDocument {
    /// Provenance.
    pub metadata: ResultMetadata,
    /// Aggregate.
    pub summary: CampaignSummary,
    /// Trials in order.
    pub results: Vec<TrialResult>,
}

/// Directory of persisted result documents.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `doc` as `<prefix>_<key>_<timestamp>.json`, plus the
    /// `<prefix>_<key>_latest.json` alias when `with_latest`.
    pub fn write<T: Serialize>(&self, key: &str, doc: &T, with_latest: bool) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("{RESULT_PREFIX}_{key}_{stamp}.json"));
        write_json(&path, doc)?;
        if with_latest {
            write_json(&self.dir.join(format!("{RESULT_PREFIX}_{key}{LATEST_SUFFIX}")), doc)?;
        }
        info!(target: LOG_TARGET, "results saved: {}", path.display());
        Ok(path)
    }

    /// Persist a campaign under its fault and mode.
    pub fn write_campaign(&self, doc: &CampaignDocument) -> Result<PathBuf> {
        let key = format!("{}_{}", doc.summary.fault_type, doc.summary.mode);
        self.write(&key, doc, true)
    }

    /// `_latest` aliases, newest first, at most `limit`.
    pub fn latest_files(&self, limit: usize) -> Result<Vec<PathBuf>> {
        self.scan(limit, SystemTime::UNIX_EPOCH, |name| name.ends_with(LATEST_SUFFIX))
    }

    /// Campaign aliases and chaos documents modified at or after `since`,
    /// newest first, at most `limit`.
    pub fn recent_files(&self, limit: usize, since: SystemTime) -> Result<Vec<PathBuf>> {
        let chaos = format!("{RESULT_PREFIX}_chaos_");
        self.scan(limit, since, |name| {
            name.ends_with(LATEST_SUFFIX) || name.starts_with(&chaos)
        })
    }

    fn scan(
        &self,
        limit: usize,
        since: SystemTime,
        keep: impl Fn(&str) -> bool,
    ) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<(SystemTime, PathBuf)> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_name().to_str().is_some_and(|name| {
                    name.starts_with(RESULT_PREFIX) && name.ends_with(".json") && keep(name)
                })
            })
            .filter_map(|entry| {
                let modified = entry.metadata().and_then(|meta| meta.modified()).ok()?;
                (modified >= since).then(|| (modified, entry.path()))
            })
            .collect();
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(files.into_iter().take(limit).map(|(_, path)| path).collect())
    }

    /// Load any persisted document.
    pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

fn write_json<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, doc)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// How a campaign runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CampaignPlan {
    /// Trials to run.
    pub iterations: usize,
    /// Boot-time or runtime.
    pub mode: TrialMode,
    /// Whether runtime trials exercise recovery.
    pub recovery: bool,
    /// Tier runtime trials boot to before injecting.
    pub target_tier: Tier,
}

impl CampaignPlan {
    /// Boot-time campaign of `iterations` trials.
    #[must_use]
    pub const fn boot(iterations: usize) -> Self {
        Self {
            iterations,
            mode: TrialMode::Boot,
            recovery: false,
            target_tier: Tier::T3,
        }
    }

    /// Runtime campaign of `iterations` trials.
    #[must_use]
    pub const fn runtime(iterations: usize, recovery: bool) -> Self {
        Self {
            iterations,
            mode: TrialMode::Runtime,
            recovery,
            target_tier: Tier::T3,
        }
    }
}

/// Run `plan.iterations` trials of `fault` strictly one after another,
/// summarise them, and persist the document.
pub fn run_campaign<R: Rng>(
    runner: &mut TrialRunner<'_, R>,
    store: &ResultStore,
    fault: FaultType,
    plan: CampaignPlan,
) -> Result<CampaignDocument> {
    let config = runner.config();
    let started = Instant::now();
    info!(
        target: LOG_TARGET,
        "{} campaign: {fault}, {} trials{}",
        plan.mode,
        plan.iterations,
        if plan.recovery { ", with recovery" } else { "" }
    );

    if plan.mode == TrialMode::Boot {
        info!(target: LOG_TARGET, "[campaign init] resetting journals to a clean state");
        tools::reset_journals(config)?;
        tools::rebuild_image_best_effort(config);
    }

    let mut results = Vec::with_capacity(plan.iterations);
    for index in 1..=plan.iterations {
        let trial_started = Instant::now();
        let result = match plan.mode {
            TrialMode::Boot => runner.run_boot_trial(fault, index),
            TrialMode::Runtime => {
                runner.run_runtime_trial(fault, index, plan.target_tier, plan.recovery)
            }
        };
        results.push(result);
        log_progress(&results, plan.iterations, trial_started, started);
        if index < plan.iterations {
            thread::sleep(config.timing.trial_delay);
        }
    }

    let summary = CampaignSummary::from_results(fault, plan.mode, &results, plan.recovery);
    info!(
        target: LOG_TARGET,
        "campaign complete: {fault} {}: {}/{} successful ({:.1}%) in {:.1} min",
        plan.mode,
        summary.successful,
        summary.total_trials,
        summary.success_rate,
        started.elapsed().as_secs_f64() / 60.0
    );
    let doc = CampaignDocument {
        metadata: ResultMetadata::now(fault.as_str(), plan.mode.as_str(), plan.recovery),
        summary,
        results,
    };
    store.write_campaign(&doc)?;
    Ok(doc)
}

fn log_progress(results: &[TrialResult], total: usize, trial_started: Instant, started: Instant) {
    let done = results.len();
    let successes = results.iter().filter(|result| result.success).count();
    let elapsed = started.elapsed().as_secs_f64();
    let remaining = elapsed / done as f64 * (total - done) as f64;
    info!(
        target: LOG_TARGET,
        "progress {done}/{total}: success {successes}/{done} ({:.1}%), trial {:.1}s, elapsed {:.1} min, remaining ~{:.1} min",
        percent(successes, done),
        trial_started.elapsed().as_secs_f64(),
        elapsed / 60.0,
        remaining / 60.0
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_over_empty_sample_are_absent() {
        assert_eq!(Stats::of(&[]), None);
        let stats = Stats::of(&[2.0, 4.0, 6.0]).expect("stats");
        assert_eq!(stats, Stats { mean: 4.0, min: 2.0, max: 6.0 });
    }

    #[test]
    fn percent_of_nothing_is_zero() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
