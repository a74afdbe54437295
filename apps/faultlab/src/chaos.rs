// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Compose random single and cascading fault scenarios per trial.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::thread;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tier_model::{Tier, TierObservation};

use crate::campaign::{percent, ResultMetadata, ResultStore};
use crate::fault::{FaultRecord, FaultType};
use crate::supervisor::ObservePlan;
use crate::trial::{secs, DegradationOutcome, TrialRunner};
use crate::{Result, LOG_TARGET};

/// Number of cascading faults is drawn from this range.
pub const CASCADE_FAULTS: std::ops::RangeInclusive<usize> = 2..=3;

/// Shape of one chaos trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosScenario {
    /// One boot-time fault, then a boot.
    BootFaultOnly,
    /// Boot to tier 3, then one runtime fault.
    RuntimeSingle,
    /// Boot to tier 3, then two or three runtime faults with random gaps.
    RuntimeCascade,
}

impl ChaosScenario {
    /// Every scenario, in draw order.
    pub const ALL: [ChaosScenario; 3] = [
        ChaosScenario::BootFaultOnly,
        ChaosScenario::RuntimeSingle,
        ChaosScenario::RuntimeCascade,
    ];

    /// Pick a scenario uniformly.
    pub fn draw<R: Rng>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }

    /// Name used in result files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BootFaultOnly => "boot_fault_only",
            Self::RuntimeSingle => "runtime_single",
            Self::RuntimeCascade => "runtime_cascade",
        }
    }
}

impl fmt::Display for ChaosScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one chaos trial.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChaosTrialResult {
    /// 1-based trial index.
    pub trial: usize,
    /// Scenario drawn.
    pub scenario: ChaosScenario,
    /// Faults actually injected, in order.
    pub faults_injected: Vec<FaultType>,
    /// Injection records, in order.
    pub faults: Vec<FaultRecord>,
    /// Tier when the first runtime fault hit.
    pub initial_tier: Option<Tier>,
    /// Tier at the end of the window.
    pub final_tier: Tier,
    /// Boot scenario: tier >= 1. Runtime scenarios: booted without error.
    pub success: bool,
    /// Runtime scenarios: final tier below initial tier.
    pub degraded: bool,
    /// Runtime scenarios: seconds from the first fault to the first change.
    pub mttd_s: Option<f64>,
    /// Failure captured instead of aborting the run.
    pub error: Option<String>,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate over a chaos run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChaosSummary {
    /// Always `chaos`.
    pub fault_type: String,
    /// Trials run.
    pub total_trials: usize,
    /// Trials marked successful.
    pub successful: usize,
    /// Trials not marked successful.
    pub failed: usize,
    /// Successful share in percent.
    pub success_rate: f64,
    /// Trials that ended below their initial tier.
    pub degraded_count: usize,
    /// Trial count per scenario.
    pub scenarios: BTreeMap<ChaosScenario, usize>,
}

impl ChaosSummary {
    /// Project a summary out of `results`.
    #[must_use]
    pub fn from_results(results: &[ChaosTrialResult]) -> Self {
        let total_trials = results.len();
        let successful = results.iter().filter(|result| result.success).count();
        let mut scenarios = BTreeMap::new();
        for result in results {
            *scenarios.entry(result.scenario).or_insert(0) += 1;
        }
        Self {
            fault_type: "chaos".to_owned(),
            total_trials,
            successful,
            failed: total_trials - successful,
            success_rate: percent(successful, total_trials),
            degraded_count: results.iter().filter(|result| result.degraded).count(),
            scenarios,
        }
    }
}

/// Persisted document for a chaos run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChaosDocument {
    /// Provenance.
    pub metadata: ResultMetadata,
    /// Aggregate.
    pub summary: ChaosSummary,
    /// Trials in order.
    pub results: Vec<ChaosTrialResult>,
}

/// Run `iterations` chaos trials and persist them as one document.
pub fn run_chaos<R: Rng>(
    runner: &mut TrialRunner<'_, R>,
    store: &ResultStore,
    iterations: usize,
) -> Result<(ChaosDocument, PathBuf)> {
    let mut results = Vec::with_capacity(iterations);
    for index in 1..=iterations {
        let scenario = ChaosScenario::draw(runner.rng());
        info!(target: LOG_TARGET, "chaos trial {index}/{iterations}: {scenario}");
        let result = run_chaos_trial(runner, index, scenario);
        info!(
            target: LOG_TARGET,
            "chaos trial {index} complete: {:?} -> tier {}",
            result.faults_injected.iter().map(|fault| fault.as_str()).collect::<Vec<_>>(),
            result.final_tier
        );
        results.push(result);
    }
    let doc = ChaosDocument {
        metadata: ResultMetadata::now("chaos", "chaos", false),
        summary: ChaosSummary::from_results(&results),
        results,
    };
    let path = store.write("chaos", &doc, false)?;
    info!(target: LOG_TARGET, "chaos experiments complete: {}", path.display());
    Ok((doc, path))
}

/// Run one chaos trial of the given scenario.
pub fn run_chaos_trial<R: Rng>(
    runner: &mut TrialRunner<'_, R>,
    index: usize,
    scenario: ChaosScenario,
) -> ChaosTrialResult {
    match scenario {
        ChaosScenario::BootFaultOnly => boot_fault_only(runner, index),
        ChaosScenario::RuntimeSingle => runtime_faults(runner, index, scenario, 1),
        ChaosScenario::RuntimeCascade => {
            let count = runner.rng().gen_range(CASCADE_FAULTS);
            runtime_faults(runner, index, scenario, count)
        }
    }
}

fn pick<R: Rng>(rng: &mut R, faults: &[FaultType]) -> FaultType {
    faults[rng.gen_range(0..faults.len())]
}

fn boot_fault_only<R: Rng>(runner: &mut TrialRunner<'_, R>, index: usize) -> ChaosTrialResult {
    let fault = pick(runner.rng(), &FaultType::BOOT_TIME);
    info!(target: LOG_TARGET, "  boot fault: {fault}");
    let window = runner.config().timing.chaos_boot_window;
    let trial = runner.run_boot_trial_within(fault, index, window);
    ChaosTrialResult {
        trial: index,
        scenario: ChaosScenario::BootFaultOnly,
        faults_injected: vec![fault],
        faults: trial.fault.into_iter().collect(),
        initial_tier: None,
        final_tier: trial.final_tier,
        success: trial.success,
        degraded: false,
        mttd_s: None,
        error: trial.error,
        timestamp: trial.timestamp,
    }
}

fn runtime_faults<R: Rng>(
    runner: &mut TrialRunner<'_, R>,
    index: usize,
    scenario: ChaosScenario,
    count: usize,
) -> ChaosTrialResult {
    let mut result = ChaosTrialResult {
        trial: index,
        scenario,
        faults_injected: Vec::new(),
        faults: Vec::new(),
        initial_tier: None,
        final_tier: Tier::Failed,
        success: false,
        degraded: false,
        mttd_s: None,
        error: None,
        timestamp: Utc::now(),
    };
    runner.cleanup();
    if let Err(err) = runtime_body(runner, count, &mut result) {
        warn!(target: LOG_TARGET, "chaos trial {index} failed: {err}");
        result.final_tier = Tier::Failed;
        result.success = false;
        result.error = Some(err.to_string());
    }
    runner.restore(&result.faults_injected);
    result.timestamp = Utc::now();
    result
}

/// Boot to tier 3, inject `count` runtime faults and watch the degradation window.
///
/// Cascade gaps separate consecutive faults only; the window opens right after the last one.
fn runtime_body<R: Rng>(
    runner: &mut TrialRunner<'_, R>,
    count: usize,
    result: &mut ChaosTrialResult,
) -> Result<()> {
    let timing = &runner.config().timing;
    info!(target: LOG_TARGET, "  booting to tier 3");
    let (mut supervisor, initial) = runner.boot_to_target(Tier::T3, timing.chaos_settle)?;
    result.initial_tier = Some(initial);

    let onset = supervisor.elapsed();
    for step in 0..count {
        if step > 0 {
            let gap = runner.rng().gen_range(timing.cascade_delay.clone());
            thread::sleep(gap);
        }
        let fault = pick(runner.rng(), &FaultType::RUNTIME);
        info!(target: LOG_TARGET, "  {}. {fault}", step + 1);
        let record = runner.inject_runtime(fault)?;
        result.faults_injected.push(fault);
        result.faults.push(record);
    }

    let plan = ObservePlan::window(timing.chaos_degradation_window)
        .seeded(TierObservation::new(onset, initial));
    let window = supervisor.observe(&plan);
    supervisor.hard_kill();
    let outcome = DegradationOutcome::from_window(initial, &window.history);
    result.final_tier = outcome.final_tier;
    result.degraded = outcome.degraded;
    result.mttd_s = outcome.mttd.map(secs);
    result.success = initial.is_operational();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn draws_cover_every_scenario() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = BTreeMap::new();
        for _ in 0..200 {
            *seen.entry(ChaosScenario::draw(&mut rng)).or_insert(0) += 1;
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn summary_counts_scenarios() {
        let result = |scenario, success| ChaosTrialResult {
            trial: 1,
            scenario,
            faults_injected: vec![FaultType::Ecc],
            faults: Vec::new(),
            initial_tier: Some(Tier::T3),
            final_tier: Tier::T2,
            success,
            degraded: true,
            mttd_s: Some(1.0),
            error: None,
            timestamp: Utc::now(),
        };
        let summary = ChaosSummary::from_results(&[
            result(ChaosScenario::RuntimeSingle, true),
            result(ChaosScenario::RuntimeSingle, false),
            result(ChaosScenario::RuntimeCascade, true),
        ]);
        assert_eq!(summary.successful + summary.failed, summary.total_trials);
        assert_eq!(summary.scenarios[&ChaosScenario::RuntimeSingle], 2);
        assert_eq!(summary.degraded_count, 3);
    }
}
