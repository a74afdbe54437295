// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Run single boot-time and runtime fault trials through their phases.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tier_model::{Tier, TierHistory, TierObservation};

use crate::config::FaultlabConfig;
use crate::fault::{FaultDetail, FaultRecord, FaultType};
use crate::inject::Injector;
use crate::supervisor::{cleanup_environment, BootSupervisor, ObservePlan};
use crate::tools;
use crate::verifier::VerifierService;
use crate::{FaultlabError, Result, LOG_TARGET};

/// Whether faults hit before launch or after the target tier is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialMode {
    /// Fault applied before the boot launcher starts.
    Boot,
    /// Fault applied to a running system.
    Runtime,
}

impl TrialMode {
    /// Name used in result files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for TrialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery sub-result of a runtime trial.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    /// Whether a higher tier than the degraded one was observed.
    pub recovered: bool,
    /// Tier at the end of the recovery window.
    pub recovery_tier: Tier,
    /// Recovery-window span, only when recovered.
    pub mttr_s: Option<f64>,
}

/// Outcome of one trial. Written once, never mutated after persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    /// 1-based trial index within the campaign.
    pub trial: usize,
    /// Campaign fault name.
    pub fault_type: FaultType,
    /// Boot-time or runtime.
    pub mode: TrialMode,
    /// Tier a runtime trial boots to before injecting.
    pub target_tier: Option<Tier>,
    /// The injection, if it happened.
    pub fault: Option<FaultRecord>,
    /// Tier at injection time (runtime trials).
    pub initial_tier: Option<Tier>,
    /// Tier at the end of the observation window.
    pub final_tier: Tier,
    /// Seconds until the reported tier was first reached.
    pub boot_time_s: f64,
    /// Boot-time: tier >= 1. Runtime: booted and ran without error.
    pub success: bool,
    /// Runtime: final tier below initial tier.
    pub degraded: bool,
    /// Runtime: seconds from injection to the first tier change.
    pub mttd_s: Option<f64>,
    /// Runtime: recovery window outcome.
    pub recovery: Option<RecoveryResult>,
    /// Tier history over the supervised lifetime.
    pub tier_history: TierHistory,
    /// Console lines read.
    pub output_lines: usize,
    /// Wall-clock trial length in seconds.
    pub total_trial_time_s: f64,
    /// Failure captured instead of aborting the campaign.
    pub error: Option<String>,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

impl TrialResult {
    fn new(trial: usize, fault_type: FaultType, mode: TrialMode) -> Self {
        Self {
            trial,
            fault_type,
            mode,
            target_tier: None,
            fault: None,
            initial_tier: None,
            final_tier: Tier::Failed,
            boot_time_s: 0.0,
            success: false,
            degraded: false,
            mttd_s: None,
            recovery: None,
            tier_history: TierHistory::new(),
            output_lines: 0,
            total_trial_time_s: 0.0,
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn fail(&mut self, err: &FaultlabError) {
        self.final_tier = Tier::Failed;
        self.success = false;
        self.error = Some(err.to_string());
    }

    fn absorb(&mut self, supervisor: &BootSupervisor) {
        self.tier_history = supervisor.history().clone();
        self.output_lines = supervisor.lines();
    }
}

/// Tier movement seen in a degradation window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DegradationOutcome {
    /// Tier at injection time.
    pub initial_tier: Tier,
    /// Tier at the end of the window.
    pub final_tier: Tier,
    /// Whether the system ended below where it started.
    pub degraded: bool,
    /// Time between the first and second distinct observations.
    pub mttd: Option<Duration>,
}

impl DegradationOutcome {
    /// Evaluate a window whose history starts at the injection.
    #[must_use]
    pub fn from_window(initial_tier: Tier, window: &TierHistory) -> Self {
        let final_tier = window.current().unwrap_or(initial_tier);
        Self {
            initial_tier,
            final_tier,
            degraded: final_tier < initial_tier,
            mttd: window.first_transition(),
        }
    }
}

/// Tier movement seen in a recovery window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Tier the window started from.
    pub degraded_tier: Tier,
    /// Tier at the end of the window.
    pub recovery_tier: Tier,
    /// Whether the system climbed above the degraded tier.
    pub recovered: bool,
    /// Window span, only when recovered.
    pub mttr: Option<Duration>,
}

impl RecoveryOutcome {
    /// Evaluate a window whose history starts at the degraded tier.
    #[must_use]
    pub fn from_window(degraded_tier: Tier, window: &TierHistory) -> Self {
        let recovery_tier = window.current().unwrap_or(degraded_tier);
        let recovered = recovery_tier > degraded_tier;
        Self {
            degraded_tier,
            recovery_tier,
            recovered,
            mttr: if recovered { window.span() } else { None },
        }
    }

    fn to_result(self) -> RecoveryResult {
        RecoveryResult {
            recovered: self.recovered,
            recovery_tier: self.recovery_tier,
            mttr_s: self.mttr.map(secs),
        }
    }
}

/// Boot time for a boot-time trial: when the final tier first appeared,
/// or the whole window when nothing operational was seen.
#[must_use]
pub fn boot_time(history: &TierHistory, final_tier: Tier, elapsed: Duration) -> Duration {
    if final_tier.is_operational() {
        history.first_seen(final_tier).unwrap_or(elapsed)
    } else {
        elapsed
    }
}

pub(crate) fn secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Drives trials one at a time against the shared lab state.
#[derive(Debug)]
pub struct TrialRunner<'a, R> {
    config: &'a FaultlabConfig,
    injector: Injector<'a>,
    verifier: VerifierService,
    rng: R,
}

impl<'a, R: Rng> TrialRunner<'a, R> {
    /// Runner over `config` drawing fault parameters from `rng`.
    pub fn new(config: &'a FaultlabConfig, rng: R) -> Self {
        Self {
            config,
            injector: Injector::new(config),
            verifier: VerifierService::new(config),
            rng,
        }
    }

    /// Configuration the runner was built with.
    #[must_use]
    pub fn config(&self) -> &'a FaultlabConfig {
        self.config
    }

    /// Random source used for fault parameters.
    pub fn rng(&mut self) -> &mut R {
        &mut self.rng
    }

    /// One boot-time trial observed for the configured boot window.
    pub fn run_boot_trial(&mut self, fault: FaultType, index: usize) -> TrialResult {
        self.run_boot_trial_within(fault, index, self.config.timing.boot_window)
    }

    /// One boot-time trial observed for `window`.
    pub fn run_boot_trial_within(&mut self, fault: FaultType, index: usize, window: Duration) -> TrialResult {
        let started = Instant::now();
        let mut result = TrialResult::new(index, fault, TrialMode::Boot);
        info!(target: LOG_TARGET, "boot-time trial #{index}: {fault}");

        info!(target: LOG_TARGET, "[phase 1] cleanup");
        self.cleanup();

        if let Err(err) = self.boot_phases(fault, window, &mut result) {
            warn!(target: LOG_TARGET, "trial #{index} failed: {err}");
            result.fail(&err);
        }

        info!(target: LOG_TARGET, "[phase 4] restore");
        self.restore(&[fault]);
        self.finish(&mut result, started);
        info!(
            target: LOG_TARGET,
            "trial #{index}: tier {}, boot {:.2}s, success {}",
            result.final_tier,
            result.boot_time_s,
            result.success
        );
        result
    }

    fn boot_phases(&mut self, fault: FaultType, window: Duration, result: &mut TrialResult) -> Result<()> {
        info!(target: LOG_TARGET, "[phase 2] inject {fault}");
        result.fault = self.inject_before_boot(fault)?;

        info!(target: LOG_TARGET, "[phase 3] boot");
        if fault == FaultType::PowerCut {
            result.fault = Some(self.power_cut()?);
        }
        let mut supervisor = BootSupervisor::start(self.config)?;
        let observation = supervisor.observe(&ObservePlan::window(window));
        supervisor.stop();

        let final_tier = observation.final_tier();
        result.final_tier = final_tier;
        result.success = final_tier.is_operational();
        result.boot_time_s = secs(boot_time(supervisor.history(), final_tier, observation.elapsed));
        result.absorb(&supervisor);
        Ok(())
    }

    /// Launch, hard-kill after a random delay, and let the lab settle.
    pub fn power_cut(&mut self) -> Result<FaultRecord> {
        let delay = self.rng.gen_range(self.config.timing.power_cut_delay.clone());
        let mut supervisor = BootSupervisor::start(self.config)?;
        thread::sleep(delay);
        info!(target: LOG_TARGET, "power cut at {:.1}s", secs(delay));
        supervisor.hard_kill();
        thread::sleep(self.config.timing.power_cut_settle);
        Ok(FaultRecord::now(FaultDetail::PowerCut {
            delay_s: secs(delay),
        }))
    }

    /// Apply a fault before launch.
    ///
    /// Journal faults rebuild the boot image so the next boot sees them.
    /// `power_cut` happens during the boot phase and yields no record here.
    /// Flag faults write their sentinels ahead of boot.
    pub fn inject_before_boot(&mut self, fault: FaultType) -> Result<Option<FaultRecord>> {
        let paths = &self.config.paths;
        let record = match fault {
            FaultType::BitFlip => {
                let record = self.injector.inject_journal_crc_corruption(&paths.rootfs_journal)?;
                tools::rebuild_image_best_effort(self.config);
                record
            }
            FaultType::TornWrite => {
                let bytes = self
                    .rng
                    .gen_range(self.config.faults.journal_truncate_bytes.clone());
                let record =
                    self.injector
                        .inject_torn_write(&paths.rootfs_journal, Some(bytes), &mut self.rng)?;
                tools::rebuild_image_best_effort(self.config);
                record
            }
            FaultType::Signature => {
                ensure_fit_image(&paths.fit_image)?;
                self.injector
                    .inject_signature_corruption(&paths.fit_image, None, &mut self.rng)?
            }
            FaultType::Brownout => self.injector.inject_brownout_flag(&paths.rootfs_journal)?,
            FaultType::PowerCut => return Ok(None),
            FaultType::Ecc | FaultType::Watchdog | FaultType::Temperature | FaultType::Storage => {
                self.injector.inject_flag_fault(fault, &mut self.rng)?
            }
            FaultType::VerifierKill => {
                return Err(FaultlabError::injection(
                    &paths.boot_script,
                    "verifier_kill is only meaningful at runtime",
                ))
            }
        };
        Ok(Some(record))
    }

    /// Apply a fault to the running system.
    pub fn inject_runtime(&mut self, fault: FaultType) -> Result<FaultRecord> {
        match fault {
            FaultType::VerifierKill => self.verifier.kill(),
            FaultType::Ecc | FaultType::Watchdog | FaultType::Temperature | FaultType::Storage => {
                self.injector.inject_flag_fault(fault, &mut self.rng)
            }
            other => Err(FaultlabError::injection(
                &self.config.flag_dir,
                format!("{other} is not runtime-compatible"),
            )),
        }
    }

    /// Launch and wait until `target` is held for `settle`.
    ///
    /// Fails when no tier at all was observed within the boot timeout.
    pub fn boot_to_target(&mut self, target: Tier, settle: Duration) -> Result<(BootSupervisor, Tier)> {
        let mut supervisor = BootSupervisor::start(self.config)?;
        let plan = ObservePlan::until_tier(target, settle, self.config.timing.boot_timeout);
        let observation = supervisor.observe(&plan);
        let Some(tier) = supervisor.history().current() else {
            return Err(FaultlabError::TimeoutExceeded {
                what: format!("any tier (target {target})"),
                elapsed: observation.elapsed,
            });
        };
        info!(
            target: LOG_TARGET,
            "booted to tier {tier} in {:.1}s",
            secs(supervisor.history().first_seen(tier).unwrap_or(observation.elapsed))
        );
        Ok((supervisor, tier))
    }

    /// One runtime trial: boot to `target`, inject, watch degradation and
    /// optionally recovery.
    pub fn run_runtime_trial(
        &mut self,
        fault: FaultType,
        index: usize,
        target: Tier,
        test_recovery: bool,
    ) -> TrialResult {
        let started = Instant::now();
        let mut result = TrialResult::new(index, fault, TrialMode::Runtime);
        result.target_tier = Some(target);
        info!(
            target: LOG_TARGET,
            "runtime trial #{index}: {fault} (target tier {target}, recovery {test_recovery})"
        );

        info!(target: LOG_TARGET, "[phase 1] cleanup");
        self.cleanup();

        let mut supervisor = None;
        if let Err(err) = self.runtime_phases(fault, target, test_recovery, &mut result, &mut supervisor) {
            warn!(target: LOG_TARGET, "trial #{index} failed: {err}");
            result.fail(&err);
        }
        if let Some(mut supervisor) = supervisor {
            supervisor.stop();
            result.absorb(&supervisor);
        }

        info!(target: LOG_TARGET, "[phase 6] restore");
        self.restore(&[fault]);
        self.finish(&mut result, started);
        info!(
            target: LOG_TARGET,
            "trial #{index}: tier {} -> {}, degraded {}, mttd {}",
            result.initial_tier.map_or_else(|| "-".to_owned(), |tier| tier.to_string()),
            result.final_tier,
            result.degraded,
            result.mttd_s.map_or_else(|| "n/a".to_owned(), |mttd| format!("{mttd:.2}s"))
        );
        result
    }

    fn runtime_phases(
        &mut self,
        fault: FaultType,
        target: Tier,
        test_recovery: bool,
        result: &mut TrialResult,
        slot: &mut Option<BootSupervisor>,
    ) -> Result<()> {
        info!(target: LOG_TARGET, "[phase 2] boot to tier {target}");
        let (supervisor, initial) = self.boot_to_target(target, self.config.timing.runtime_settle)?;
        let supervisor = slot.insert(supervisor);
        result.initial_tier = Some(initial);
        result.boot_time_s = supervisor.history().first_seen(initial).map_or(0.0, secs);

        info!(target: LOG_TARGET, "[phase 3] inject {fault}");
        let onset = supervisor.elapsed();
        result.fault = Some(self.inject_runtime(fault)?);
        thread::sleep(self.config.timing.detection_delay);

        info!(
            target: LOG_TARGET,
            "[phase 4] monitor degradation ({:.0}s)",
            secs(self.config.timing.degradation_window)
        );
        let plan = ObservePlan::window(self.config.timing.degradation_window)
            .seeded(TierObservation::new(onset, initial));
        let window = supervisor.observe(&plan);
        let degradation = DegradationOutcome::from_window(initial, &window.history);
        result.final_tier = degradation.final_tier;
        result.degraded = degradation.degraded;
        result.mttd_s = degradation.mttd.map(secs);
        result.success = initial.is_operational();

        if test_recovery {
            let recovery_window = if fault.is_process_fault() {
                info!(target: LOG_TARGET, "[phase 5] restart {fault} target and monitor recovery");
                self.verifier.restart();
                self.config.timing.process_recovery_window
            } else {
                info!(target: LOG_TARGET, "[phase 5] clear fault condition and monitor recovery");
                self.injector.clear_fault_flags();
                tools::clear_recovery_blockers(self.config);
                self.config.timing.hardware_recovery_window
            };
            let plan = ObservePlan::window(recovery_window)
                .seeded(TierObservation::new(supervisor.elapsed(), degradation.final_tier));
            let window = supervisor.observe(&plan);
            let recovery = RecoveryOutcome::from_window(degradation.final_tier, &window.history);
            if recovery.recovered {
                info!(
                    target: LOG_TARGET,
                    "recovered {} -> {}",
                    recovery.degraded_tier,
                    recovery.recovery_tier
                );
            } else {
                info!(
                    target: LOG_TARGET,
                    "no recovery above tier {} within {:.0}s",
                    recovery.degraded_tier,
                    secs(recovery_window)
                );
            }
            result.recovery = Some(recovery.to_result());
        }
        Ok(())
    }

    /// Sweep stray processes, scratch files and flag sentinels.
    pub fn cleanup(&self) {
        cleanup_environment(self.config);
        self.injector.clear_fault_flags();
    }

    /// Put back every backup, clear sentinels, and bring the verifier back
    /// if any of `faults` killed it.
    pub fn restore(&self, faults: &[FaultType]) {
        if let Err(err) = self.injector.restore_all() {
            warn!(target: LOG_TARGET, "restore failed: {err}");
        }
        self.injector.clear_fault_flags();
        if faults.iter().any(|fault| fault.is_process_fault()) {
            info!(target: LOG_TARGET, "restarting verifier for the next trial");
            self.verifier.restart();
        }
    }

    fn finish(&self, result: &mut TrialResult, started: Instant) {
        result.total_trial_time_s = secs(started.elapsed());
        result.timestamp = Utc::now();
    }
}

fn ensure_fit_image(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, vec![0u8; 4096])?;
    Ok(())
}
