// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Run trials, campaigns and chaos scenarios end to end against fake launchers.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use faultlab::campaign::{run_campaign, CampaignDocument, CampaignPlan, ResultStore};
use faultlab::chaos::{run_chaos_trial, ChaosScenario};
use faultlab::config::{FaultlabConfig, ECC_FLAG_FILE};
use faultlab::fault::{FaultDetail, FaultKind, FaultType};
use faultlab::trial::{TrialMode, TrialRunner};
use faultlab::Tier;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn fast_lab(root: &Path, boot_body: &str) -> Result<FaultlabConfig> {
    let mut config = FaultlabConfig::for_root(root);
    config.paths.boot_script = root.join("boot.sh");
    config.paths.backup_dir = root.join("backups");
    config.paths.results_dir = root.join("results");
    config.paths.journal_tool = root.join("no-journal-tool");
    config.paths.rootfs_journal = root.join("rootfs/journal.bin");
    config.paths.var_journal = root.join("var/journal.bin");
    config.paths.restore_dirs = vec![root.join("rootfs")];
    config.image.rootfs_dir = root.join("no-rootfs");
    config.image.image_dir = root.join("image");
    config.flag_dir = root.join("flags");
    config.cleanup.process_names.clear();
    config.cleanup.scratch_patterns.clear();
    config.verifier.command = vec!["true".to_owned()];
    config.verifier.match_pattern = "faultlab-test-absent-verifier".to_owned();
    config.verifier.startup_wait = Duration::ZERO;

    let timing = &mut config.timing;
    timing.boot_window = ms(1_500);
    timing.chaos_boot_window = ms(1_500);
    timing.boot_timeout = ms(5_000);
    timing.runtime_settle = ms(200);
    timing.chaos_settle = ms(200);
    timing.detection_delay = Duration::ZERO;
    timing.degradation_window = ms(2_000);
    timing.chaos_degradation_window = ms(2_000);
    timing.process_recovery_window = ms(3_000);
    timing.hardware_recovery_window = ms(3_000);
    timing.heartbeat = ms(500);
    timing.stop_grace = ms(100);
    timing.cleanup_settle = Duration::ZERO;
    timing.trial_delay = Duration::ZERO;
    timing.cascade_delay = ms(10)..=ms(20);

    fs::create_dir_all(&config.flag_dir)?;
    fs::create_dir_all(root.join("rootfs"))?;
    fs::write(&config.paths.boot_script, format!("#!/bin/sh\n{boot_body}\n"))?;
    fs::set_permissions(&config.paths.boot_script, fs::Permissions::from_mode(0o755))?;
    Ok(config)
}

fn leftover_backups(config: &FaultlabConfig) -> Result<usize> {
    if !config.paths.backup_dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in fs::read_dir(&config.paths.backup_dir)? {
        if entry?.file_name().to_string_lossy().ends_with(".bak") {
            count += 1;
        }
    }
    Ok(count)
}

const DEGRADING_BOOT: &str = "echo 'Tier 3 established'\nsleep 1\necho 'Current Tier: 1'\nsleep 10";

#[test]
fn runtime_trial_reports_degradation_and_detection_time() -> Result<()> {
    let dir = TempDir::new()?;
    let config = fast_lab(dir.path(), DEGRADING_BOOT)?;
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(11));

    let result = runner.run_runtime_trial(FaultType::Ecc, 1, Tier::T3, false);
    assert_eq!(result.error, None);
    assert_eq!(result.mode, TrialMode::Runtime);
    assert_eq!(result.initial_tier, Some(Tier::T3));
    assert_eq!(result.final_tier, Tier::T1);
    assert!(result.degraded);
    assert!(result.success);
    let mttd = result.mttd_s.expect("tier change observed");
    assert!(mttd > 0.3 && mttd < 2.0, "mttd {mttd}");
    assert_eq!(result.fault.as_ref().map(|fault| fault.kind()), Some(FaultKind::Ecc));
    assert_eq!(result.recovery, None);
    assert!(result.output_lines >= 2);
    assert!(!config.flag_path(ECC_FLAG_FILE).exists());
    Ok(())
}

#[test]
fn runtime_trial_with_recovery_measures_the_climb_back() -> Result<()> {
    let dir = TempDir::new()?;
    let config = fast_lab(
        dir.path(),
        "echo 'Tier 3 established'\nsleep 1\necho 'Current Tier: 1'\nsleep 2.5\necho 'Tier 2 established'\nsleep 10",
    )?;
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(12));

    let result = runner.run_runtime_trial(FaultType::Storage, 1, Tier::T3, true);
    assert_eq!(result.error, None);
    assert_eq!(result.final_tier, Tier::T1);
    let recovery = result.recovery.expect("recovery exercised");
    assert!(recovery.recovered);
    assert_eq!(recovery.recovery_tier, Tier::T2);
    assert!(recovery.mttr_s.is_some_and(|mttr| mttr > 0.0));
    Ok(())
}

#[test]
fn runtime_trial_without_any_tier_is_a_captured_failure() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = fast_lab(dir.path(), "sleep 30")?;
    config.timing.boot_timeout = ms(500);
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(13));

    let result = runner.run_runtime_trial(FaultType::Watchdog, 1, Tier::T3, false);
    assert_eq!(result.final_tier, Tier::Failed);
    assert!(!result.success);
    assert!(result.fault.is_none());
    assert!(result.error.is_some_and(|err| err.contains("timed out")));
    Ok(())
}

#[test]
fn boot_trial_takes_the_last_observed_tier() -> Result<()> {
    let dir = TempDir::new()?;
    let config = fast_lab(dir.path(), "echo 'Tier 1 operational'\necho 'Tier 2 established'")?;
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(14));

    let result = runner.run_boot_trial(FaultType::Temperature, 1);
    assert_eq!(result.mode, TrialMode::Boot);
    assert_eq!(result.final_tier, Tier::T2);
    assert!(result.success);
    assert!(result.boot_time_s < 1.5);
    assert_eq!(
        result.fault.as_ref().map(|fault| fault.kind()),
        Some(FaultKind::Temperature)
    );
    assert_eq!(result.tier_history.len(), 2);
    Ok(())
}

#[test]
fn verifier_kill_cannot_precede_boot() -> Result<()> {
    let dir = TempDir::new()?;
    let config = fast_lab(dir.path(), "echo 'Tier 3 established'")?;
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(15));

    let result = runner.run_boot_trial(FaultType::VerifierKill, 1);
    assert_eq!(result.final_tier, Tier::Failed);
    assert!(result.error.is_some_and(|err| err.contains("runtime")));
    Ok(())
}

#[test]
fn boot_campaign_persists_summary_and_latest_alias() -> Result<()> {
    let dir = TempDir::new()?;
    let config = fast_lab(dir.path(), "echo 'Tier 3 established'")?;
    let store = ResultStore::new(&config.paths.results_dir);
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(16));

    let doc = run_campaign(&mut runner, &store, FaultType::Ecc, CampaignPlan::boot(2))?;
    let summary = &doc.summary;
    assert_eq!(summary.total_trials, 2);
    assert_eq!(summary.successful + summary.failed, summary.total_trials);
    assert_eq!(summary.tier_distribution.values().sum::<usize>(), summary.total_trials);
    assert_eq!(summary.tier_distribution[&3], 2);
    assert!(summary.avg_boot_time_s.is_some());
    assert_eq!(summary.degraded_count, None);

    let latest = store.latest_files(10)?;
    assert_eq!(latest.len(), 1);
    assert!(latest[0].ends_with("faultlab_results_ecc_boot_latest.json"));
    let loaded: CampaignDocument = ResultStore::load(&latest[0])?;
    assert_eq!(loaded.results.len(), 2);
    assert_eq!(loaded.metadata.fault_type, "ecc");
    assert_eq!(loaded.summary.total_trials, 2);
    Ok(())
}

#[test]
fn chaos_runtime_scenario_records_every_fault() -> Result<()> {
    let dir = TempDir::new()?;
    let config = fast_lab(dir.path(), DEGRADING_BOOT)?;
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(17));

    let result = run_chaos_trial(&mut runner, 1, ChaosScenario::RuntimeCascade);
    assert_eq!(result.error, None);
    assert!((2..=3).contains(&result.faults_injected.len()));
    assert_eq!(result.faults.len(), result.faults_injected.len());
    assert!(result.faults_injected.iter().all(|fault| fault.is_runtime()));
    assert_eq!(result.initial_tier, Some(Tier::T3));
    assert_eq!(result.final_tier, Tier::T1);
    assert!(result.degraded);
    Ok(())
}

#[test]
fn power_cut_kills_the_first_boot_and_measures_the_second() -> Result<()> {
    let dir = TempDir::new()?;
    let marker = dir.path().join("first-boot");
    let boot = format!(
        "if [ -f '{marker}' ]; then\n  echo 'Tier 3 established'\nelse\n  : > '{marker}'\n  echo 'Tier 1 operational'\n  sleep 10\nfi",
        marker = marker.display()
    );
    let mut config = fast_lab(dir.path(), &boot)?;
    config.timing.power_cut_delay = ms(100)..=ms(150);
    config.timing.power_cut_settle = Duration::ZERO;
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(18));

    let result = runner.run_boot_trial_within(FaultType::PowerCut, 1, ms(1_500));
    assert_eq!(result.error, None);
    let fault = result.fault.as_ref().expect("power cut recorded");
    assert_eq!(fault.kind(), FaultKind::PowerCut);
    let FaultDetail::PowerCut { delay_s } = fault.detail else {
        panic!("unexpected detail {:?}", fault.detail);
    };
    assert!((0.1..=0.15).contains(&delay_s), "delay {delay_s}");
    assert!(marker.exists());
    assert_eq!(result.final_tier, Tier::T3);
    assert!(result.success);
    assert_eq!(result.tier_history.first_seen(Tier::T1), None);
    Ok(())
}

#[test]
fn signature_trial_restores_the_fit_image() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = fast_lab(dir.path(), "echo 'Tier 2 established'")?;
    config.paths.fit_image = dir.path().join("boot/fit/fit.itb");
    config.paths.restore_dirs.push(dir.path().join("boot/fit"));
    fs::create_dir_all(dir.path().join("boot/fit"))?;
    let original: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    fs::write(&config.paths.fit_image, &original)?;
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(19));

    let result = runner.run_boot_trial(FaultType::Signature, 1);
    assert_eq!(result.error, None);
    assert_eq!(
        result.fault.as_ref().map(|fault| fault.kind()),
        Some(FaultKind::SignatureCorruption)
    );
    assert_eq!(result.final_tier, Tier::T2);
    assert_eq!(fs::read(&config.paths.fit_image)?, original);
    assert_eq!(leftover_backups(&config)?, 0);
    Ok(())
}

#[test]
fn signature_trial_creates_a_blank_fit_image_when_missing() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = fast_lab(dir.path(), "echo 'Tier 1 operational'")?;
    config.paths.fit_image = dir.path().join("boot/fit/fit.itb");
    config.paths.restore_dirs.push(dir.path().join("boot/fit"));
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(20));

    let result = runner.run_boot_trial(FaultType::Signature, 1);
    assert_eq!(result.error, None);
    assert_eq!(
        result.fault.as_ref().map(|fault| fault.kind()),
        Some(FaultKind::SignatureCorruption)
    );
    assert_eq!(fs::read(&config.paths.fit_image)?, vec![0u8; 4096]);
    assert_eq!(leftover_backups(&config)?, 0);
    Ok(())
}

const FAKE_JOURNAL_TOOL: &str = r#"#!/bin/sh
case "$1" in
  init) echo header > "$2" ;;
  read)
    if grep -q BROWNOUT "$2"; then
      printf 'Flags: 0x00000004\nBROWNOUT\n'
    else
      printf 'Flags: 0x00000000\n'
    fi ;;
  set-flag) echo "$2" | tr 'a-z' 'A-Z' >> "$3" ;;
  clear-flag)
    name=$(echo "$2" | tr 'a-z' 'A-Z')
    grep -v "^$name\$" "$3" > "$3.tmp"
    mv "$3.tmp" "$3" ;;
  reset-tries) ;;
  *) exit 2 ;;
esac
"#;

#[test]
fn brownout_trial_restores_the_packaged_journal() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = fast_lab(dir.path(), "echo 'Tier 1 operational'")?;
    config.paths.journal_tool = dir.path().join("journal_tool");
    fs::write(&config.paths.journal_tool, FAKE_JOURNAL_TOOL)?;
    fs::set_permissions(&config.paths.journal_tool, fs::Permissions::from_mode(0o755))?;
    fs::write(&config.paths.rootfs_journal, "header\n")?;
    let mut runner = TrialRunner::new(&config, StdRng::seed_from_u64(21));

    let result = runner.run_boot_trial(FaultType::Brownout, 1);
    assert_eq!(result.error, None);
    let fault = result.fault.as_ref().expect("brownout recorded");
    assert_eq!(fault.kind(), FaultKind::BrownoutFlag);
    assert!(matches!(fault.detail, FaultDetail::BrownoutFlag { verified: true, .. }));
    assert_eq!(result.final_tier, Tier::T1);
    assert_eq!(fs::read_to_string(&config.paths.rootfs_journal)?, "header\n");
    assert_eq!(leftover_backups(&config)?, 0);
    Ok(())
}
