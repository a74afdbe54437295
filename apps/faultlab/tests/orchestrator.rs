// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Run experiment modes end to end under a scripted verifier and boot launcher.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use faultlab::config::FaultlabConfig;
use faultlab::fault::FaultType;
use faultlab::inject::JOURNAL_LEN;
use faultlab::orchestrator::{ExperimentMode, ExperimentOrchestrator};
use faultlab::verifier::{VerifierLease, VerifierService};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

const VERIFIER: &str = "#!/bin/sh\ntrap 'exit 0' TERM\nwhile :; do sleep 0.1; done\n";

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn write_script(path: &Path, body: &str) -> Result<()> {
    fs::write(path, body)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

fn scripted_lab(root: &Path) -> Result<FaultlabConfig> {
    let mut config = FaultlabConfig::for_root(root);
    config.paths.boot_script = root.join("boot.sh");
    config.paths.backup_dir = root.join("backups");
    config.paths.results_dir = root.join("results");
    config.paths.journal_tool = root.join("no-journal-tool");
    config.paths.rootfs_journal = root.join("rootfs/journal.bin");
    config.paths.var_journal = root.join("var/journal.bin");
    config.paths.fit_image = root.join("boot/fit/fit.itb");
    config.paths.restore_dirs = vec![root.join("rootfs"), root.join("boot/fit")];
    config.image.rootfs_dir = root.join("no-rootfs");
    config.image.image_dir = root.join("image");
    config.flag_dir = root.join("flags");
    config.cleanup.process_names.clear();
    config.cleanup.scratch_patterns.clear();

    let verifier = root.join("fake-verifier.sh");
    write_script(&verifier, VERIFIER)?;
    config.verifier.command = vec![verifier.display().to_string()];
    config.verifier.match_pattern = verifier.display().to_string();
    config.verifier.startup_wait = ms(300);

    let timing = &mut config.timing;
    timing.boot_window = ms(1_500);
    timing.stop_grace = ms(100);
    timing.heartbeat = ms(500);
    timing.cleanup_settle = Duration::ZERO;
    timing.trial_delay = Duration::ZERO;
    timing.power_cut_delay = ms(50)..=ms(100);
    timing.power_cut_settle = Duration::ZERO;

    fs::create_dir_all(&config.flag_dir)?;
    fs::create_dir_all(root.join("rootfs"))?;
    fs::write(&config.paths.rootfs_journal, vec![0u8; JOURNAL_LEN as usize])?;
    write_script(&config.paths.boot_script, "#!/bin/sh\necho 'Tier 3 established'\n")?;
    Ok(config)
}

fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(ms(50));
    }
    check()
}

#[test]
fn boot_mode_runs_every_boot_campaign_and_stops_its_verifier() -> Result<()> {
    let dir = TempDir::new()?;
    let config = scripted_lab(dir.path())?;
    let service = VerifierService::new(&config);
    assert!(!service.is_running());

    let orchestrator = ExperimentOrchestrator::new(&config);
    let summary = orchestrator.run(ExperimentMode::Boot, 1, StdRng::seed_from_u64(31))?;

    assert_eq!(summary.mode, ExperimentMode::Boot);
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.campaigns.len(), FaultType::BOOT_TIME.len());
    assert_eq!(summary.total_trials(), FaultType::BOOT_TIME.len());
    assert!(summary.campaigns.iter().all(|line| line.mode == "boot"));

    let written: BTreeSet<String> = orchestrator
        .store()
        .latest_files(20)?
        .iter()
        .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .collect();
    let expected: BTreeSet<String> = FaultType::BOOT_TIME
        .iter()
        .map(|fault| format!("faultlab_results_{fault}_boot_latest.json"))
        .collect();
    assert_eq!(written, expected);

    assert!(eventually(Duration::from_secs(3), || !service.is_running()));
    Ok(())
}

#[test]
fn lease_leaves_an_already_running_verifier_alone() -> Result<()> {
    let dir = TempDir::new()?;
    let config = scripted_lab(dir.path())?;
    let service = VerifierService::new(&config);
    service.start()?;

    let lease = VerifierLease::acquire(service.clone())?;
    assert!(!lease.started());
    lease.release();
    assert!(service.is_running());

    service.stop();
    assert!(eventually(Duration::from_secs(3), || !service.is_running()));
    Ok(())
}

#[test]
fn verifier_that_never_appears_aborts_the_run() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = scripted_lab(dir.path())?;
    config.verifier.command = vec!["true".to_owned()];
    config.verifier.match_pattern = "faultlab-test-absent-verifier".to_owned();
    config.verifier.startup_wait = Duration::ZERO;

    let orchestrator = ExperimentOrchestrator::new(&config);
    let err = orchestrator
        .run(ExperimentMode::Boot, 1, StdRng::seed_from_u64(32))
        .expect_err("verifier start is fatal");
    assert!(err.to_string().contains("verifier start"));
    assert!(orchestrator.store().latest_files(20)?.is_empty());
    Ok(())
}
