// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate boot launcher supervision against scripted fake launchers.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use faultlab::supervisor::{BootSupervisor, ObserveEnd, ObservePlan};
use faultlab::{FaultlabError, Tier};
use tempfile::TempDir;

const HEARTBEAT: Duration = Duration::from_millis(200);
const GRACE: Duration = Duration::from_millis(200);

fn launcher(dir: &Path, body: &str) -> Result<PathBuf> {
    let path = dir.join("boot.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[test]
fn target_tier_ends_the_window_once_held() -> Result<()> {
    let dir = TempDir::new()?;
    let script = launcher(
        dir.path(),
        "echo 'starting'\necho 'Tier 1 operational'\necho 'Tier 3 established'\nsleep 30",
    )?;
    let mut supervisor = BootSupervisor::launch(&script, HEARTBEAT, GRACE)?;
    let started = Instant::now();
    let observation = supervisor.observe(&ObservePlan::until_tier(
        Tier::T3,
        Duration::from_millis(300),
        Duration::from_secs(10),
    ));
    assert_eq!(observation.end, ObserveEnd::TargetHeld);
    assert_eq!(observation.final_tier(), Tier::T3);
    assert!(observation.target_reached_at.is_some());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(supervisor.history().first_seen(Tier::T1).is_some());

    supervisor.stop();
    supervisor.stop();
    Ok(())
}

#[test]
fn status_line_after_establishment_shows_degradation() -> Result<()> {
    let dir = TempDir::new()?;
    let script = launcher(
        dir.path(),
        "echo 'Tier 3 established'\nsleep 0.3\necho 'Current Tier: 2'",
    )?;
    let mut supervisor = BootSupervisor::launch(&script, HEARTBEAT, GRACE)?;
    let observation = supervisor.observe(&ObservePlan::window(Duration::from_secs(5)));
    assert_eq!(observation.end, ObserveEnd::StreamClosed);
    assert_eq!(observation.final_tier(), Tier::T2);
    assert_eq!(supervisor.current_tier(), Tier::T2);
    assert_eq!(supervisor.history().len(), 2);
    assert!(supervisor.stream_closed());
    assert_eq!(supervisor.lines(), 2);
    Ok(())
}

#[test]
fn panic_marker_forces_failure_and_silences_later_lines() -> Result<()> {
    let dir = TempDir::new()?;
    let script = launcher(
        dir.path(),
        "echo 'Tier 2 established'\necho 'Kernel panic - not syncing'\necho 'Tier 3 established'",
    )?;
    let mut supervisor = BootSupervisor::launch(&script, HEARTBEAT, GRACE)?;
    let observation = supervisor.observe(&ObservePlan::window(Duration::from_secs(5)));
    assert_eq!(observation.final_tier(), Tier::Failed);
    assert_eq!(observation.lines, 3);
    Ok(())
}

#[test]
fn silence_is_not_success() -> Result<()> {
    let dir = TempDir::new()?;
    let script = launcher(dir.path(), "sleep 30")?;
    let mut supervisor = BootSupervisor::launch(&script, HEARTBEAT, GRACE)?;
    let observation = supervisor.observe(&ObservePlan::until_tier(
        Tier::T1,
        Duration::ZERO,
        Duration::from_millis(500),
    ));
    assert_eq!(observation.end, ObserveEnd::TimedOut);
    assert_eq!(observation.final_tier(), Tier::Failed);
    assert!(supervisor.history().is_empty());

    let stopping = Instant::now();
    supervisor.hard_kill();
    supervisor.stop();
    assert!(stopping.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn launcher_without_execute_bit_runs_through_sh() -> Result<()> {
    let dir = TempDir::new()?;
    let script = dir.path().join("boot.sh");
    fs::write(&script, "echo 'Tier 2 established'\n")?;
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644))?;
    let mut supervisor = BootSupervisor::launch(&script, HEARTBEAT, GRACE)?;
    let observation = supervisor.observe(&ObservePlan::window(Duration::from_secs(5)));
    assert_eq!(observation.end, ObserveEnd::StreamClosed);
    assert_eq!(observation.final_tier(), Tier::T2);
    Ok(())
}

#[test]
fn missing_launcher_is_a_supervision_error() {
    let err = BootSupervisor::launch(Path::new("/nonexistent/boot.sh"), HEARTBEAT, GRACE)
        .expect_err("missing launcher");
    assert!(matches!(err, FaultlabError::Supervision(_)));
}
