// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Start, check, kill and stop the external attestation verifier.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::config::FaultlabConfig;
use crate::fault::{FaultDetail, FaultRecord};
use crate::tools::{apply_policy, run_bounded, ExternalCall};
use crate::{Result, LOG_TARGET};

/// Process control for the verifier, matched by command line.
#[derive(Debug, Clone)]
pub struct VerifierService {
    command: Vec<String>,
    pattern: String,
    workdir: PathBuf,
    startup_wait: Duration,
    timeout: Duration,
}

impl VerifierService {
    /// Service handle configured from the harness configuration.
    #[must_use]
    pub fn new(config: &FaultlabConfig) -> Self {
        Self {
            command: config.verifier.command.clone(),
            pattern: config.verifier.match_pattern.clone(),
            workdir: config.paths.root.clone(),
            startup_wait: config.verifier.startup_wait,
            timeout: config.timing.tool_timeout,
        }
    }

    /// Whether a process matching the pattern is alive (`pgrep -f`).
    #[must_use]
    pub fn is_running(&self) -> bool {
        let mut command = Command::new("pgrep");
        command.arg("-f").arg(&self.pattern);
        let status = run_bounded(ExternalCall::VerifierStatus, &mut command, self.timeout);
        apply_policy(ExternalCall::VerifierStatus, status)
            .ok()
            .flatten()
            .is_some_and(|output| output.status.success())
    }

    /// Launch the verifier detached in its own process group and wait for it to appear.
    pub fn start(&self) -> Result<()> {
        let call = ExternalCall::VerifierStart;
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| call.error("empty verifier command"))?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|err| call.error(format!("spawn {program}: {err}")))?;
        // Reap the verifier whenever it exits so it never lingers as a zombie.
        thread::spawn(move || {
            let _ = child.wait();
        });
        thread::sleep(self.startup_wait);
        if self.is_running() {
            info!(target: LOG_TARGET, "verifier started");
            Ok(())
        } else {
            Err(call.error(format!(
                "no process matching '{}' after {:.1}s",
                self.pattern,
                self.startup_wait.as_secs_f64()
            )))
        }
    }

    /// Start the verifier unless it is already running.
    ///
    /// Returns whether this call started it.
    pub fn ensure_running(&self) -> Result<bool> {
        if self.is_running() {
            info!(target: LOG_TARGET, "verifier already running");
            return Ok(false);
        }
        info!(target: LOG_TARGET, "starting verifier");
        self.start().map(|()| true)
    }

    /// Kill the verifier with SIGKILL, simulating a crash.
    pub fn kill(&self) -> Result<FaultRecord> {
        let call = ExternalCall::VerifierKill;
        let mut command = Command::new("pkill");
        command.arg("-9").arg("-f").arg(&self.pattern);
        let output = run_bounded(call, &mut command, self.timeout)?;
        match output.status.code() {
            Some(0) => info!(target: LOG_TARGET, "verifier killed"),
            Some(1) => warn!(target: LOG_TARGET, "no verifier process to kill"),
            _ => return Err(call.error(format!("pkill exited with {}", output.status))),
        }
        Ok(FaultRecord::now(FaultDetail::ProcessKill {
            process: self.pattern.clone(),
        }))
    }

    /// Start the verifier again after a kill. Failures are logged only.
    pub fn restart(&self) -> bool {
        match self.start() {
            Ok(()) => true,
            Err(err) => {
                warn!(target: LOG_TARGET, "verifier restart may have failed: {err}");
                false
            }
        }
    }

    /// Stop the verifier gracefully (`pkill -f`).
    pub fn stop(&self) {
        let mut command = Command::new("pkill");
        command.arg("-f").arg(&self.pattern);
        match run_bounded(ExternalCall::VerifierKill, &mut command, self.timeout) {
            Ok(_) => info!(target: LOG_TARGET, "verifier stopped"),
            Err(err) => warn!(target: LOG_TARGET, "verifier stop failed: {err}"),
        }
    }
}

/// Keeps the verifier up for the duration of a run and stops it only if this
/// run started it.
#[derive(Debug)]
pub struct VerifierLease {
    service: VerifierService,
    started: bool,
}

impl VerifierLease {
    /// Ensure the verifier is running. A failed start aborts the run.
    pub fn acquire(service: VerifierService) -> Result<Self> {
        let started = service.ensure_running()?;
        Ok(Self { service, started })
    }

    /// Whether this lease started the verifier.
    #[must_use]
    pub fn started(&self) -> bool {
        self.started
    }

    /// Borrow the underlying service.
    #[must_use]
    pub fn service(&self) -> &VerifierService {
        &self.service
    }

    /// Stop the verifier if this lease started it.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::take(&mut self.started) {
            info!(target: LOG_TARGET, "stopping verifier started by this run");
            self.service.stop();
        }
    }
}

impl Drop for VerifierLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
