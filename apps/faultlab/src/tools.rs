// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Bounded invocations of external collaborators with an explicit failure policy.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::FaultlabConfig;
use crate::{FaultlabError, Result, LOG_TARGET};

const WAIT_POLL: Duration = Duration::from_millis(20);

/// External calls the harness makes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExternalCall {
    /// `journal_tool init`.
    JournalInit,
    /// `journal_tool read`.
    JournalRead,
    /// `journal_tool set-flag`.
    JournalSetFlag,
    /// `journal_tool clear-flag`.
    JournalClearFlag,
    /// `journal_tool reset-tries`.
    JournalResetTries,
    /// Boot image repack.
    ImageRebuild,
    /// `pkill` sweep of stray emulator processes.
    ProcessSweep,
    /// Removal of scratch files and sockets.
    ScratchCleanup,
    /// Verifier launch.
    VerifierStart,
    /// `pgrep` check for a live verifier.
    VerifierStatus,
    /// Verifier kill.
    VerifierKill,
}

/// What to do when an external call fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log a warning and proceed with whatever state resulted.
    LogAndContinue,
    /// Propagate the error and abort the run.
    Abort,
}

impl ExternalCall {
    /// Failure policy for this call.
    #[must_use]
    pub const fn policy(self) -> FailurePolicy {
        match self {
            Self::VerifierStart => FailurePolicy::Abort,
            Self::JournalInit
            | Self::JournalRead
            | Self::JournalSetFlag
            | Self::JournalClearFlag
            | Self::JournalResetTries
            | Self::ImageRebuild
            | Self::ProcessSweep
            | Self::ScratchCleanup
            | Self::VerifierStatus
            | Self::VerifierKill => FailurePolicy::LogAndContinue,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::JournalInit => "journal init",
            Self::JournalRead => "journal read",
            Self::JournalSetFlag => "journal set-flag",
            Self::JournalClearFlag => "journal clear-flag",
            Self::JournalResetTries => "journal reset-tries",
            Self::ImageRebuild => "image rebuild",
            Self::ProcessSweep => "process sweep",
            Self::ScratchCleanup => "scratch cleanup",
            Self::VerifierStart => "verifier start",
            Self::VerifierStatus => "verifier status",
            Self::VerifierKill => "verifier kill",
        }
    }

    pub(crate) fn error(self, reason: impl Into<String>) -> FaultlabError {
        FaultlabError::ExternalTool {
            call: self,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ExternalCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Apply the call's failure policy to `result`.
///
/// `Ok(None)` means the call failed and the failure was logged.
pub fn apply_policy<T>(call: ExternalCall, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) => match call.policy() {
            FailurePolicy::LogAndContinue => {
                warn!(target: LOG_TARGET, "{call} failed, continuing: {err}");
                Ok(None)
            }
            FailurePolicy::Abort => Err(err),
        },
    }
}

/// Captured result of a bounded external command.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Run `command` to completion within `timeout`, capturing its output.
///
/// The child is killed when the timeout expires. A non-zero exit is not an
/// error here; see [`run_checked`].
pub fn run_bounded(call: ExternalCall, command: &mut Command, timeout: Duration) -> Result<ToolOutput> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| call.error(format!("spawn: {err}")))?;
    let stdout = child.stdout.take().map(spawn_drain);
    let stderr = child.stderr.take().map(spawn_drain);
    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(FaultlabError::TimeoutExceeded {
                what: call.to_string(),
                elapsed: started.elapsed(),
            });
        }
        thread::sleep(WAIT_POLL);
    };
    let collect = |handle: Option<thread::JoinHandle<String>>| {
        handle
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };
    Ok(ToolOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

/// Like [`run_bounded`], but a non-zero exit becomes an error.
pub fn run_checked(call: ExternalCall, command: &mut Command, timeout: Duration) -> Result<ToolOutput> {
    let output = run_bounded(call, command, timeout)?;
    if output.status.success() {
        Ok(output)
    } else {
        let detail = output.stderr.trim();
        Err(call.error(format!(
            "exited with {}{}{}",
            output.status,
            if detail.is_empty() { "" } else { ": " },
            truncate(detail, 160)
        )))
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Status flags understood by the journal tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalFlag {
    /// Emergency shell requested.
    Emergency,
    /// Image quarantined.
    Quarantine,
    /// Brownout observed on last boot.
    Brownout,
    /// Unclean shutdown.
    Dirty,
    /// Network access gated on attestation.
    NetworkGated,
}

impl JournalFlag {
    /// Every flag cleared when resetting a journal.
    pub const ALL: [JournalFlag; 5] = [
        JournalFlag::Emergency,
        JournalFlag::Brownout,
        JournalFlag::Quarantine,
        JournalFlag::Dirty,
        JournalFlag::NetworkGated,
    ];

    /// Flags that keep the booted system from climbing back up after a fault.
    pub const RECOVERY_BLOCKERS: [JournalFlag; 3] = [
        JournalFlag::Emergency,
        JournalFlag::Dirty,
        JournalFlag::Quarantine,
    ];

    /// Argument accepted by `set-flag`/`clear-flag`.
    #[must_use]
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Quarantine => "quarantine",
            Self::Brownout => "brownout",
            Self::Dirty => "dirty",
            Self::NetworkGated => "network_gated",
        }
    }

    /// Name printed by `read` when the flag is set.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Emergency => "EMERGENCY",
            Self::Quarantine => "QUARANTINE",
            Self::Brownout => "BROWNOUT",
            Self::Dirty => "DIRTY",
            Self::NetworkGated => "NETWORK_GATED",
        }
    }
}

/// Output of `journal_tool read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalReading {
    /// Raw standard output.
    pub raw: String,
    /// `0x…` word from the `Flags:` line, if printed.
    pub flags: Option<String>,
}

impl JournalReading {
    fn parse(raw: String) -> Self {
        let flags = raw
            .lines()
            .find(|line| line.contains("Flags:"))
            .and_then(|line| {
                line.split_whitespace()
                    .find(|token| token.starts_with("0x") || token.starts_with("0X"))
                    .map(|token| token.trim_end_matches(|ch: char| !ch.is_ascii_hexdigit()).to_owned())
            });
        Self { raw, flags }
    }

    /// Whether the output names `flag` as set.
    #[must_use]
    pub fn shows(&self, flag: JournalFlag) -> bool {
        self.raw.contains(flag.display_name())
    }
}

/// Adapter over the external journal tool.
#[derive(Debug, Clone)]
pub struct JournalTool {
    program: PathBuf,
    timeout: Duration,
}

impl JournalTool {
    /// Adapter configured from the harness configuration.
    #[must_use]
    pub fn new(config: &FaultlabConfig) -> Self {
        Self {
            program: config.paths.journal_tool.clone(),
            timeout: config.timing.tool_timeout,
        }
    }

    /// Whether the tool binary exists.
    #[must_use]
    pub fn available(&self) -> bool {
        self.program.is_file()
    }

    /// Initialise a fresh journal at `journal`.
    pub fn init(&self, journal: &Path) -> Result<()> {
        self.invoke(ExternalCall::JournalInit, &["init"], journal).map(drop)
    }

    /// Read the journal header.
    pub fn read(&self, journal: &Path) -> Result<JournalReading> {
        self.invoke(ExternalCall::JournalRead, &["read"], journal)
            .map(|output| JournalReading::parse(output.stdout))
    }

    /// Set one status flag.
    pub fn set_flag(&self, flag: JournalFlag, journal: &Path) -> Result<()> {
        self.invoke(ExternalCall::JournalSetFlag, &["set-flag", flag.as_arg()], journal)
            .map(drop)
    }

    /// Clear one status flag.
    pub fn clear_flag(&self, flag: JournalFlag, journal: &Path) -> Result<()> {
        self.invoke(ExternalCall::JournalClearFlag, &["clear-flag", flag.as_arg()], journal)
            .map(drop)
    }

    /// Reset every boot attempt counter.
    pub fn reset_tries(&self, journal: &Path) -> Result<()> {
        self.invoke(ExternalCall::JournalResetTries, &["reset-tries"], journal)
            .map(drop)
    }

    /// Clear `flags` one by one, logging failures and carrying on.
    pub fn clear_flags_best_effort(&self, flags: &[JournalFlag], journal: &Path) {
        for flag in flags {
            let _ = apply_policy(ExternalCall::JournalClearFlag, self.clear_flag(*flag, journal));
        }
    }

    fn invoke(&self, call: ExternalCall, args: &[&str], journal: &Path) -> Result<ToolOutput> {
        debug!(target: LOG_TARGET, "{call} {}", journal.display());
        let mut command = Command::new(&self.program);
        command.args(args).arg(journal);
        run_checked(call, &mut command, self.timeout)
    }
}

/// Reset both journals to a clean state and discard stale backups.
///
/// Each journal is initialised, every status flag cleared and the attempt
/// counters reset. Tool failures are logged and skipped.
pub fn reset_journals(config: &FaultlabConfig) -> Result<()> {
    let tool = JournalTool::new(config);
    for journal in [&config.paths.rootfs_journal, &config.paths.var_journal] {
        if let Some(parent) = journal.parent() {
            fs::create_dir_all(parent)?;
        }
        let _ = apply_policy(ExternalCall::JournalInit, tool.init(journal));
        tool.clear_flags_best_effort(&JournalFlag::ALL, journal);
        let _ = apply_policy(ExternalCall::JournalResetTries, tool.reset_tries(journal));
    }
    let removed = remove_matching(&[format!("{}/*.bak", config.paths.backup_dir.display())]);
    debug!(target: LOG_TARGET, "discarded {removed} stale backups");
    Ok(())
}

/// Clear flags that block recovery from the persistent journal.
///
/// Returns `false` when the journal or the tool is missing.
pub fn clear_recovery_blockers(config: &FaultlabConfig) -> bool {
    let tool = JournalTool::new(config);
    let journal = &config.paths.var_journal;
    if !journal.is_file() || !tool.available() {
        return false;
    }
    tool.clear_flags_best_effort(&JournalFlag::RECOVERY_BLOCKERS, journal);
    apply_policy(ExternalCall::JournalResetTries, tool.reset_tries(journal))
        .map(|done| done.is_some())
        .unwrap_or(false)
}

/// Repack the root filesystem tree into the boot image archives.
pub fn rebuild_image(config: &FaultlabConfig) -> Result<()> {
    let image = &config.image;
    let Some((primary, copies)) = image.archives.split_first() else {
        return Err(ExternalCall::ImageRebuild.error("no archive configured"));
    };
    fs::create_dir_all(&image.image_dir)?;
    let primary_path = image.image_dir.join(primary);
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(r#"cd "$1" && find . | cpio -o -H newc 2>/dev/null | gzip -9 > "$2""#)
        .arg("sh")
        .arg(&image.rootfs_dir)
        .arg(&primary_path);
    run_checked(ExternalCall::ImageRebuild, &mut command, config.timing.rebuild_timeout)?;
    for copy in copies {
        fs::copy(&primary_path, image.image_dir.join(copy))
            .map_err(|err| ExternalCall::ImageRebuild.error(format!("copy {copy}: {err}")))?;
    }
    debug!(target: LOG_TARGET, "boot image rebuilt at {}", primary_path.display());
    Ok(())
}

/// Rebuild the boot image, logging instead of failing.
pub fn rebuild_image_best_effort(config: &FaultlabConfig) -> bool {
    matches!(
        apply_policy(ExternalCall::ImageRebuild, rebuild_image(config)),
        Ok(Some(()))
    )
}

/// `pkill -9` every configured process name. Returns how many names matched.
pub fn sweep_processes(config: &FaultlabConfig) -> usize {
    config
        .cleanup
        .process_names
        .iter()
        .filter(|name| {
            let mut command = Command::new("pkill");
            command.arg("-9").arg(name.as_str());
            let outcome = run_bounded(ExternalCall::ProcessSweep, &mut command, config.timing.tool_timeout)
                .and_then(|output| match output.status.code() {
                    Some(0) => Ok(true),
                    Some(1) => Ok(false),
                    _ => Err(ExternalCall::ProcessSweep.error(format!("pkill {name}: {}", output.status))),
                });
            matches!(apply_policy(ExternalCall::ProcessSweep, outcome), Ok(Some(true)))
        })
        .count()
}

/// Remove files and directories matching any of `patterns`. Returns the count removed.
pub fn remove_matching(patterns: &[String]) -> usize {
    let mut removed = 0;
    for pattern in patterns {
        let entries = match glob::glob(pattern) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(target: LOG_TARGET, "{} skipped pattern {pattern}: {err}", ExternalCall::ScratchCleanup);
                continue;
            }
        };
        for path in entries.flatten() {
            let outcome = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match outcome {
                Ok(()) => removed += 1,
                Err(err) => {
                    let _ = apply_policy::<()>(
                        ExternalCall::ScratchCleanup,
                        Err(ExternalCall::ScratchCleanup.error(format!("{}: {err}", path.display()))),
                    );
                }
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_verifier_start_aborts() {
        assert_eq!(ExternalCall::VerifierStart.policy(), FailurePolicy::Abort);
        assert_eq!(ExternalCall::ImageRebuild.policy(), FailurePolicy::LogAndContinue);
        assert_eq!(ExternalCall::VerifierStatus.policy(), FailurePolicy::LogAndContinue);
        assert_eq!(ExternalCall::VerifierStatus.to_string(), "verifier status");
        let swallowed = apply_policy::<()>(
            ExternalCall::JournalRead,
            Err(ExternalCall::JournalRead.error("boom")),
        );
        assert!(matches!(swallowed, Ok(None)));
        let fatal = apply_policy::<()>(
            ExternalCall::VerifierStart,
            Err(ExternalCall::VerifierStart.error("boom")),
        );
        assert!(fatal.is_err());
    }

    #[test]
    fn journal_reading_extracts_flags_word() {
        let reading = JournalReading::parse(
            "Magic: PACJ\nFlags: 0x00000001 (BROWNOUT)\nTries: 0\n".to_owned(),
        );
        assert_eq!(reading.flags.as_deref(), Some("0x00000001"));
        assert!(reading.shows(JournalFlag::Brownout));
        assert!(!reading.shows(JournalFlag::Dirty));
    }

    #[test]
    fn bounded_run_times_out() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let err = run_bounded(ExternalCall::JournalRead, &mut command, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, FaultlabError::TimeoutExceeded { .. }));
    }
}
