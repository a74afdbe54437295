// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Supervise the boot launcher and turn its console stream into tier observations.
// Author: Lukas Bower

use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};
use tier_model::{Tier, TierClassifier, TierEvent, TierHistory, TierObservation};

use crate::config::FaultlabConfig;
use crate::inject::Injector;
use crate::tools;
use crate::{FaultlabError, Result, LOG_TARGET};

const STOP_POLL: Duration = Duration::from_millis(50);

/// Message from the reader thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEvent {
    /// One console line, classified in stream order.
    Line {
        at: Duration,
        event: Option<TierEvent>,
    },
    /// The combined output stream reached end of file.
    Closed,
}

/// Bounds for one observation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservePlan {
    /// Maximum length of the window.
    pub window: Duration,
    /// Tier that ends the window early once held for `settle`.
    pub target: Option<Tier>,
    /// Hold time at or above `target`.
    pub settle: Duration,
    /// Known tier at the start of the window.
    pub seed: Option<TierObservation>,
}

impl ObservePlan {
    /// Observe for exactly `window` (or until the stream closes).
    #[must_use]
    pub const fn window(window: Duration) -> Self {
        Self {
            window,
            target: None,
            settle: Duration::ZERO,
            seed: None,
        }
    }

    /// Observe until `target` is held for `settle`, giving up after `timeout`.
    #[must_use]
    pub const fn until_tier(target: Tier, settle: Duration, timeout: Duration) -> Self {
        Self {
            window: timeout,
            target: Some(target),
            settle,
            seed: None,
        }
    }

    /// Start the window's history from a known tier.
    #[must_use]
    pub const fn seeded(mut self, seed: TierObservation) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Why an observation window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveEnd {
    /// The full window elapsed.
    WindowElapsed,
    /// The target tier was reached and held for the settle time.
    TargetHeld,
    /// A target was set but not held before the window ran out.
    TimedOut,
    /// The launcher's output stream closed.
    StreamClosed,
}

/// What one observation window saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Tier history of this window only.
    pub history: TierHistory,
    /// Console lines consumed during the window.
    pub lines: usize,
    /// Offset at which the target tier was first reached.
    pub target_reached_at: Option<Duration>,
    /// How the window ended.
    pub end: ObserveEnd,
    /// Wall-clock length of the window.
    pub elapsed: Duration,
}

impl Observation {
    /// Latest tier in the window, treating silence as failure.
    #[must_use]
    pub fn final_tier(&self) -> Tier {
        self.history.current_or_failed()
    }
}

/// One running boot launcher and its console reader.
///
/// The launcher runs in its own process group so that every helper it
/// spawns is signalled together. Dropping the supervisor stops the group.
#[derive(Debug)]
pub struct BootSupervisor {
    child: Option<Child>,
    pgid: Option<i32>,
    started: Instant,
    events: Receiver<StreamEvent>,
    history: TierHistory,
    lines: usize,
    stream_closed: bool,
    heartbeat: Duration,
    grace: Duration,
}

impl BootSupervisor {
    /// Launch the configured boot script.
    pub fn start(config: &FaultlabConfig) -> Result<Self> {
        Self::launch(
            &config.paths.boot_script,
            config.timing.heartbeat,
            config.timing.stop_grace,
        )
    }

    /// Launch `script` with stderr merged into stdout.
    ///
    /// A script without an execute bit is run through `sh`.
    pub fn launch(script: &Path, heartbeat: Duration, grace: Duration) -> Result<Self> {
        let metadata = fs::metadata(script)
            .ok()
            .filter(|metadata| metadata.is_file())
            .ok_or_else(|| {
                FaultlabError::Supervision(format!("boot script not found: {}", script.display()))
            })?;
        let exec = if metadata.permissions().mode() & 0o111 != 0 {
            r#"exec "$0" 2>&1"#
        } else {
            debug!(target: LOG_TARGET, "{} is not executable, running it with sh", script.display());
            r#"exec sh "$0" 2>&1"#
        };
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(exec)
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0);
        let mut child = command.spawn().map_err(|err| {
            FaultlabError::Supervision(format!("spawn {}: {err}", script.display()))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FaultlabError::Supervision("launcher stdout not captured".to_owned()))?;
        let pgid = i32::try_from(child.id()).ok();
        let started = Instant::now();
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("boot-console".to_owned())
            .spawn(move || read_console(stdout, started, tx))
            .map_err(|err| FaultlabError::Supervision(format!("reader thread: {err}")))?;
        info!(
            target: LOG_TARGET,
            "boot launcher started: {} (pgid {})",
            script.display(),
            pgid.map_or_else(|| "?".to_owned(), |pgid| pgid.to_string())
        );
        Ok(Self {
            child: Some(child),
            pgid,
            started,
            events: rx,
            history: TierHistory::new(),
            lines: 0,
            stream_closed: false,
            heartbeat,
            grace,
        })
    }

    /// Time since launch.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Tier history over the whole supervised lifetime.
    #[must_use]
    pub fn history(&self) -> &TierHistory {
        &self.history
    }

    /// Latest tier over the whole lifetime, treating silence as failure.
    #[must_use]
    pub fn current_tier(&self) -> Tier {
        self.history.current_or_failed()
    }

    /// Console lines consumed so far.
    #[must_use]
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Whether the output stream has closed.
    #[must_use]
    pub fn stream_closed(&self) -> bool {
        self.stream_closed
    }

    /// Drain console events for one bounded window.
    ///
    /// Blocks on the event channel with a deadline; never longer than
    /// `plan.window`. Emits a progress heartbeat at the configured interval.
    pub fn observe(&mut self, plan: &ObservePlan) -> Observation {
        let begin = Instant::now();
        let window_end = begin + plan.window;
        let mut window = plan.seed.map_or_else(TierHistory::new, TierHistory::seeded);
        let mut lines = 0;
        let mut reached_at: Option<Duration> = None;
        let mut held_since: Option<Instant> = None;
        let mut next_beat = begin + self.heartbeat;

        let meets_target = |tier: Option<Tier>| match (plan.target, tier) {
            (Some(target), Some(tier)) => tier >= target,
            _ => false,
        };
        if meets_target(window.current()) {
            held_since = Some(begin);
            reached_at = plan.seed.map(|seed| seed.offset);
        }

        let end = loop {
            let now = Instant::now();
            if let Some(since) = held_since {
                if now.duration_since(since) >= plan.settle {
                    info!(
                        target: LOG_TARGET,
                        "held tier {} for {:.1}s",
                        window.current_or_failed(),
                        plan.settle.as_secs_f64()
                    );
                    break ObserveEnd::TargetHeld;
                }
            }
            if now >= window_end {
                break if plan.target.is_some() {
                    warn!(
                        target: LOG_TARGET,
                        "timeout after {:.0}s, current tier {}",
                        plan.window.as_secs_f64(),
                        window.current_or_failed()
                    );
                    ObserveEnd::TimedOut
                } else {
                    ObserveEnd::WindowElapsed
                };
            }
            if now >= next_beat {
                info!(
                    target: LOG_TARGET,
                    "... {:.0}s, tier {}, lines {}",
                    self.elapsed().as_secs_f64(),
                    window.current_or_failed(),
                    self.lines
                );
                next_beat = now + self.heartbeat;
            }
            if self.stream_closed {
                break ObserveEnd::StreamClosed;
            }

            let mut deadline = window_end.min(next_beat);
            if let Some(since) = held_since {
                deadline = deadline.min(since + plan.settle);
            }
            match self.events.recv_deadline(deadline) {
                Ok(StreamEvent::Line { at, event }) => {
                    lines += 1;
                    self.lines += 1;
                    let Some(event) = event else { continue };
                    let observation = TierObservation::new(at, event.tier());
                    self.history.record(observation);
                    if window.record(observation) {
                        debug!(target: LOG_TARGET, "tier {} at {:.1}s", event.tier(), at.as_secs_f64());
                    }
                    if meets_target(window.current()) {
                        if held_since.is_none() {
                            held_since = Some(Instant::now());
                            reached_at.get_or_insert(at);
                            info!(
                                target: LOG_TARGET,
                                "tier {} reached at {:.1}s",
                                event.tier(),
                                at.as_secs_f64()
                            );
                        }
                    } else {
                        held_since = None;
                    }
                }
                Ok(StreamEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    if !self.stream_closed {
                        debug!(target: LOG_TARGET, "boot console closed after {} lines", self.lines);
                    }
                    self.stream_closed = true;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        };

        Observation {
            history: window,
            lines,
            target_reached_at: reached_at,
            end,
            elapsed: begin.elapsed(),
        }
    }

    /// Terminate the process group: SIGTERM, grace period, then SIGKILL.
    ///
    /// Idempotent; an already-exited launcher is not an error.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        signal_group(self.pgid, libc::SIGTERM);
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) | Err(_) => break,
                Ok(None) => thread::sleep(STOP_POLL),
            }
        }
        // Helpers may outlive the launcher itself; the group is always killed.
        signal_group(self.pgid, libc::SIGKILL);
        let _ = child.wait();
        debug!(target: LOG_TARGET, "boot launcher stopped after {:.1}s", self.elapsed().as_secs_f64());
    }

    /// Kill the process group immediately, as an abrupt power loss would.
    pub fn hard_kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        signal_group(self.pgid, libc::SIGKILL);
        let _ = child.wait();
    }
}

impl Drop for BootSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn signal_group(pgid: Option<i32>, signal: libc::c_int) {
    let Some(pgid) = pgid.filter(|pgid| *pgid > 0) else {
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory owned by us.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(target: LOG_TARGET, "killpg({pgid}, {signal}) failed: {err}");
        }
    }
}

fn read_console(stdout: ChildStdout, started: Instant, tx: Sender<StreamEvent>) {
    let mut reader = BufReader::new(stdout);
    let mut classifier = TierClassifier::new();
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let at = started.elapsed();
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                trace!(target: "faultlab::console", "{line}");
                let event = classifier.feed(line);
                if tx.send(StreamEvent::Line { at, event }).is_err() {
                    return;
                }
            }
        }
    }
    let _ = tx.send(StreamEvent::Closed);
}

/// Remove leftovers of earlier trials: stray emulator processes, scratch
/// files and sockets, and flag sentinels. Then pause for the settle time.
pub fn cleanup_environment(config: &FaultlabConfig) {
    let killed = tools::sweep_processes(config);
    let removed = tools::remove_matching(&config.cleanup.scratch_patterns);
    let cleared = Injector::new(config).clear_fault_flags();
    debug!(
        target: LOG_TARGET,
        "cleanup: {killed} process names matched, {removed} scratch entries removed, {cleared} flags cleared"
    );
    thread::sleep(config.timing.cleanup_settle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_builders_set_bounds() {
        let plan = ObservePlan::until_tier(Tier::T3, Duration::from_secs(60), Duration::from_secs(180));
        assert_eq!(plan.window, Duration::from_secs(180));
        assert_eq!(plan.target, Some(Tier::T3));
        let seeded = ObservePlan::window(Duration::from_secs(1))
            .seeded(TierObservation::new(Duration::from_secs(4), Tier::T2));
        assert_eq!(seeded.seed.map(|seed| seed.tier), Some(Tier::T2));
    }

    #[test]
    fn signalling_missing_group_is_silent() {
        signal_group(None, libc::SIGTERM);
        signal_group(Some(0), libc::SIGTERM);
    }
}
