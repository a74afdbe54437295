// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared library for the faultlab fault-injection and tier-monitoring harness.
// Author: Lukas Bower
#![warn(missing_docs)]

//! Fault injection and tiered-boot monitoring for the attestation-gated
//! boot pipeline.
//!
//! The harness corrupts the persistent state the booted system consumes,
//! supervises the boot launcher as a long-running child process, infers the
//! recovery tier from its console output and aggregates many such trials
//! into campaign statistics (success rate, MTTD, MTTR).

/// Chaos trials composing random fault scenarios.
pub mod chaos;
/// Campaign execution, summaries and result persistence.
pub mod campaign;
/// Harness configuration loaded from TOML.
pub mod config;
/// Fault taxonomy and injection records.
pub mod fault;
/// Byte-level and flag-based fault primitives with backup/restore.
pub mod inject;
/// Mode sequencing and verifier lifecycle for a whole experiment run.
pub mod orchestrator;
/// Read-only views over persisted campaign results.
pub mod report;
/// Boot launcher supervision and tier observation windows.
pub mod supervisor;
/// External collaborator invocations and their failure policy.
pub mod tools;
/// Single-trial state machine.
pub mod trial;
/// Attestation verifier process control.
pub mod verifier;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use tier_model::{Tier, TierHistory, TierObservation};

/// Errors surfaced by the harness core.
#[derive(Debug, Error)]
pub enum FaultlabError {
    /// A fault could not be applied; the target is left untouched or backed up.
    #[error("injection into {path} failed: {reason}")]
    Injection {
        /// Fault target.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },
    /// The boot launcher could not be started or its output stream broke.
    #[error("supervision failed: {0}")]
    Supervision(String),
    /// A bounded wait expired before the expected condition was observed.
    #[error("timed out after {elapsed:?} waiting for {what}")]
    TimeoutExceeded {
        /// Condition that was awaited.
        what: String,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// A backup was missing or could not be copied back.
    #[error("restore of {path} failed: {reason}")]
    Restore {
        /// File being restored.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },
    /// An external collaborator exited unsuccessfully or could not be run.
    #[error("{call} failed: {reason}")]
    ExternalTool {
        /// Which external call failed.
        call: tools::ExternalCall,
        /// Human-readable cause.
        reason: String,
    },
    /// Underlying filesystem or process I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Result (de)serialisation failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FaultlabError {
    pub(crate) fn injection(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Injection {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn restore(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Restore {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used across the harness core.
pub type Result<T, E = FaultlabError> = std::result::Result<T, E>;

/// Log target shared by harness modules.
pub const LOG_TARGET: &str = "faultlab";
