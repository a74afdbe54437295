// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Fault taxonomy, campaign fault names and immutable injection records.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fault names a campaign can iterate over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    /// Journal CRC corruption of the packaged journal.
    BitFlip,
    /// Truncation of the packaged journal.
    TornWrite,
    /// Bit flips in the trailing signature block of the FIT image.
    Signature,
    /// Brownout flag set in the persistent journal.
    Brownout,
    /// Hard kill of the boot process mid-boot.
    PowerCut,
    /// Runtime kill of the attestation verifier.
    VerifierKill,
    /// ECC error count above threshold.
    Ecc,
    /// Watchdog timeout.
    Watchdog,
    /// Over-temperature condition.
    Temperature,
    /// Storage failure.
    Storage,
}

impl FaultType {
    /// Faults injected before the boot process is launched.
    pub const BOOT_TIME: [FaultType; 5] = [
        FaultType::BitFlip,
        FaultType::TornWrite,
        FaultType::Signature,
        FaultType::Brownout,
        FaultType::PowerCut,
    ];

    /// Faults injected once the system has reached its target tier.
    pub const RUNTIME: [FaultType; 5] = [
        FaultType::VerifierKill,
        FaultType::Ecc,
        FaultType::Watchdog,
        FaultType::Temperature,
        FaultType::Storage,
    ];

    /// Snake-case name used in result files and on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BitFlip => "bit_flip",
            Self::TornWrite => "torn_write",
            Self::Signature => "signature",
            Self::Brownout => "brownout",
            Self::PowerCut => "power_cut",
            Self::VerifierKill => "verifier_kill",
            Self::Ecc => "ecc",
            Self::Watchdog => "watchdog",
            Self::Temperature => "temperature",
            Self::Storage => "storage",
        }
    }

    /// Whether the fault belongs to the runtime list.
    #[must_use]
    pub fn is_runtime(self) -> bool {
        Self::RUNTIME.contains(&self)
    }

    /// Whether recovery after this fault means restarting a process rather
    /// than clearing hardware conditions.
    #[must_use]
    pub const fn is_process_fault(self) -> bool {
        matches!(self, Self::VerifierKill)
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::BOOT_TIME
            .into_iter()
            .chain(Self::RUNTIME)
            .find(|fault| fault.as_str() == value)
            .ok_or_else(|| format!("unknown fault type '{value}'"))
    }
}

/// Primitive fault kind carried by a [`FaultRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Random bit flips.
    BitFlip,
    /// Both journal page checksums forced invalid.
    JournalCrcCorruption,
    /// File truncation.
    TornWrite,
    /// Bit flips restricted to the trailing signature region.
    SignatureCorruption,
    /// Brownout flag set in the journal.
    BrownoutFlag,
    /// ECC sentinel written.
    Ecc,
    /// Watchdog sentinel written.
    Watchdog,
    /// Temperature sentinel written.
    Temperature,
    /// Storage sentinel written.
    Storage,
    /// Auxiliary process killed.
    ProcessKill,
    /// Boot process hard-killed mid-boot.
    PowerCut,
}

/// One XOR applied to a file byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitFlip {
    /// Offset of the flipped byte.
    pub byte_offset: u64,
    /// Bit index within the byte, 0..=7.
    pub bit: u8,
    /// Byte value before the flip.
    pub old: u8,
    /// Byte value after the flip.
    pub new: u8,
}

/// One byte overwritten with a fixed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteOverwrite {
    /// Offset of the byte.
    pub offset: u64,
    /// Byte value before the write.
    pub old: u8,
    /// Byte value after the write.
    pub new: u8,
    /// Journal page the byte belongs to.
    pub page: JournalPage,
}

/// Journal page holding a CRC byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalPage {
    /// First page, CRC at offsets 32..=35.
    A,
    /// Second page, CRC at offsets 68..=71.
    B,
}

/// Fault-specific detail, one variant per [`FaultKind`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultDetail {
    /// Random bit flips.
    BitFlip {
        /// Corrupted file.
        target: PathBuf,
        /// File size at injection.
        file_size: u64,
        /// Every flip applied, in order.
        flips: Vec<BitFlip>,
    },
    /// Both journal page checksums forced to `0xFF`.
    JournalCrcCorruption {
        /// Corrupted journal.
        target: PathBuf,
        /// Every byte overwritten.
        bytes: Vec<ByteOverwrite>,
    },
    /// File truncation.
    TornWrite {
        /// Truncated file.
        target: PathBuf,
        /// Size before truncation.
        original_size: u64,
        /// Size after truncation.
        new_size: u64,
        /// Bytes removed.
        truncated_bytes: u64,
    },
    /// Bit flips in the trailing signature region.
    SignatureCorruption {
        /// Corrupted image.
        target: PathBuf,
        /// First byte of the region.
        region_start: u64,
        /// One past the last byte of the region.
        region_end: u64,
        /// Every flip applied, in order.
        flips: Vec<BitFlip>,
    },
    /// Brownout flag set through the journal tool.
    BrownoutFlag {
        /// Journal updated.
        target: PathBuf,
        /// Flags word before the change.
        old_flags: Option<String>,
        /// Flags word after the change.
        new_flags: Option<String>,
        /// Whether the re-read showed the flag.
        verified: bool,
    },
    /// ECC error sentinel.
    Ecc {
        /// Sentinel written.
        flag_file: PathBuf,
        /// Error count written.
        count: u32,
        /// Threshold the count exceeds.
        threshold: u32,
    },
    /// Watchdog timeout sentinel.
    Watchdog {
        /// Sentinel written.
        flag_file: PathBuf,
    },
    /// Temperature sentinel.
    Temperature {
        /// Sentinel written.
        flag_file: PathBuf,
        /// Temperature written, degrees Celsius.
        celsius: u32,
        /// Critical temperature exceeded.
        critical: u32,
    },
    /// Storage failure sentinel.
    Storage {
        /// Sentinel written.
        flag_file: PathBuf,
    },
    /// Auxiliary process killed.
    ProcessKill {
        /// Pattern the kill matched.
        process: String,
    },
    /// Boot process hard-killed mid-boot.
    PowerCut {
        /// Delay between launch and kill, seconds.
        delay_s: f64,
    },
}

impl FaultDetail {
    /// Kind of the fault.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::BitFlip { .. } => FaultKind::BitFlip,
            Self::JournalCrcCorruption { .. } => FaultKind::JournalCrcCorruption,
            Self::TornWrite { .. } => FaultKind::TornWrite,
            Self::SignatureCorruption { .. } => FaultKind::SignatureCorruption,
            Self::BrownoutFlag { .. } => FaultKind::BrownoutFlag,
            Self::Ecc { .. } => FaultKind::Ecc,
            Self::Watchdog { .. } => FaultKind::Watchdog,
            Self::Temperature { .. } => FaultKind::Temperature,
            Self::Storage { .. } => FaultKind::Storage,
            Self::ProcessKill { .. } => FaultKind::ProcessKill,
            Self::PowerCut { .. } => FaultKind::PowerCut,
        }
    }
}

/// Immutable record of one injection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Wall-clock time of the injection.
    pub injected_at: DateTime<Utc>,
    /// Fault-specific detail.
    #[serde(flatten)]
    pub detail: FaultDetail,
}

impl FaultRecord {
    /// Stamp `detail` with the current time.
    #[must_use]
    pub fn now(detail: FaultDetail) -> Self {
        Self {
            injected_at: Utc::now(),
            detail,
        }
    }

    /// Kind of the recorded fault.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        self.detail.kind()
    }
}
