// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Byte-level and flag-based fault primitives with scoped backup and restore.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs::{self, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;

use crate::config::{
    FaultlabConfig, ECC_FLAG_FILE, STORAGE_FLAG_FILE, TEMPERATURE_FLAG_FILE, WATCHDOG_FLAG_FILE,
};
use crate::fault::{BitFlip, ByteOverwrite, FaultDetail, FaultRecord, FaultType, JournalPage};
use crate::tools::{self, apply_policy, ExternalCall, JournalFlag, JournalTool};
use crate::{FaultlabError, Result, LOG_TARGET};

/// Size of the two-page journal.
pub const JOURNAL_LEN: u64 = 72;
/// CRC bytes of journal page A.
pub const PAGE_A_CRC: Range<u64> = 32..36;
/// CRC bytes of journal page B.
pub const PAGE_B_CRC: Range<u64> = 68..72;

const BACKUP_SUFFIX: &str = ".bak";

/// Applies faults to the files and flag sentinels named by the configuration.
///
/// Every byte-level primitive copies its target into the backup directory
/// before the first byte changes. Backups are keyed by file name.
#[derive(Debug, Clone, Copy)]
pub struct Injector<'a> {
    config: &'a FaultlabConfig,
}

impl<'a> Injector<'a> {
    /// Injector over `config`.
    #[must_use]
    pub fn new(config: &'a FaultlabConfig) -> Self {
        Self { config }
    }

    /// Backup location for `target`.
    pub fn backup_path(&self, target: &Path) -> Result<PathBuf> {
        let name = target
            .file_name()
            .ok_or_else(|| FaultlabError::injection(target, "target has no file name"))?;
        let mut backup = name.to_os_string();
        backup.push(BACKUP_SUFFIX);
        Ok(self.config.paths.backup_dir.join(backup))
    }

    /// Copy `target` into the backup directory, replacing any older copy.
    pub fn backup_file(&self, target: &Path) -> Result<PathBuf> {
        let backup = self.backup_path(target)?;
        fs::create_dir_all(&self.config.paths.backup_dir)
            .map_err(|err| FaultlabError::injection(target, format!("create backup dir: {err}")))?;
        fs::copy(target, &backup)
            .map_err(|err| FaultlabError::injection(target, format!("backup failed: {err}")))?;
        debug!(target: LOG_TARGET, "backed up {} to {}", target.display(), backup.display());
        Ok(backup)
    }

    /// Copy the backup of `target` back over it and consume the backup.
    pub fn restore_file(&self, target: &Path) -> Result<()> {
        let backup = self
            .backup_path(target)
            .map_err(|err| FaultlabError::restore(target, err.to_string()))?;
        if !backup.is_file() {
            return Err(FaultlabError::restore(target, "no backup present"));
        }
        copy_back(&backup, target)?;
        let _ = fs::remove_file(&backup);
        info!(target: LOG_TARGET, "restored {}", target.display());
        Ok(())
    }

    /// Restore every backup to its most plausible original location.
    ///
    /// Candidate directories are tried in configured order; a backup lands in
    /// the first one already holding a file of the same name. The packaged
    /// journal directory accepts its journal even when the file is gone. Each
    /// restored backup is consumed. When a journal came back the boot image
    /// is rebuilt. Per-file failures are logged and skipped.
    pub fn restore_all(&self) -> Result<usize> {
        let backup_dir = &self.config.paths.backup_dir;
        if !backup_dir.is_dir() {
            return Ok(0);
        }
        let mut backups: Vec<PathBuf> = fs::read_dir(backup_dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && has_backup_suffix(path))
            .collect();
        backups.sort();

        let mut restored = 0;
        let mut journal_restored = false;
        for backup in backups {
            let Some(original_name) = original_name(&backup) else {
                continue;
            };
            let Some(target) = self.restore_target(&original_name) else {
                warn!(
                    target: LOG_TARGET,
                    "no restore location for backup {}", backup.display()
                );
                continue;
            };
            match copy_back(&backup, &target) {
                Ok(()) => {
                    let _ = fs::remove_file(&backup);
                    restored += 1;
                    journal_restored |= original_name.contains("journal");
                }
                Err(err) => warn!(target: LOG_TARGET, "{err}"),
            }
        }

        if journal_restored && tools::rebuild_image_best_effort(self.config) {
            info!(target: LOG_TARGET, "boot image rebuilt with clean journal");
        }
        if restored > 0 {
            info!(target: LOG_TARGET, "restored {restored} files");
        }
        Ok(restored)
    }

    fn restore_target(&self, original_name: &str) -> Option<PathBuf> {
        let packaged = &self.config.paths.rootfs_journal;
        self.config.paths.restore_dirs.iter().find_map(|dir| {
            let candidate = dir.join(original_name);
            let is_packaged_journal = candidate == *packaged;
            (candidate.exists() || is_packaged_journal).then_some(candidate)
        })
    }

    /// XOR `num_flips` random bits within `range` (clamped to the file).
    ///
    /// Flips are independent; two may hit the same bit and cancel out.
    pub fn inject_bit_flip<R: Rng>(
        &self,
        target: &Path,
        num_flips: usize,
        range: Option<Range<u64>>,
        rng: &mut R,
    ) -> Result<FaultRecord> {
        let (file_size, _, flips) = self.flip_bits(target, num_flips, range, rng)?;
        info!(target: LOG_TARGET, "injected {num_flips} bit flip(s) into {}", target.display());
        Ok(FaultRecord::now(FaultDetail::BitFlip {
            target: target.to_path_buf(),
            file_size,
            flips,
        }))
    }

    /// Force both journal page checksums invalid by writing `0xFF` to every CRC byte.
    pub fn inject_journal_crc_corruption(&self, target: &Path) -> Result<FaultRecord> {
        let mut data = read_target(target)?;
        let size = data.len() as u64;
        if size <= PAGE_A_CRC.start {
            return Err(FaultlabError::injection(
                target,
                format!("journal too short for CRC corruption ({size} bytes)"),
            ));
        }
        if size != JOURNAL_LEN {
            warn!(
                target: LOG_TARGET,
                "expected {JOURNAL_LEN}-byte journal, got {size} bytes"
            );
        }
        self.backup_file(target)?;

        let mut bytes = Vec::with_capacity(8);
        for (page, crc) in [(JournalPage::A, PAGE_A_CRC), (JournalPage::B, PAGE_B_CRC)] {
            for offset in crc.start..crc.end.min(size) {
                let slot = &mut data[offset as usize];
                bytes.push(ByteOverwrite {
                    offset,
                    old: *slot,
                    new: 0xFF,
                    page,
                });
                *slot = 0xFF;
            }
        }
        write_target(target, &data)?;
        info!(
            target: LOG_TARGET,
            "invalidated both journal CRCs in {} ({} bytes)",
            target.display(),
            bytes.len()
        );
        Ok(FaultRecord::now(FaultDetail::JournalCrcCorruption {
            target: target.to_path_buf(),
            bytes,
        }))
    }

    /// Truncate `target` by `truncate_bytes`, or a random default amount.
    pub fn inject_torn_write<R: Rng>(
        &self,
        target: &Path,
        truncate_bytes: Option<u64>,
        rng: &mut R,
    ) -> Result<FaultRecord> {
        let original_size = target_len(target)?;
        let requested =
            truncate_bytes.unwrap_or_else(|| rng.gen_range(self.config.faults.torn_write_bytes.clone()));
        self.backup_file(target)?;

        let new_size = original_size.saturating_sub(requested);
        OpenOptions::new()
            .write(true)
            .open(target)
            .and_then(|file| file.set_len(new_size))
            .map_err(|err| FaultlabError::injection(target, format!("truncate: {err}")))?;
        info!(
            target: LOG_TARGET,
            "torn write: {} truncated {original_size} -> {new_size}",
            target.display()
        );
        Ok(FaultRecord::now(FaultDetail::TornWrite {
            target: target.to_path_buf(),
            original_size,
            new_size,
            truncated_bytes: original_size - new_size,
        }))
    }

    /// Flip bits in the trailing signature region of `target`.
    pub fn inject_signature_corruption<R: Rng>(
        &self,
        target: &Path,
        num_flips: Option<usize>,
        rng: &mut R,
    ) -> Result<FaultRecord> {
        let size = target_len(target)?;
        let area = self.config.faults.signature_region_max.min(size / 2);
        let num_flips =
            num_flips.unwrap_or_else(|| rng.gen_range(self.config.faults.signature_flips.clone()));
        let (_, region, flips) = self.flip_bits(target, num_flips, Some(size - area..size), rng)?;
        info!(
            target: LOG_TARGET,
            "signature corruption: {num_flips} flips in last {} KiB of {}",
            area / 1024,
            target.display()
        );
        Ok(FaultRecord::now(FaultDetail::SignatureCorruption {
            target: target.to_path_buf(),
            region_start: region.start,
            region_end: region.end,
            flips,
        }))
    }

    fn flip_bits<R: Rng>(
        &self,
        target: &Path,
        num_flips: usize,
        range: Option<Range<u64>>,
        rng: &mut R,
    ) -> Result<(u64, Range<u64>, Vec<BitFlip>)> {
        let mut data = read_target(target)?;
        let size = data.len() as u64;
        let region = clamp_range(range, size);
        self.backup_file(target)?;

        let flips = (0..num_flips)
            .map(|_| {
                let byte_offset = rng.gen_range(region.clone());
                let bit = rng.gen_range(0..8u8);
                let slot = &mut data[byte_offset as usize];
                let old = *slot;
                *slot ^= 1 << bit;
                BitFlip {
                    byte_offset,
                    bit,
                    old,
                    new: *slot,
                }
            })
            .collect();
        write_target(target, &data)?;
        Ok((size, region, flips))
    }

    /// Set the brownout flag in `journal` and rebuild the boot image.
    ///
    /// The journal is initialised if absent, the current flags word recorded,
    /// the brownout and recovery-blocking flags cleared, the journal backed up,
    /// and the brownout flag set. A failed verification read is logged only.
    pub fn inject_brownout_flag(&self, journal: &Path) -> Result<FaultRecord> {
        let tool = JournalTool::new(self.config);
        if !tool.available() {
            return Err(FaultlabError::injection(
                journal,
                format!("journal tool not found at {}", self.config.paths.journal_tool.display()),
            ));
        }
        if let Some(parent) = journal.parent() {
            fs::create_dir_all(parent)?;
        }
        if !journal.exists() {
            info!(target: LOG_TARGET, "initialising journal at {}", journal.display());
            apply_policy(ExternalCall::JournalInit, tool.init(journal))?;
        }
        let old_flags = apply_policy(ExternalCall::JournalRead, tool.read(journal))?
            .and_then(|reading| reading.flags);

        tool.clear_flags_best_effort(
            &[
                JournalFlag::Brownout,
                JournalFlag::Emergency,
                JournalFlag::Quarantine,
                JournalFlag::Dirty,
            ],
            journal,
        );
        if !journal.is_file() {
            return Err(FaultlabError::injection(journal, "journal missing after init"));
        }
        self.backup_file(journal)?;
        tool.set_flag(JournalFlag::Brownout, journal)
            .map_err(|err| FaultlabError::injection(journal, format!("set brownout: {err}")))?;

        let verify = apply_policy(ExternalCall::JournalRead, tool.read(journal))?;
        let verified = verify
            .as_ref()
            .is_some_and(|reading| reading.shows(JournalFlag::Brownout));
        if verified {
            info!(target: LOG_TARGET, "brownout flag verified in {}", journal.display());
        } else {
            warn!(target: LOG_TARGET, "brownout flag not visible in journal output");
        }
        let new_flags = verify.and_then(|reading| reading.flags);
        tools::rebuild_image_best_effort(self.config);
        Ok(FaultRecord::now(FaultDetail::BrownoutFlag {
            target: journal.to_path_buf(),
            old_flags,
            new_flags,
            verified,
        }))
    }

    /// Write the ECC sentinel with `count` errors.
    pub fn inject_ecc(&self, count: u32) -> Result<FaultRecord> {
        let flag_file = self.write_flag(ECC_FLAG_FILE, &format!("{count}\n"))?;
        info!(target: LOG_TARGET, "simulating {count} ECC errors");
        Ok(FaultRecord::now(FaultDetail::Ecc {
            flag_file,
            count,
            threshold: self.config.faults.ecc_threshold,
        }))
    }

    /// Write the watchdog timeout sentinel.
    pub fn inject_watchdog(&self) -> Result<FaultRecord> {
        let stamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        let flag_file = self.write_flag(WATCHDOG_FLAG_FILE, &format!("timeout\n{stamp}\n"))?;
        info!(target: LOG_TARGET, "simulating watchdog timeout");
        Ok(FaultRecord::now(FaultDetail::Watchdog { flag_file }))
    }

    /// Write the temperature sentinel.
    pub fn inject_temperature(&self, celsius: u32) -> Result<FaultRecord> {
        let flag_file = self.write_flag(TEMPERATURE_FLAG_FILE, &format!("{celsius}\n"))?;
        info!(target: LOG_TARGET, "simulating temperature {celsius} C");
        Ok(FaultRecord::now(FaultDetail::Temperature {
            flag_file,
            celsius,
            critical: self.config.faults.critical_celsius,
        }))
    }

    /// Write the storage failure sentinel.
    pub fn inject_storage(&self) -> Result<FaultRecord> {
        let flag_file = self.write_flag(STORAGE_FLAG_FILE, "1\n")?;
        info!(target: LOG_TARGET, "simulating storage failure");
        Ok(FaultRecord::now(FaultDetail::Storage { flag_file }))
    }

    /// Inject a flag-based fault with parameters drawn from the configured ranges.
    pub fn inject_flag_fault<R: Rng>(
        &self,
        fault: FaultType,
        rng: &mut R,
    ) -> Result<FaultRecord> {
        let defaults = &self.config.faults;
        match fault {
            FaultType::Ecc => self.inject_ecc(rng.gen_range(defaults.ecc_count.clone())),
            FaultType::Watchdog => self.inject_watchdog(),
            FaultType::Temperature => {
                self.inject_temperature(rng.gen_range(defaults.temperature_celsius.clone()))
            }
            FaultType::Storage => self.inject_storage(),
            other => Err(FaultlabError::injection(
                &self.config.flag_dir,
                format!("{other} is not a flag-based fault"),
            )),
        }
    }

    /// Remove every flag sentinel that exists. Returns how many were removed.
    pub fn clear_fault_flags(&self) -> usize {
        let cleared = self
            .config
            .flag_paths()
            .iter()
            .filter(|path| path.exists())
            .filter(|path| match fs::remove_file(path) {
                Ok(()) => true,
                Err(err) => {
                    warn!(target: LOG_TARGET, "failed to clear {}: {err}", path.display());
                    false
                }
            })
            .count();
        if cleared > 0 {
            info!(target: LOG_TARGET, "cleared {cleared} fault flags");
        }
        cleared
    }

    fn write_flag(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.config.flag_path(name);
        fs::write(&path, contents)
            .map_err(|err| FaultlabError::injection(&path, format!("write flag: {err}")))?;
        Ok(path)
    }
}

/// Clamp a requested byte range to a non-empty range inside `size` bytes.
fn clamp_range(range: Option<Range<u64>>, size: u64) -> Range<u64> {
    match range {
        Some(range) => {
            let start = range.start.min(size - 1);
            let end = range.end.min(size).max(start + 1);
            start..end
        }
        None => 0..size,
    }
}

fn has_backup_suffix(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(BACKUP_SUFFIX) && name.len() > BACKUP_SUFFIX.len())
}

fn original_name(backup: &Path) -> Option<String> {
    backup
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(BACKUP_SUFFIX))
        .map(str::to_owned)
}

fn target_len(target: &Path) -> Result<u64> {
    let meta = fs::metadata(target)
        .map_err(|err| FaultlabError::injection(target, format!("target unreadable: {err}")))?;
    if meta.len() == 0 {
        return Err(FaultlabError::injection(target, "file is empty"));
    }
    Ok(meta.len())
}

fn read_target(target: &Path) -> Result<Vec<u8>> {
    let data = fs::read(target)
        .map_err(|err| FaultlabError::injection(target, format!("target unreadable: {err}")))?;
    if data.is_empty() {
        return Err(FaultlabError::injection(target, "file is empty"));
    }
    Ok(data)
}

fn write_target(target: &Path, data: &[u8]) -> Result<()> {
    fs::write(target, data)
        .map_err(|err| FaultlabError::injection(target, format!("write back: {err}")))
}

fn copy_back(backup: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| FaultlabError::restore(target, format!("create parent: {err}")))?;
    }
    fs::copy(backup, target)
        .map(drop)
        .map_err(|err| FaultlabError::restore(target, format!("copy from {}: {err}", backup.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_clamped_into_file() {
        assert_eq!(clamp_range(None, 10), 0..10);
        assert_eq!(clamp_range(Some(4..100), 10), 4..10);
        assert_eq!(clamp_range(Some(50..60), 10), 9..10);
        assert_eq!(clamp_range(Some(3..3), 10), 3..4);
    }

    #[test]
    fn backup_names_round_trip() {
        let backup = Path::new("/b/journal.dat.bak");
        assert!(has_backup_suffix(backup));
        assert_eq!(original_name(backup).as_deref(), Some("journal.dat"));
        assert!(!has_backup_suffix(Path::new("/b/.bak")));
    }
}
