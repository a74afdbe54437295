// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load and resolve the faultlab harness configuration.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "FAULTLAB_CONFIG";
/// Configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "faultlab.toml";

/// Sentinel file polled by the booted system for ECC error injection.
pub const ECC_FLAG_FILE: &str = "inject_ecc_errors";
/// Sentinel file polled by the booted system for watchdog timeouts.
pub const WATCHDOG_FLAG_FILE: &str = "inject_watchdog_fault";
/// Sentinel file polled by the booted system for over-temperature.
pub const TEMPERATURE_FLAG_FILE: &str = "inject_temperature";
/// Sentinel file polled by the booted system for storage failure.
pub const STORAGE_FLAG_FILE: &str = "inject_storage_fault";

/// Harness configuration, constructed once per run and passed by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultlabConfig {
    /// Filesystem locations used by the harness.
    pub paths: PathsConfig,
    /// Boot image rebuild inputs and outputs.
    pub image: ImageConfig,
    /// Directory holding flag-file sentinels.
    pub flag_dir: PathBuf,
    /// Bounded wait durations.
    pub timing: TimingConfig,
    /// Environment sweep performed before each trial.
    pub cleanup: CleanupConfig,
    /// Attestation verifier process control.
    pub verifier: VerifierConfig,
    /// Default fault parameter ranges.
    pub faults: FaultDefaults,
}

/// Filesystem locations used by the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsConfig {
    /// Lab root every relative path resolves against.
    pub root: PathBuf,
    /// Backup directory for pre-fault copies.
    pub backup_dir: PathBuf,
    /// Directory receiving campaign result JSON.
    pub results_dir: PathBuf,
    /// Boot launcher script; run directly when executable, through `sh` otherwise.
    pub boot_script: PathBuf,
    /// Journal tool executable.
    pub journal_tool: PathBuf,
    /// Journal packaged into the boot image.
    pub rootfs_journal: PathBuf,
    /// Journal on the persistent var partition.
    pub var_journal: PathBuf,
    /// Signed FIT image targeted by signature corruption.
    pub fit_image: PathBuf,
    /// Ordered candidate directories used to place restored backups.
    pub restore_dirs: Vec<PathBuf>,
}

/// Boot image rebuild inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// Root filesystem tree packed into the archive.
    pub rootfs_dir: PathBuf,
    /// Directory receiving the archives.
    pub image_dir: PathBuf,
    /// Archive file names; the first is written, the rest are copies.
    pub archives: Vec<String>,
}

/// Bounded wait durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Observation window for boot-time trials.
    pub boot_window: Duration,
    /// Observation window for chaos boot-fault scenarios.
    pub chaos_boot_window: Duration,
    /// Global timeout while waiting for a target tier.
    pub boot_timeout: Duration,
    /// Hold time at the target tier before runtime injection.
    pub runtime_settle: Duration,
    /// Hold time at the target tier for chaos scenarios.
    pub chaos_settle: Duration,
    /// Grace period between runtime injection and degradation monitoring.
    pub detection_delay: Duration,
    /// Degradation monitoring window.
    pub degradation_window: Duration,
    /// Degradation monitoring window for chaos scenarios.
    pub chaos_degradation_window: Duration,
    /// Recovery window after restarting a killed process.
    pub process_recovery_window: Duration,
    /// Recovery window after clearing hardware fault conditions.
    pub hardware_recovery_window: Duration,
    /// Progress heartbeat interval while observing.
    pub heartbeat: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Pause after the environment sweep.
    pub cleanup_settle: Duration,
    /// Range of delays before a simulated power cut.
    pub power_cut_delay: RangeInclusive<Duration>,
    /// Pause after a simulated power cut before rebooting.
    pub power_cut_settle: Duration,
    /// Range of delays between cascading chaos faults.
    pub cascade_delay: RangeInclusive<Duration>,
    /// Pause between consecutive trials.
    pub trial_delay: Duration,
    /// Timeout for journal tool and process-control invocations.
    pub tool_timeout: Duration,
    /// Timeout for the boot image rebuild.
    pub rebuild_timeout: Duration,
}

/// Environment sweep performed before each trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Process names killed with `pkill -9`.
    pub process_names: Vec<String>,
    /// Glob patterns of scratch files and sockets to remove.
    pub scratch_patterns: Vec<String>,
}

/// Attestation verifier process control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Command line launching the verifier.
    pub command: Vec<String>,
    /// Pattern matched against full command lines by `pgrep -f`/`pkill -f`.
    pub match_pattern: String,
    /// Wait after launching before checking liveness.
    pub startup_wait: Duration,
}

/// Default fault parameter ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultDefaults {
    /// ECC error counts injected.
    pub ecc_count: RangeInclusive<u32>,
    /// Error count above which the booted system reacts.
    pub ecc_threshold: u32,
    /// Temperatures injected, in degrees Celsius.
    pub temperature_celsius: RangeInclusive<u32>,
    /// Critical temperature of the booted system.
    pub critical_celsius: u32,
    /// Bytes truncated from the journal by boot-time torn writes.
    pub journal_truncate_bytes: RangeInclusive<u64>,
    /// Bytes truncated by a torn write without an explicit size.
    pub torn_write_bytes: RangeInclusive<u64>,
    /// Bit flips applied by signature corruption.
    pub signature_flips: RangeInclusive<usize>,
    /// Upper bound on the trailing signature region.
    pub signature_region_max: u64,
}

impl FaultlabConfig {
    /// Built-in defaults rooted at `root`.
    #[must_use]
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self::from_toml(root.into(), ConfigToml::default())
    }

    /// Full path of a flag-file sentinel.
    #[must_use]
    pub fn flag_path(&self, name: &str) -> PathBuf {
        self.flag_dir.join(name)
    }

    /// Paths of all flag-file sentinels in a fixed order.
    #[must_use]
    pub fn flag_paths(&self) -> [PathBuf; 4] {
        [
            self.flag_path(ECC_FLAG_FILE),
            self.flag_path(WATCHDOG_FLAG_FILE),
            self.flag_path(TEMPERATURE_FLAG_FILE),
            self.flag_path(STORAGE_FLAG_FILE),
        ]
    }

    fn from_toml(fallback_root: PathBuf, parsed: ConfigToml) -> Self {
        let root = parsed.paths.root.map_or(fallback_root.clone(), |root| {
            resolve(&fallback_root, &root)
        });
        let at = |path: &str| resolve(&root, Path::new(path));
        let paths = PathsConfig {
            backup_dir: at(&parsed.paths.backup_dir),
            results_dir: at(&parsed.paths.results_dir),
            boot_script: at(&parsed.paths.boot_script),
            journal_tool: at(&parsed.paths.journal_tool),
            rootfs_journal: at(&parsed.paths.rootfs_journal),
            var_journal: at(&parsed.paths.var_journal),
            fit_image: at(&parsed.paths.fit_image),
            restore_dirs: parsed.paths.restore_dirs.iter().map(|dir| at(dir)).collect(),
            root: root.clone(),
        };
        let image = ImageConfig {
            rootfs_dir: at(&parsed.image.rootfs_dir),
            image_dir: at(&parsed.image.image_dir),
            archives: parsed.image.archives,
        };
        let t = &parsed.timing;
        let timing = TimingConfig {
            boot_window: ms(t.boot_window_ms),
            chaos_boot_window: ms(t.chaos_boot_window_ms),
            boot_timeout: ms(t.boot_timeout_ms),
            runtime_settle: ms(t.runtime_settle_ms),
            chaos_settle: ms(t.chaos_settle_ms),
            detection_delay: ms(t.detection_delay_ms),
            degradation_window: ms(t.degradation_window_ms),
            chaos_degradation_window: ms(t.chaos_degradation_window_ms),
            process_recovery_window: ms(t.process_recovery_window_ms),
            hardware_recovery_window: ms(t.hardware_recovery_window_ms),
            heartbeat: ms(t.heartbeat_ms),
            stop_grace: ms(t.stop_grace_ms),
            cleanup_settle: ms(t.cleanup_settle_ms),
            power_cut_delay: ms(t.power_cut_min_ms)..=ms(t.power_cut_max_ms),
            power_cut_settle: ms(t.power_cut_settle_ms),
            cascade_delay: ms(t.cascade_min_ms)..=ms(t.cascade_max_ms),
            trial_delay: ms(t.trial_delay_ms),
            tool_timeout: ms(t.tool_timeout_ms),
            rebuild_timeout: ms(t.rebuild_timeout_ms),
        };
        let verifier_command = parsed
            .verifier
            .command
            .iter()
            .enumerate()
            .map(|(idx, arg)| {
                // Arguments naming files under the lab root are resolved; the
                // interpreter itself is taken from PATH.
                if idx > 0 && Path::new(arg).is_relative() && arg.contains('/') {
                    at(arg).display().to_string()
                } else {
                    arg.clone()
                }
            })
            .collect();
        let f = &parsed.faults;
        Self {
            paths,
            image,
            flag_dir: resolve(&root, Path::new(&parsed.flags.dir)),
            timing,
            cleanup: CleanupConfig {
                process_names: parsed.cleanup.process_names,
                scratch_patterns: parsed.cleanup.scratch_patterns,
            },
            verifier: VerifierConfig {
                command: verifier_command,
                match_pattern: parsed.verifier.match_pattern,
                startup_wait: ms(parsed.verifier.startup_ms),
            },
            faults: FaultDefaults {
                ecc_count: f.ecc_count_min..=f.ecc_count_max,
                ecc_threshold: f.ecc_threshold,
                temperature_celsius: f.temperature_min..=f.temperature_max,
                critical_celsius: f.critical_celsius,
                journal_truncate_bytes: f.journal_truncate_min..=f.journal_truncate_max,
                torn_write_bytes: f.torn_write_min..=f.torn_write_max,
                signature_flips: f.signature_flips_min..=f.signature_flips_max,
                signature_region_max: f.signature_region_max,
            },
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigToml {
    paths: PathsToml,
    image: ImageToml,
    flags: FlagsToml,
    timing: TimingToml,
    cleanup: CleanupToml,
    verifier: VerifierToml,
    faults: FaultsToml,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PathsToml {
    root: Option<PathBuf>,
    backup_dir: String,
    results_dir: String,
    boot_script: String,
    journal_tool: String,
    rootfs_journal: String,
    var_journal: String,
    fit_image: String,
    restore_dirs: Vec<String>,
}

impl Default for PathsToml {
    fn default() -> Self {
        Self {
            root: None,
            backup_dir: "faultlab/backups".to_owned(),
            results_dir: "faultlab/results".to_owned(),
            boot_script: "faultlab/qemu_boot_noninteractive.sh".to_owned(),
            journal_tool: "journal/journal_tool".to_owned(),
            rootfs_journal: "tier1_initramfs/rootfs/var/pac/journal.dat".to_owned(),
            var_journal: "var/pac/journal.dat".to_owned(),
            fit_image: "boot/fit/fit.itb".to_owned(),
            restore_dirs: vec![
                "tier1_initramfs/rootfs/var/pac".to_owned(),
                "var/pac".to_owned(),
                "boot/fit".to_owned(),
                "tier1_initramfs".to_owned(),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ImageToml {
    rootfs_dir: String,
    image_dir: String,
    archives: Vec<String>,
}

impl Default for ImageToml {
    fn default() -> Self {
        Self {
            rootfs_dir: "tier1_initramfs/rootfs".to_owned(),
            image_dir: "tier1_initramfs/img".to_owned(),
            archives: vec![
                "initramfs.cpio.gz".to_owned(),
                "pac_initramfs.cpio.gz".to_owned(),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FlagsToml {
    dir: String,
}

impl Default for FlagsToml {
    fn default() -> Self {
        Self {
            dir: "/tmp".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TimingToml {
    boot_window_ms: u64,
    chaos_boot_window_ms: u64,
    boot_timeout_ms: u64,
    runtime_settle_ms: u64,
    chaos_settle_ms: u64,
    detection_delay_ms: u64,
    degradation_window_ms: u64,
    chaos_degradation_window_ms: u64,
    process_recovery_window_ms: u64,
    hardware_recovery_window_ms: u64,
    heartbeat_ms: u64,
    stop_grace_ms: u64,
    cleanup_settle_ms: u64,
    power_cut_min_ms: u64,
    power_cut_max_ms: u64,
    power_cut_settle_ms: u64,
    cascade_min_ms: u64,
    cascade_max_ms: u64,
    trial_delay_ms: u64,
    tool_timeout_ms: u64,
    rebuild_timeout_ms: u64,
}

impl Default for TimingToml {
    fn default() -> Self {
        Self {
            boot_window_ms: 60_000,
            chaos_boot_window_ms: 90_000,
            boot_timeout_ms: 180_000,
            runtime_settle_ms: 60_000,
            chaos_settle_ms: 20_000,
            detection_delay_ms: 5_000,
            degradation_window_ms: 120_000,
            chaos_degradation_window_ms: 60_000,
            process_recovery_window_ms: 120_000,
            hardware_recovery_window_ms: 180_000,
            heartbeat_ms: 10_000,
            stop_grace_ms: 1_000,
            cleanup_settle_ms: 2_000,
            power_cut_min_ms: 2_000,
            power_cut_max_ms: 8_000,
            power_cut_settle_ms: 2_000,
            cascade_min_ms: 10_000,
            cascade_max_ms: 20_000,
            trial_delay_ms: 5_000,
            tool_timeout_ms: 5_000,
            rebuild_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CleanupToml {
    process_names: Vec<String>,
    scratch_patterns: Vec<String>,
}

impl Default for CleanupToml {
    fn default() -> Self {
        Self {
            process_names: vec![
                "qemu-system-aarch64".to_owned(),
                "qemu".to_owned(),
                "swtpm".to_owned(),
            ],
            scratch_patterns: vec![
                "/tmp/inject_*".to_owned(),
                "/tmp/tpm-state*".to_owned(),
                "/tmp/swtpm*.sock".to_owned(),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct VerifierToml {
    command: Vec<String>,
    match_pattern: String,
    startup_ms: u64,
}

impl Default for VerifierToml {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_owned(), "verifier/verifier.py".to_owned()],
            match_pattern: "verifier.py".to_owned(),
            startup_ms: 3_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FaultsToml {
    ecc_count_min: u32,
    ecc_count_max: u32,
    ecc_threshold: u32,
    temperature_min: u32,
    temperature_max: u32,
    critical_celsius: u32,
    journal_truncate_min: u64,
    journal_truncate_max: u64,
    torn_write_min: u64,
    torn_write_max: u64,
    signature_flips_min: usize,
    signature_flips_max: usize,
    signature_region_max: u64,
}

impl Default for FaultsToml {
    fn default() -> Self {
        Self {
            ecc_count_min: 11,
            ecc_count_max: 20,
            ecc_threshold: 10,
            temperature_min: 86,
            temperature_max: 95,
            critical_celsius: 85,
            journal_truncate_min: 50,
            journal_truncate_max: 65,
            torn_write_min: 30,
            torn_write_max: 55,
            signature_flips_min: 50,
            signature_flips_max: 100,
            signature_region_max: 100 * 1024,
        }
    }
}

/// Resolve which configuration file to load, if any.
///
/// Order: explicit path, `FAULTLAB_CONFIG`, `faultlab.toml` in the working
/// directory. `None` means built-in defaults.
#[must_use]
pub fn resolve_config_path(cli_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path);
    }
    if let Ok(value) = std::env::var(CONFIG_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    candidate.is_file().then_some(candidate)
}

/// Load the configuration from `path`, or defaults rooted at the working
/// directory when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<FaultlabConfig> {
    let cwd = std::env::current_dir().context("resolve working directory")?;
    let Some(path) = path else {
        return Ok(FaultlabConfig::for_root(cwd));
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read faultlab config {}", path.display()))?;
    let parsed: ConfigToml = toml::from_str(&text)
        .with_context(|| format!("invalid faultlab config TOML in {}", path.display()))?;
    validate(&parsed).with_context(|| format!("invalid faultlab config {}", path.display()))?;
    let base = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or(cwd.clone(), |parent| resolve(&cwd, parent));
    Ok(FaultlabConfig::from_toml(base, parsed))
}

/// Parse configuration text relative to `root` (used by tests and tools).
pub fn parse_config(root: &Path, text: &str) -> Result<FaultlabConfig> {
    let parsed: ConfigToml = toml::from_str(text).context("invalid faultlab config TOML")?;
    validate(&parsed)?;
    Ok(FaultlabConfig::from_toml(root.to_path_buf(), parsed))
}

fn validate(parsed: &ConfigToml) -> Result<()> {
    let t = &parsed.timing;
    if t.power_cut_min_ms > t.power_cut_max_ms {
        return Err(anyhow!("timing.power_cut_min_ms exceeds power_cut_max_ms"));
    }
    if t.cascade_min_ms > t.cascade_max_ms {
        return Err(anyhow!("timing.cascade_min_ms exceeds cascade_max_ms"));
    }
    if t.heartbeat_ms == 0 {
        return Err(anyhow!("timing.heartbeat_ms must be >= 1"));
    }
    let f = &parsed.faults;
    if f.ecc_count_min > f.ecc_count_max
        || f.temperature_min > f.temperature_max
        || f.journal_truncate_min > f.journal_truncate_max
        || f.torn_write_min > f.torn_write_max
        || f.signature_flips_min > f.signature_flips_max
    {
        return Err(anyhow!("faults ranges must have min <= max"));
    }
    if parsed.image.archives.is_empty() {
        return Err(anyhow!("image.archives must name at least one archive"));
    }
    if parsed.verifier.command.is_empty() {
        return Err(anyhow!("verifier.command must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_under_root() {
        let config = FaultlabConfig::for_root("/lab");
        assert_eq!(config.paths.backup_dir, PathBuf::from("/lab/faultlab/backups"));
        assert_eq!(
            config.paths.rootfs_journal,
            PathBuf::from("/lab/tier1_initramfs/rootfs/var/pac/journal.dat")
        );
        assert_eq!(config.flag_dir, PathBuf::from("/tmp"));
        assert_eq!(
            config.verifier.command,
            vec!["python3".to_owned(), "/lab/verifier/verifier.py".to_owned()]
        );
        assert_eq!(config.timing.boot_window, Duration::from_secs(60));
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let text = "[timing]\nboot_window_ms = 250\n\n[flags]\ndir = \"flags\"\n";
        let config = parse_config(Path::new("/lab"), text).expect("parse config");
        assert_eq!(config.timing.boot_window, Duration::from_millis(250));
        assert_eq!(config.timing.detection_delay, Duration::from_secs(5));
        assert_eq!(config.flag_dir, PathBuf::from("/lab/flags"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = parse_config(Path::new("/lab"), "[timing]\nboot_window = 1\n").unwrap_err();
        assert!(format!("{err:#}").contains("unknown field"));
    }

    #[test]
    fn example_file_matches_builtin_defaults() {
        let text = include_str!("../../../faultlab.example.toml");
        let config = parse_config(Path::new("/lab"), text).expect("parse example");
        assert_eq!(config, FaultlabConfig::for_root("/lab"));
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let text = "[timing]\npower_cut_min_ms = 9000\npower_cut_max_ms = 1000\n";
        assert!(parse_config(Path::new("/lab"), text).is_err());
    }
}
