// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Classify boot console output into recovery tiers and keep per-run tier histories.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Tier inference for the tiered boot pipeline.
//!
//! The booted system never reports its state in a structured form; all the
//! harness sees is console text. This crate turns individual lines into
//! [`TierEvent`]s and accumulates them into an append-only [`TierHistory`]
//! whose latest entry is the current tier. Nothing here performs I/O.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Console markers that end classification for a run.
pub const FAILURE_MARKERS: [&str; 2] = ["kernel panic", "emergency mode"];
/// Prefix of explicit tier status lines (`Current Tier: N`, `Tier: N`).
pub const STATUS_MARKER: &str = "Tier: ";

/// Ordered recovery level reported by the booted system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Tier {
    /// Failed boot or emergency shell.
    Failed,
    /// Minimal initramfs tier.
    T1,
    /// Intermediate tier.
    T2,
    /// Fully operational tier.
    T3,
}

impl Tier {
    /// All tiers in ascending order.
    pub const ALL: [Tier; 4] = [Tier::Failed, Tier::T1, Tier::T2, Tier::T3];

    /// Map a numeric level onto a tier.
    #[must_use]
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Failed),
            1 => Some(Self::T1),
            2 => Some(Self::T2),
            3 => Some(Self::T3),
            _ => None,
        }
    }

    /// Numeric level of the tier.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Failed => 0,
            Self::T1 => 1,
            Self::T2 => 2,
            Self::T3 => 3,
        }
    }

    /// Whether the tier counts as a successful boot.
    #[must_use]
    pub const fn is_operational(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.level()
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::from_level(level).ok_or_else(|| format!("tier level {level} out of range 0..=3"))
    }
}

/// Classification outcome for a single console line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierEvent {
    /// A tier announced itself as established or operational.
    Established(Tier),
    /// An explicit `Tier: N` status line; may move the tier downwards.
    Status(Tier),
    /// Terminal failure marker (panic or emergency shell).
    Failure,
}

impl TierEvent {
    /// Tier implied by the event.
    #[must_use]
    pub const fn tier(self) -> Tier {
        match self {
            Self::Established(tier) | Self::Status(tier) => tier,
            Self::Failure => Tier::Failed,
        }
    }
}

/// Classify one line of console output without any per-run state.
///
/// Failure markers win over any tier claim on the same line, status lines
/// win over establishment announcements.
#[must_use]
pub fn classify_line(line: &str) -> Option<TierEvent> {
    let lower = line.to_ascii_lowercase();
    if FAILURE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(TierEvent::Failure);
    }
    if let Some(tier) = parse_status(line) {
        return Some(TierEvent::Status(tier));
    }
    [Tier::T1, Tier::T2, Tier::T3]
        .into_iter()
        .find(|tier| announces(&lower, *tier))
        .map(TierEvent::Established)
}

fn parse_status(line: &str) -> Option<Tier> {
    let mut rest = line;
    while let Some(idx) = rest.find(STATUS_MARKER) {
        let after = &rest[idx + STATUS_MARKER.len()..];
        let level = after
            .chars()
            .next()
            .and_then(|ch| ch.to_digit(10))
            .and_then(|digit| u8::try_from(digit).ok())
            .and_then(Tier::from_level);
        if level.is_some() {
            return level;
        }
        rest = after;
    }
    None
}

fn announces(lower: &str, tier: Tier) -> bool {
    let level = tier.level();
    let named = lower.contains(&format!("tier {level}"))
        && (lower.contains("operational") || lower.contains("established"));
    named || lower.contains(&format!("t{level} operational"))
}

/// Stateful classifier for one supervised boot run.
///
/// Establishment announcements are reported once per tier; status lines are
/// always reported; after a failure marker the classifier goes quiet.
#[derive(Debug, Default, Clone)]
pub struct TierClassifier {
    seen: [bool; 4],
    halted: bool,
}

impl TierClassifier {
    /// Create a classifier for a fresh run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a failure marker has ended classification.
    #[must_use]
    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Feed the next console line.
    pub fn feed(&mut self, line: &str) -> Option<TierEvent> {
        if self.halted {
            return None;
        }
        match classify_line(line)? {
            TierEvent::Failure => {
                self.halted = true;
                Some(TierEvent::Failure)
            }
            TierEvent::Established(tier) => {
                let slot = &mut self.seen[usize::from(tier.level())];
                if *slot {
                    None
                } else {
                    *slot = true;
                    Some(TierEvent::Established(tier))
                }
            }
            status @ TierEvent::Status(_) => Some(status),
        }
    }
}

/// Classify a batch of lines and return the tier they leave the system in.
///
/// Returns `None` when no line says anything about tiers. A failure marker
/// anywhere in the batch yields [`Tier::Failed`].
#[must_use]
pub fn classify_batch<'a, I>(lines: I) -> Option<Tier>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut classifier = TierClassifier::new();
    let mut current = None;
    for line in lines {
        match classifier.feed(line) {
            Some(TierEvent::Failure) => return Some(Tier::Failed),
            Some(event) => current = Some(event.tier()),
            None => {}
        }
    }
    current
}

/// A tier inferred at a point in time, relative to supervisor start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierObservation {
    /// Offset from the start of the supervised process.
    #[serde(rename = "at_s", with = "offset_secs")]
    pub offset: Duration,
    /// Observed tier.
    pub tier: Tier,
}

impl TierObservation {
    /// Construct an observation.
    #[must_use]
    pub const fn new(offset: Duration, tier: Tier) -> Self {
        Self { offset, tier }
    }
}

/// Append-only, time-ordered tier history for one supervised process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierHistory {
    observations: Vec<TierObservation>,
}

impl TierHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history whose first entry is a known starting tier.
    #[must_use]
    pub fn seeded(observation: TierObservation) -> Self {
        Self {
            observations: vec![observation],
        }
    }

    /// Append an observation if it changes the current tier.
    ///
    /// Offsets never move backwards; a late observation is pinned to the
    /// latest recorded offset. Returns whether the observation was appended.
    pub fn record(&mut self, observation: TierObservation) -> bool {
        let mut observation = observation;
        if let Some(last) = self.observations.last() {
            if last.tier == observation.tier {
                return false;
            }
            observation.offset = observation.offset.max(last.offset);
        }
        self.observations.push(observation);
        true
    }

    /// Borrow the recorded observations in insertion order.
    #[must_use]
    pub fn observations(&self) -> &[TierObservation] {
        &self.observations
    }

    /// Number of recorded observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether nothing has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Tier of the most recent observation.
    #[must_use]
    pub fn current(&self) -> Option<Tier> {
        self.observations.last().map(|obs| obs.tier)
    }

    /// Current tier, treating silence as failure.
    #[must_use]
    pub fn current_or_failed(&self) -> Tier {
        self.current().unwrap_or(Tier::Failed)
    }

    /// Offset at which `tier` was first observed.
    #[must_use]
    pub fn first_seen(&self, tier: Tier) -> Option<Duration> {
        self.observations
            .iter()
            .find(|obs| obs.tier == tier)
            .map(|obs| obs.offset)
    }

    /// Time between the first and second observations.
    #[must_use]
    pub fn first_transition(&self) -> Option<Duration> {
        match self.observations.as_slice() {
            [first, second, ..] => Some(second.offset.saturating_sub(first.offset)),
            _ => None,
        }
    }

    /// Time between the first and last observations, if there are two or more.
    #[must_use]
    pub fn span(&self) -> Option<Duration> {
        match self.observations.as_slice() {
            [first, .., last] => Some(last.offset.saturating_sub(first.offset)),
            _ => None,
        }
    }
}

mod offset_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_marker_skips_non_digit_suffix() {
        assert_eq!(parse_status("Tier: unknown, Current Tier: 2"), Some(Tier::T2));
        assert_eq!(parse_status("Tier: 7"), None);
    }

    #[test]
    fn tier_levels_round_trip_through_u8() {
        for tier in Tier::ALL {
            assert_eq!(Tier::try_from(u8::from(tier)), Ok(tier));
        }
        assert!(Tier::try_from(4).is_err());
    }
}
