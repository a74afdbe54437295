// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate console line classification and tier history bookkeeping.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::time::Duration;

use tier_model::{
    classify_batch, classify_line, Tier, TierClassifier, TierEvent, TierHistory, TierObservation,
};

fn at(secs: u64, tier: Tier) -> TierObservation {
    TierObservation::new(Duration::from_secs(secs), tier)
}

#[test]
fn establishment_lines_are_recognised() {
    assert_eq!(
        classify_line("[pac] Tier 1 established (initramfs)"),
        Some(TierEvent::Established(Tier::T1))
    );
    assert_eq!(
        classify_line("TIER 2 OPERATIONAL"),
        Some(TierEvent::Established(Tier::T2))
    );
    assert_eq!(
        classify_line("health: t3 operational"),
        Some(TierEvent::Established(Tier::T3))
    );
    assert_eq!(classify_line("Tier 3 pending attestation"), None);
}

#[test]
fn status_lines_report_explicit_tier() {
    assert_eq!(
        classify_line("Current Tier: 2"),
        Some(TierEvent::Status(Tier::T2))
    );
    assert_eq!(classify_line("Tier: 1"), Some(TierEvent::Status(Tier::T1)));
}

#[test]
fn failure_markers_win_over_tier_claims() {
    assert_eq!(
        classify_line("Kernel panic - not syncing: Tier 3 established"),
        Some(TierEvent::Failure)
    );
    assert_eq!(
        classify_line("entering Emergency Mode"),
        Some(TierEvent::Failure)
    );
}

#[test]
fn silence_is_not_success() {
    assert_eq!(classify_line("Booting Linux on physical CPU 0x0"), None);
    assert_eq!(classify_batch(["random", "noise", ""]), None);
}

#[test]
fn panic_after_higher_tier_in_same_batch_forces_failure() {
    let lines = ["Tier 1 established", "Tier 3 established", "Kernel panic - not syncing"];
    assert_eq!(classify_batch(lines), Some(Tier::Failed));
}

#[test]
fn status_after_establishment_is_visible_as_degradation() {
    let lines = ["Tier 3 established", "Current Tier: 2"];
    assert_eq!(classify_batch(lines), Some(Tier::T2));

    let mut classifier = TierClassifier::new();
    let mut history = TierHistory::new();
    for (secs, line) in [(10, "Tier 3 established"), (15, "Current Tier: 2")] {
        if let Some(event) = classifier.feed(line) {
            history.record(at(secs, event.tier()));
        }
    }
    assert_eq!(history.current(), Some(Tier::T2));
}

#[test]
fn classifier_reports_each_establishment_once() {
    let mut classifier = TierClassifier::new();
    assert_eq!(
        classifier.feed("Tier 2 established"),
        Some(TierEvent::Established(Tier::T2))
    );
    assert_eq!(classifier.feed("Tier 2 established"), None);
    assert_eq!(
        classifier.feed("Current Tier: 2"),
        Some(TierEvent::Status(Tier::T2))
    );
}

#[test]
fn classifier_goes_quiet_after_failure() {
    let mut classifier = TierClassifier::new();
    assert_eq!(classifier.feed("kernel panic"), Some(TierEvent::Failure));
    assert!(classifier.halted());
    assert_eq!(classifier.feed("Tier 3 established"), None);
    assert_eq!(classifier.feed("Current Tier: 3"), None);
}

#[test]
fn history_skips_repeats_and_keeps_order() {
    let mut history = TierHistory::seeded(at(0, Tier::T3));
    assert!(!history.record(at(2, Tier::T3)));
    assert!(history.record(at(5, Tier::T1)));
    assert!(history.record(at(3, Tier::T2)));

    let offsets: Vec<_> = history.observations().iter().map(|o| o.offset).collect();
    assert_eq!(
        offsets,
        vec![Duration::from_secs(0), Duration::from_secs(5), Duration::from_secs(5)]
    );
    assert_eq!(history.current(), Some(Tier::T2));
    assert_eq!(history.first_transition(), Some(Duration::from_secs(5)));
    assert_eq!(history.span(), Some(Duration::from_secs(5)));
    assert_eq!(history.first_seen(Tier::T1), Some(Duration::from_secs(5)));
}

#[test]
fn single_observation_has_no_transition() {
    let history = TierHistory::seeded(at(4, Tier::T3));
    assert_eq!(history.first_transition(), None);
    assert_eq!(history.span(), None);
    assert_eq!(TierHistory::new().current_or_failed(), Tier::Failed);
}

#[test]
fn history_serialises_offsets_as_seconds() {
    let mut history = TierHistory::new();
    history.record(TierObservation::new(Duration::from_millis(1500), Tier::T1));
    let json = serde_json::to_string(&history).expect("serialise history");
    assert_eq!(json, r#"[{"at_s":1.5,"tier":1}]"#);
    let back: TierHistory = serde_json::from_str(&json).expect("deserialise history");
    assert_eq!(back, history);
}
