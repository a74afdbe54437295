// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate campaign summaries and result store scanning.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::time::SystemTime;

use anyhow::Result;
use chrono::Utc;
use faultlab::campaign::{CampaignDocument, CampaignSummary, ResultMetadata, ResultStore};
use faultlab::chaos::{ChaosDocument, ChaosSummary};
use faultlab::fault::FaultType;
use faultlab::orchestrator::scan_campaigns;
use faultlab::report::{load_latest, render_report};
use faultlab::trial::{RecoveryResult, TrialMode, TrialResult};
use faultlab::{Tier, TierHistory};
use tempfile::TempDir;

fn runtime_result(trial: usize, final_tier: Tier, mttd_s: Option<f64>, mttr_s: Option<f64>) -> TrialResult {
    TrialResult {
        trial,
        fault_type: FaultType::Watchdog,
        mode: TrialMode::Runtime,
        target_tier: Some(Tier::T3),
        fault: None,
        initial_tier: Some(Tier::T3),
        final_tier,
        boot_time_s: 12.0,
        success: final_tier.is_operational(),
        degraded: final_tier < Tier::T3,
        mttd_s,
        recovery: Some(RecoveryResult {
            recovered: mttr_s.is_some(),
            recovery_tier: if mttr_s.is_some() { Tier::T3 } else { final_tier },
            mttr_s,
        }),
        tier_history: TierHistory::new(),
        output_lines: 40,
        total_trial_time_s: 200.0,
        error: None,
        timestamp: Utc::now(),
    }
}

#[test]
fn runtime_summary_is_a_projection_of_its_trials() {
    let results = vec![
        runtime_result(1, Tier::T1, Some(4.0), Some(30.0)),
        runtime_result(2, Tier::T3, None, None),
        runtime_result(3, Tier::Failed, Some(8.0), None),
        runtime_result(4, Tier::T2, Some(6.0), Some(50.0)),
    ];
    let summary = CampaignSummary::from_results(FaultType::Watchdog, TrialMode::Runtime, &results, true);

    assert_eq!(summary.total_trials, 4);
    assert_eq!(summary.successful + summary.failed, summary.total_trials);
    assert_eq!(summary.tier_distribution.values().sum::<usize>(), summary.total_trials);
    assert_eq!(summary.tier_distribution.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(summary.successful, 3);
    assert_eq!(summary.success_rate, 75.0);
    assert_eq!(summary.degraded_count, Some(3));
    assert_eq!(summary.avg_mttd_s, Some(6.0));
    assert_eq!(summary.min_mttd_s, Some(4.0));
    assert_eq!(summary.max_mttd_s, Some(8.0));
    assert_eq!(summary.recovery_count, Some(2));
    assert_eq!(summary.recovery_rate, Some(50.0));
    assert_eq!(summary.avg_mttr_s, Some(40.0));
    assert_eq!(summary.avg_boot_time_s, None);
}

#[test]
fn degradation_only_campaign_omits_recovery_fields() -> Result<()> {
    let results = vec![runtime_result(1, Tier::T1, Some(5.0), None)];
    let summary = CampaignSummary::from_results(FaultType::Watchdog, TrialMode::Runtime, &results, false);
    assert_eq!(summary.recovery_count, None);

    let json = serde_json::to_value(&summary)?;
    assert!(json.get("recovery_rate").is_none());
    assert_eq!(json["tier_distribution"]["1"], 1);
    assert_eq!(json["mode"], "runtime");
    Ok(())
}

#[test]
fn store_scans_aliases_and_chaos_documents() -> Result<()> {
    let dir = TempDir::new()?;
    let store = ResultStore::new(dir.path());
    let since = SystemTime::UNIX_EPOCH;

    let results = vec![runtime_result(1, Tier::T1, Some(5.0), None)];
    let doc = CampaignDocument {
        metadata: ResultMetadata::now("watchdog", "runtime", false),
        summary: CampaignSummary::from_results(FaultType::Watchdog, TrialMode::Runtime, &results, false),
        results,
    };
    store.write_campaign(&doc)?;
    let chaos = ChaosDocument {
        metadata: ResultMetadata::now("chaos", "chaos", false),
        summary: ChaosSummary::from_results(&[]),
        results: Vec::new(),
    };
    store.write("chaos", &chaos, false)?;

    assert_eq!(store.latest_files(20)?.len(), 1);
    let lines = scan_campaigns(&store, since)?;
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().any(|line| line.fault_type == "chaos" && line.mode == "chaos"));
    assert!(lines.iter().any(|line| line.fault_type == "watchdog" && line.mode == "runtime"));

    let docs = load_latest(&store)?;
    assert_eq!(docs.len(), 1);
    let report = render_report(&docs);
    assert!(report.contains("WATCHDOG [RUNTIME]"));
    assert!(report.contains("System availability: 100.0%"));
    Ok(())
}
