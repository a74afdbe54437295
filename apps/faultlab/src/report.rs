// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Render availability and LaTeX views over the latest campaign documents.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt::Write as _;

use crate::campaign::{percent, CampaignDocument, CampaignSummary, ResultStore};
use crate::trial::TrialMode;
use crate::Result;

/// Every `_latest` campaign document, ordered by file name.
pub fn load_latest(store: &ResultStore) -> Result<Vec<CampaignDocument>> {
    let mut paths = store.latest_files(usize::MAX)?;
    paths.sort();
    paths.iter().map(|path| ResultStore::load(path)).collect()
}

fn opt_secs(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_owned(), |secs| format!("{secs:.3}s"))
}

fn tier_share(summary: &CampaignSummary, tier: u8) -> (usize, f64) {
    let count = summary.tier_distribution.get(&tier).copied().unwrap_or(0);
    (count, percent(count, summary.total_trials))
}

/// Per-campaign and overall availability view.
#[must_use]
pub fn render_report(docs: &[CampaignDocument]) -> String {
    let mut out = String::new();
    if docs.is_empty() {
        out.push_str("No results found. Run experiments first: faultlab run --mode quick\n");
        return out;
    }
    out.push_str("Fault injection results\n\n");
    for doc in docs {
        let summary = &doc.summary;
        let _ = writeln!(
            out,
            "{} [{}]",
            summary.fault_type.as_str().to_uppercase(),
            summary.mode.as_str().to_uppercase()
        );
        let _ = writeln!(out, "  total trials:     {}", summary.total_trials);
        let _ = writeln!(out, "  success rate:     {:.1}%", summary.success_rate);
        match summary.mode {
            TrialMode::Runtime => {
                let _ = writeln!(
                    out,
                    "  degradation rate: {:.1}%",
                    summary.degradation_rate.unwrap_or(0.0)
                );
                let _ = writeln!(out, "  avg MTTD:         {}", opt_secs(summary.avg_mttd_s));
                if let Some(rate) = summary.recovery_rate {
                    let _ = writeln!(out, "  recovery rate:    {rate:.1}%");
                    let _ = writeln!(out, "  avg MTTR:         {}", opt_secs(summary.avg_mttr_s));
                }
            }
            TrialMode::Boot => {
                let _ = writeln!(out, "  avg boot time:    {}", opt_secs(summary.avg_boot_time_s));
            }
        }
        out.push_str("  tier distribution:\n");
        for tier in summary.tier_distribution.keys() {
            let (count, share) = tier_share(summary, *tier);
            let _ = writeln!(out, "    tier {tier}: {count:3} ({share:5.1}%)");
        }
        out.push('\n');
    }

    let total: usize = docs.iter().map(|doc| doc.summary.total_trials).sum();
    let successful: usize = docs.iter().map(|doc| doc.summary.successful).sum();
    out.push_str("OVERALL\n");
    let _ = writeln!(out, "  total trials across all faults: {total}");
    let _ = writeln!(out, "  total successful:               {successful}");
    if total > 0 {
        let rate = percent(successful, total);
        let _ = writeln!(out, "  overall success rate:           {rate:.2}%");
        let boot_times: Vec<f64> = docs
            .iter()
            .filter_map(|doc| doc.summary.avg_boot_time_s)
            .collect();
        if !boot_times.is_empty() {
            let mean = boot_times.iter().sum::<f64>() / boot_times.len() as f64;
            let _ = writeln!(out, "  average boot time (boot faults): {mean:.3}s");
        }
        let _ = writeln!(out, "\nSystem availability: {rate:.1}%");
    }
    out
}

fn latex_name(summary: &CampaignSummary) -> String {
    summary.fault_type.as_str().replace('_', "\\_")
}

fn latex_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "--".to_owned(), |value| format!("{value:.precision$}"))
}

/// Boot and runtime LaTeX tables.
#[must_use]
pub fn render_latex(docs: &[CampaignDocument]) -> String {
    let mut out = String::new();
    let (boot, runtime): (Vec<_>, Vec<_>) = docs
        .iter()
        .map(|doc| &doc.summary)
        .partition(|summary| summary.mode == TrialMode::Boot);

    if !boot.is_empty() {
        out.push_str("% Boot-time fault injection results\n");
        out.push_str("\\begin{tabular}{lrrrrr}\n\\toprule\n");
        out.push_str("Fault Type & Trials & Success & Rate (\\%) & Avg Boot Time (s) & Tier 3 (\\%) \\\\\n");
        out.push_str("\\midrule\n");
        for summary in &boot {
            let (_, tier3) = tier_share(summary, 3);
            let _ = writeln!(
                out,
                "{} & {} & {} & {:.1} & {} & {:.1} \\\\",
                latex_name(summary),
                summary.total_trials,
                summary.successful,
                summary.success_rate,
                latex_opt(summary.avg_boot_time_s, 3),
                tier3
            );
        }
        out.push_str("\\bottomrule\n\\end{tabular}\n\n");
    }

    if !runtime.is_empty() {
        out.push_str("% Runtime fault injection results\n");
        out.push_str("\\begin{tabular}{lrrrrrr}\n\\toprule\n");
        out.push_str(
            "Fault Type & Trials & Success (\\%) & Degraded (\\%) & MTTD (s) & Recovery (\\%) & MTTR (s) \\\\\n",
        );
        out.push_str("\\midrule\n");
        for summary in &runtime {
            let _ = writeln!(
                out,
                "{} & {} & {:.1} & {:.1} & {} & {} & {} \\\\",
                latex_name(summary),
                summary.total_trials,
                summary.success_rate,
                summary.degradation_rate.unwrap_or(0.0),
                latex_opt(summary.avg_mttd_s, 2),
                latex_opt(summary.recovery_rate, 1),
                latex_opt(summary.avg_mttr_s, 2)
            );
        }
        out.push_str("\\bottomrule\n\\end{tabular}\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::ResultMetadata;
    use crate::fault::FaultType;

    fn doc(fault: FaultType, mode: TrialMode) -> CampaignDocument {
        CampaignDocument {
            metadata: ResultMetadata::now(fault.as_str(), mode.as_str(), false),
            summary: CampaignSummary::from_results(fault, mode, &[], false),
            results: Vec::new(),
        }
    }

    #[test]
    fn empty_report_points_at_experiments() {
        assert!(render_report(&[]).starts_with("No results found"));
        assert!(render_latex(&[]).is_empty());
    }

    #[test]
    fn latex_splits_boot_and_runtime_tables() {
        let docs = [
            doc(FaultType::TornWrite, TrialMode::Boot),
            doc(FaultType::Ecc, TrialMode::Runtime),
        ];
        let latex = render_latex(&docs);
        assert!(latex.contains("torn\\_write & 0 & 0"));
        assert!(latex.contains("ecc & 0 & 0.0 & 0.0 & -- & -- & --"));
        assert_eq!(latex.matches("\\begin{tabular}").count(), 2);
    }
}
