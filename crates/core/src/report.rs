use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::model::{
    CardInfo, CaseStatus, ControllerInfo, RoundSet, RunState, RunSummary, RunVerdict,
    StopReason, REPORT_VERSION,
};

/// Everything one CLI/service run produced, in the shape written to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub report_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub config: Config,
    #[serde(default)]
    pub card: Option<CardInfo>,
    #[serde(default)]
    pub controller: Option<ControllerInfo>,
    pub case_names: Vec<String>,
    pub rounds: RoundSet,
    pub summary: RunSummary,
}

pub fn build_run_report(
    config: &Config,
    card: Option<CardInfo>,
    controller: Option<ControllerInfo>,
    case_names: &[&str],
    rounds: RoundSet,
) -> RunReport {
    let summary = rounds.summary(case_names.len());
    RunReport {
        report_version: REPORT_VERSION.to_string(),
        run_id: Uuid::new_v4().to_string(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        config: config.clone(),
        card,
        controller,
        case_names: case_names.iter().map(|name| name.to_string()).collect(),
        rounds,
        summary,
    }
}

pub fn render_text_report(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("=== SD Express Tester Test Report ===\n");
    out.push_str(&format!(
        "Test time: {}\nRun id: {}\n\n",
        report.generated_at, report.run_id
    ));

    let test = &report.config.test;
    out.push_str("Test configuration:\n");
    out.push_str(&format!(
        "- Test type: {:?}\n- Loop test: {}\n",
        test.run_type,
        if test.looping.enabled { "Enabled" } else { "Disabled" }
    ));
    if test.looping.enabled {
        out.push_str(&format!("- Loop count: {}\n", test.looping.count));
    }
    out.push_str(&format!(
        "- Total size of performance test: {}MB\n- Performance test block size: {}MB\n- Performance test iterations: {}\n\n",
        test.performance.total_size, test.performance.block_size, test.performance.iterations
    ));

    out.push_str("Test target:\n");
    match &report.card {
        Some(card) => out.push_str(&format!(
            "- Card: {} on {} ({}, mode {}, capacity {})\n",
            card.name,
            card.drive_letter,
            card.controller.label(),
            card.mode.label(),
            human_bytes(card.capacity_bytes)
        )),
        None => out.push_str("- Card: not detected\n"),
    }
    match &report.controller {
        Some(controller) => out.push_str(&format!(
            "- Controller: {} (supports {})\n\n",
            controller.name,
            if controller.supported_generations.is_empty() {
                "unknown generations".to_string()
            } else {
                controller.supported_generations.join(", ")
            }
        )),
        None => out.push_str("- Controller: not identified\n\n"),
    }

    let summary = &report.summary;
    out.push_str("Test result summary:\n");
    out.push_str(&format!(
        "- Total number of test rounds: {}\n- Counted rounds: {}\n- Passed rounds: {}\n- Failed rounds: {}\n",
        summary.total_rounds, summary.counted_rounds, summary.passed_rounds, summary.failed_rounds
    ));
    if summary.incomplete_rounds > 0 {
        out.push_str(&format!(
            "- Incomplete rounds (excluded): {}\n",
            summary.incomplete_rounds
        ));
    }
    out.push_str(&format!("- Verdict: {}\n", verdict_label(summary.verdict)));

    let total = report.rounds.len();
    for round in &report.rounds.rounds {
        out.push_str(&format!("\n=== Test round {}/{} ===\n", round.round, total));
        if round.state == RunState::Stopped {
            let reason = match round.stop_reason {
                Some(StopReason::TimedOut) => "round timeout reached",
                _ => "stopped by user",
            };
            out.push_str(&format!(
                "(stopped after {} of {} test(s): {reason})\n",
                round.cases.len(),
                report.case_names.len()
            ));
        }
        for case in &round.cases {
            out.push_str(&format!("\n{}: {}\n", case.name, case.status_label()));
            for line in case.details.lines().filter(|line| !line.trim().is_empty()) {
                out.push_str(&format!("  {line}\n"));
            }
        }
    }

    out
}

pub fn write_text_report(report: &RunReport, output_path: impl AsRef<Path>) -> Result<()> {
    let path = output_path.as_ref();
    fs::write(path, render_text_report(report))
        .with_context(|| format!("failed to write test report to {}", path.display()))
}

pub fn write_json_report(report: &RunReport, output_path: impl AsRef<Path>) -> Result<()> {
    let path = output_path.as_ref();
    let payload = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write run report to {}", path.display()))
}

pub fn load_json_report(path: impl AsRef<Path>) -> Result<RunReport> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read run report {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse run report {}", path.display()))
}

pub fn verdict_label(verdict: RunVerdict) -> &'static str {
    match verdict {
        RunVerdict::AllPassed => "all counted rounds passed",
        RunVerdict::Failures => "failures detected",
        RunVerdict::Stopped => "stopped before completion",
        RunVerdict::NothingCompleted => "no round completed",
    }
}

/// Counts of `(passed, failed, interrupted)` cases across every round.
pub fn case_tally(rounds: &RoundSet) -> (usize, usize, usize) {
    rounds
        .rounds
        .iter()
        .flat_map(|round| round.cases.iter())
        .fold((0, 0, 0), |(passed, failed, interrupted), case| match case.status {
            CaseStatus::Passed => (passed + 1, failed, interrupted),
            CaseStatus::Failed => (passed, failed + 1, interrupted),
            CaseStatus::Interrupted => (passed, failed, interrupted + 1),
        })
}

pub fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
