//! Terminal rendering of runs, histories and trends

use colored::{ColoredString, Colorize};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use recon_common::{CheckType, Severity};
use recon_engine::models::{ResultStatus, RunStatus, RunSummary, ValidationResult, ValidationRun};
use recon_engine::trend::{TrendFinding, TrendOutcome, TrendReport, TrendSignal};
use serde::Serialize;

use crate::error::Result;
use crate::progress::format_duration_ms;

/// Discrepancy rows printed before the rest is summarized
const MAX_DISCREPANCY_ROWS: usize = 50;

/// A run as printed with `--json`
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub summary: RunSummary,
    pub results: &'a [ValidationResult],
    pub advisories: &'a [TrendFinding],
}

impl<'a> RunReport<'a> {
    pub fn new(run: &'a ValidationRun, advisories: &'a [TrendFinding]) -> Self {
        Self {
            summary: run.summary(),
            results: run.results(),
            advisories,
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn run_status_label(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Completed => status.as_str().green().bold(),
        RunStatus::PartialFailure => status.as_str().yellow().bold(),
        RunStatus::Failed => status.as_str().red().bold(),
        RunStatus::Pending | RunStatus::Running => status.as_str().cyan(),
    }
}

fn result_status_label(status: ResultStatus) -> ColoredString {
    match status {
        ResultStatus::Pass => status.as_str().green(),
        ResultStatus::Fail => status.as_str().red(),
        ResultStatus::Error => status.as_str().magenta(),
    }
}

/// The few metrics worth a glance for each check
fn key_metrics(result: &ValidationResult) -> String {
    let names: &[&str] = match result.check_type {
        CheckType::Schema => &["fields_added", "fields_removed", "types_changed"],
        CheckType::Count => &["source_count", "local_count", "variance"],
        CheckType::Completeness => &["local_records"],
        CheckType::Hash => &["matched", "changed", "missing_in_local", "missing_in_source", "mismatch_rate"],
        CheckType::Tolerance => &["records_compared", "failure_rate"],
    };

    let mut parts: Vec<String> = names
        .iter()
        .filter_map(|name| result.metric(name).map(|v| format!("{name}={}", format_metric(v))))
        .collect();
    if let Some(skipped) = result.metric("normalize_errors").filter(|v| *v > 0.0) {
        parts.push(format!("normalize_errors={skipped}"));
    }
    parts.join(" ")
}

fn format_metric(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.4}")
    }
}

pub fn print_run(run: &ValidationRun) {
    let summary = run.summary();

    println!("{} {}", "Run".cyan().bold(), summary.run_id);
    println!("  Status:       {}", run_status_label(summary.status));
    println!("  Mode:         {}", summary.mode);
    println!(
        "  Entities:     {}",
        summary.entity_types.iter().map(|e| e.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!("  Triggered by: {}", summary.triggered_by);
    if let Some(started) = summary.started_at {
        println!("  Started:      {started}");
    }
    if let Some(completed) = summary.completed_at {
        println!("  Completed:    {completed}");
    }
    if summary.cancelled {
        println!("  {}", "Cancelled before every check ran".yellow());
    }
    if let Some(message) = &summary.error_message {
        println!("  Error:        {}", message.red());
    }
    println!();

    if run.results().is_empty() {
        println!("No results recorded.");
        return;
    }

    let mut table = new_table();
    table.set_header(vec!["Entity", "Check", "Status", "Discrepancies", "Metrics", "Duration"]);
    for result in run.results() {
        let detail = match &result.error_message {
            Some(message) => message.clone(),
            None => key_metrics(result),
        };
        table.add_row(vec![
            result.entity_type.to_string(),
            result.check_type.to_string(),
            result_status_label(result.status).to_string(),
            result.discrepancies.len().to_string(),
            detail,
            format_duration_ms(result.duration_ms),
        ]);
    }
    println!("{table}");

    print_discrepancies(run.results());

    println!();
    println!(
        "{} {} passed, {} failed, {} errored, {} discrepancies ({} blocking)",
        "Summary:".cyan().bold(),
        summary.passed,
        summary.failed,
        summary.errored,
        summary.discrepancies,
        summary.blocking_discrepancies
    );
}

fn print_discrepancies(results: &[ValidationResult]) {
    let total: usize = results.iter().map(|r| r.discrepancies.len()).sum();
    if total == 0 {
        return;
    }

    let mut table = new_table();
    table.set_header(vec!["Entity", "Check", "Kind", "Severity", "Record", "Field", "Expected", "Actual"]);

    let rows = results
        .iter()
        .flat_map(|r| r.discrepancies.iter().map(move |d| (r, d)))
        .take(MAX_DISCREPANCY_ROWS);
    for (result, d) in rows {
        let severity = match d.severity {
            Severity::Blocking => d.severity.as_str().red().to_string(),
            _ => d.severity.as_str().yellow().to_string(),
        };
        table.add_row(vec![
            result.entity_type.to_string(),
            result.check_type.to_string(),
            d.kind.to_string(),
            severity,
            d.record_id.clone().unwrap_or_default(),
            d.field_name.clone().unwrap_or_default(),
            d.expected.clone().unwrap_or_default(),
            d.actual.clone().unwrap_or_default(),
        ]);
    }

    println!();
    println!("{}", "Discrepancies:".cyan().bold());
    println!("{table}");
    if total > MAX_DISCREPANCY_ROWS {
        println!("  ... and {} more (use --json for the full list)", total - MAX_DISCREPANCY_ROWS);
    }
}

pub fn print_advisories(advisories: &[TrendFinding]) {
    if advisories.is_empty() {
        return;
    }
    println!();
    println!("{}", "Trend advisories:".yellow().bold());
    for finding in advisories {
        println!("  {finding}");
    }
}

pub fn print_summaries(summaries: &[RunSummary]) {
    if summaries.is_empty() {
        println!("No runs recorded yet.");
        println!("Run 'recon run' to start one.");
        return;
    }

    let mut table = new_table();
    table.set_header(vec!["Run", "Status", "Mode", "Entities", "Triggered by", "Started", "Failing checks"]);
    for s in summaries {
        table.add_row(vec![
            s.run_id.to_string(),
            run_status_label(s.status).to_string(),
            s.mode.to_string(),
            s.entity_types.iter().map(|e| e.as_str()).collect::<Vec<_>>().join(","),
            s.triggered_by.clone(),
            s.started_at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default(),
            s.failing_checks.join("\n"),
        ]);
    }
    println!("{table}");
}

pub fn print_trend(report: &TrendReport) {
    println!(
        "{} {}/{} {}",
        "Trend".cyan().bold(),
        report.entity_type,
        report.check_type,
        report.metric
    );

    if report.history.is_empty() {
        println!("No history for this metric.");
        return;
    }

    let mut table = new_table();
    table.set_header(vec!["Recorded", "Run", "Value", "Moving average"]);
    for point in &report.history {
        table.add_row(vec![
            point.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            point.run_id.to_string(),
            format_metric(point.value),
            format!("{:.4}", point.moving_average),
        ]);
    }
    println!("{table}");

    if let (Some(mean), Some(sd)) = (report.window_mean, report.window_stddev) {
        println!("  Window mean {mean:.4}, standard deviation {sd:.4}");
    }

    let verdict = match &report.outcome {
        TrendOutcome::InsufficientHistory { points, required } => {
            format!("insufficient history ({points} of {required} points)").normal()
        },
        TrendOutcome::Stable => "stable".green(),
        TrendOutcome::Flagged {
            signal: TrendSignal::Deviation { z_score },
        } => format!("deviation, z = {z_score:.2}").red(),
        TrendOutcome::Flagged {
            signal: TrendSignal::Jump {
                relative_change: Some(change),
            },
        } => format!("jump of {:.1}% from a flat window", change * 100.0).red(),
        TrendOutcome::Flagged {
            signal: TrendSignal::Jump { relative_change: None },
        } => "jump from zero".red(),
    };
    println!("  Latest value: {verdict}");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use recon_common::EntityType;

    #[test]
    fn test_format_metric() {
        assert_eq!(format_metric(1200.0), "1200");
        assert_eq!(format_metric(0.05), "0.0500");
    }

    #[test]
    fn test_key_metrics_for_count() {
        let mut result = ValidationResult::new(EntityType::Volunteer, CheckType::Count);
        result.set_metric("source_count", 1000.0);
        result.set_metric("local_count", 950.0);
        result.set_metric("variance", 0.05);
        result.set_metric("threshold", 0.02);
        assert_eq!(key_metrics(&result), "source_count=1000 local_count=950 variance=0.0500");
    }
}
