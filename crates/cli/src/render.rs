//! Terminal output for run reports and the failure ledger.

use colored::Colorize;
use tabled::{Table, Tabled};

use bitvault_core::application::RunReport;
use bitvault_core::domain::{FailureRecord, RepoSlug};

/// Longest error text shown in a table cell
const MAX_ERROR_WIDTH: usize = 80;

/// Exit status: completed cleanly
pub const EXIT_OK: u8 = 0;
/// Exit status: fatal error before or during the run
pub const EXIT_FATAL: u8 = 1;
/// Exit status: completed, some repositories failed
pub const EXIT_FAILURES: u8 = 2;
/// Exit status: interrupted
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Tabled)]
struct FailureRow {
    repository: String,
    kind: String,
    attempts: u32,
    #[tabled(rename = "failed at")]
    failed_at: String,
    error: String,
}

#[derive(Tabled)]
struct CounterRow {
    item: &'static str,
    count: u64,
}

pub fn exit_code(report: &RunReport) -> u8 {
    if report.cancelled {
        EXIT_CANCELLED
    } else if report.has_failures() {
        EXIT_FAILURES
    } else {
        EXIT_OK
    }
}

pub fn print_report(report: &RunReport, dry_run: bool) {
    let manifest = &report.manifest;
    let elapsed = manifest.completed_at - manifest.started_at;

    let title = if report.cancelled {
        "Backup cancelled".yellow().bold()
    } else if report.has_failures() {
        "Backup completed with failures".yellow().bold()
    } else {
        "Backup completed".green().bold()
    };
    println!("{}", title);
    println!(
        "  {} {}  {} {}  {} {}s{}",
        "Workspace:".bold(),
        manifest.workspace,
        "Mode:".bold(),
        if manifest.incremental { "incremental" } else { "full" },
        "Elapsed:".bold(),
        elapsed.num_seconds(),
        if dry_run { "  (dry run, nothing written)" } else { "" }
    );
    println!();

    let counters = manifest.counters;
    let rows = vec![
        CounterRow { item: "projects", count: counters.projects },
        CounterRow { item: "repositories", count: counters.repositories },
        CounterRow { item: "pull requests", count: counters.pull_requests },
        CounterRow { item: "issues", count: counters.issues },
        CounterRow { item: "comments", count: counters.comments },
        CounterRow { item: "failed", count: counters.failures },
        CounterRow { item: "cancelled", count: counters.cancelled },
    ];
    println!("{}", Table::new(rows));

    if report.has_failures() {
        println!();
        println!("{}", "Failed repositories".red().bold());
        let rows: Vec<FailureRow> = report
            .failures
            .iter()
            .map(|f| FailureRow {
                repository: f.slug.clone(),
                kind: f.error.kind().to_string(),
                attempts: f.attempts,
                failed_at: manifest.completed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                error: truncate(&f.error.to_string(), MAX_ERROR_WIDTH),
            })
            .collect();
        println!("{}", Table::new(rows));
        println!(
            "  Run {} to retry only these.",
            "bitvault backup --retry-failed".cyan()
        );
    }
}

pub fn print_failures(failures: &[(RepoSlug, FailureRecord)]) {
    if failures.is_empty() {
        println!("{}", "✓ No recorded failures".green().bold());
        return;
    }
    println!(
        "{}",
        format!("{} repositories failed on their last attempt", failures.len())
            .yellow()
            .bold()
    );
    println!("{}", Table::new(failure_rows(failures)));
}

fn failure_rows(failures: &[(RepoSlug, FailureRecord)]) -> Vec<FailureRow> {
    failures
        .iter()
        .map(|(slug, record)| FailureRow {
            repository: slug.clone(),
            kind: record
                .kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "-".to_string()),
            attempts: record.attempts,
            failed_at: record.failed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            error: truncate(&record.error, MAX_ERROR_WIDTH),
        })
        .collect()
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
