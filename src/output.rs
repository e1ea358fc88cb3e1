//! CLI output formatting.
//!
//! Every `format_*` function is pure and returns lines; the `print_*`
//! wrappers only write them to stdout. The CLI prints journal events from a
//! printer thread as they arrive, so progress shows up while a run is still
//! transcoding.
//!
//! # Output Format
//!
//! ## Run
//!
//! ```text
//! Cache: 12 records (static/.derivations.json)
//! Plan: 6 cached, 6 to encode
//! [1/6] default 480w   photo.jpg
//!     -> static/images/3fa1…_480.jpg
//! [2/6] inline 256w    icon.png
//!     -> inline
//! Info: static/images/photo.json (3 entries)
//! Cache: 6 cached, 6 encoded (12 total)
//! ```
//!
//! ## Plan
//!
//! ```text
//! photo.jpg (2000x1500, 245 KB)
//!     default 480w   satisfied  static/images/3fa1…_480.jpg
//!     default 768w   stale      static/images/3fa1…_768.jpg
//! ```

use crate::cache::CacheStats;
use crate::journal::JournalEvent;
use crate::pipeline::{PlanReport, RunSummary};
use std::collections::BTreeSet;

/// Lines for one journal event. Quiet mode shows progress and problems only.
pub fn format_event(event: &JournalEvent, verbose: bool) -> Vec<String> {
    match event {
        JournalEvent::CacheLoaded { path, records, .. } => {
            vec![format!("Cache: {records} records ({})", path.display())]
        }
        JournalEvent::Planned { stats } => vec![format!(
            "Plan: {} cached, {} to encode",
            stats.satisfied,
            stats.jobs()
        )],
        JournalEvent::Created {
            index,
            total,
            source,
            task,
            width,
            target,
        } => vec![
            format!("[{index}/{total}] {} {source}", task_label(task, *width)),
            format!("    -> {target}"),
        ],
        JournalEvent::Failed {
            index,
            total,
            source,
            task,
            width,
            reason,
        } => vec![
            format!("[{index}/{total}] {} {source}", task_label(task, *width)),
            format!("    FAILED: {reason}"),
        ],
        JournalEvent::InfoWritten { path, entries } => {
            vec![format!("Info: {} ({entries} entries)", path.display())]
        }
        JournalEvent::Done { .. } => Vec::new(),
        other if other.is_problem() => vec![format!("warning: {other}")],
        other if verbose => vec![format!("    {other}")],
        _ => Vec::new(),
    }
}

/// `"default 480w"` padded so source names line up.
fn task_label(task: &str, width: u32) -> String {
    format!("{:<14}", format!("{task} {width}w"))
}

pub fn format_summary(summary: &RunSummary) -> Vec<String> {
    let mut lines = vec![format!("Cache: {}", summary.stats)];
    if summary.cancelled {
        lines.push("Run cancelled; rerun to finish the remaining outputs".to_string());
    }
    if summary.persist_failures > 0 {
        lines.push(format!(
            "warning: {} result(s) could not be written to the cache",
            summary.persist_failures
        ));
    }
    if let Some(log) = &summary.log_file {
        lines.push(format!("Log: {}", log.display()));
    }
    lines
}

pub fn format_plan(report: &PlanReport) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, source) in report.sources.iter().enumerate() {
        lines.push(format!(
            "{} ({}x{}, {})",
            source.origin(),
            source.width,
            source.height,
            human_size(source.size)
        ));
        for output in report.plan.outputs.iter().filter(|o| o.source == index) {
            let target = match output.descriptor.file() {
                Some(path) => path.display().to_string(),
                None => "inline".to_string(),
            };
            lines.push(format!(
                "    {} {:<10} {target}",
                task_label(&output.descriptor.task, output.descriptor.width),
                output.classification.to_string(),
            ));
        }
    }
    lines.push(format_stats_line(&report.plan.stats()));
    lines
}

fn format_stats_line(stats: &CacheStats) -> String {
    format!(
        "{} satisfied, {} stale, {} needed",
        stats.satisfied, stats.stale, stats.needed
    )
}

pub fn format_verify(invalid: &BTreeSet<String>) -> Vec<String> {
    if invalid.is_empty() {
        return vec!["All cache records are intact".to_string()];
    }
    let mut lines = vec![format!(
        "{} record(s) reference missing or malformed outputs:",
        invalid.len()
    )];
    lines.extend(invalid.iter().map(|key| format!("    {key}")));
    lines
}

fn human_size(bytes: u64) -> String {
    match bytes {
        b if b >= 1024 * 1024 => format!("{:.1} MB", b as f64 / (1024.0 * 1024.0)),
        b if b >= 1024 => format!("{} KB", b / 1024),
        b => format!("{b} B"),
    }
}

pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

pub fn print_summary(summary: &RunSummary) {
    print_lines(&format_summary(summary));
}

pub fn print_plan(report: &PlanReport) {
    print_lines(&format_plan(report));
}

pub fn print_verify(invalid: &BTreeSet<String>) {
    print_lines(&format_verify(invalid));
}
