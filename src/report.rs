//! End-of-run console summary and JSON results file.
use crate::history::HistoryRow;
use crate::runner::BenchContext;
use crate::stats::{RunStatistics, Summary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Inputs to the comparison columns.
#[derive(Debug, Default)]
pub struct ReportOptions {
    /// Tool whose median every other tool on the same fixture is divided by.
    pub baseline: Option<String>,
    /// Median per label from the last recorded run before this one.
    pub previous: HashMap<String, f64>,
}

/// Render the human-readable summary table followed by any errors.
pub fn render(context: &BenchContext, options: &ReportOptions) -> String {
    let summaries = context.summaries();
    let mut out = String::new();

    if summaries.is_empty() {
        out.push_str("No scenarios were run.\n");
        return out;
    }

    let width = summaries.keys().map(String::len).max().unwrap_or(8).max(8);
    let _ = writeln!(
        out,
        "{:<width$} {:>4} {:>4} {:>9} {:>9} {:>9} {:>9} {:>9} {:>6} {:>9} {:>9}",
        "SCENARIO", "RUNS", "FAIL", "INITIAL", "MEAN", "MEDIAN", "MIN", "MAX", "ERRS", "VS BASE", "VS PREV",
    );
    let _ = writeln!(out, "{}", "-".repeat(width + 88));

    for (label, summary) in &summaries {
        let _ = writeln!(
            out,
            "{:<width$} {:>4} {:>4} {:>9} {:>9} {:>9} {:>9} {:>9} {:>6} {:>9} {:>9}",
            label,
            summary.runs,
            summary.failed,
            format_ms(summary.mean_initial_ms),
            format_ms(summary.mean_average_ms),
            format_ms(summary.median_ms),
            format_ms(summary.min_ms),
            format_ms(summary.max_ms),
            summary
                .diagnostics
                .map_or_else(|| "-".to_string(), |d| d.to_string()),
            baseline_column(label, summary, &summaries, options.baseline.as_deref()),
            previous_column(summary, options.previous.get(label).copied()),
        );
    }

    if !context.errors.is_empty() {
        out.push_str("\nErrors:\n");
        for (label, error) in &context.errors {
            let _ = writeln!(out, "  {label}: {error}");
        }
    }

    out
}

/// `1.00x` style ratio against the baseline tool on the same fixture.
fn baseline_column(
    label: &str,
    summary: &Summary,
    summaries: &BTreeMap<String, Summary>,
    baseline: Option<&str>,
) -> String {
    let Some(baseline) = baseline else {
        return "-".to_string();
    };
    let Some((tool, fixture)) = label.split_once('/') else {
        return "-".to_string();
    };
    if tool == baseline {
        return "base".to_string();
    }
    let base = summaries
        .get(&format!("{baseline}/{fixture}"))
        .map(|s| s.median_ms);
    match ratio(summary.median_ms, base.unwrap_or(0.0)) {
        Some(r) => format!("{r:.2}x"),
        None => "n/a".to_string(),
    }
}

/// `+12.5%` style change against the previously recorded median.
fn previous_column(summary: &Summary, previous: Option<f64>) -> String {
    match previous.and_then(|p| ratio(summary.median_ms, p)) {
        Some(r) => format!("{:+.1}%", (r - 1.0) * 100.0),
        None => "n/a".to_string(),
    }
}

/// `value / base`, or None when either side is zero (a failed or empty run).
pub fn ratio(value: f64, base: f64) -> Option<f64> {
    if value <= 0.0 || base <= 0.0 {
        None
    } else {
        Some(value / base)
    }
}

pub fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{ms:.0}ms")
    }
}

/// Render recorded runs from the history database, newest first.
pub fn render_history(rows: &[HistoryRow]) -> String {
    let mut out = String::new();
    if rows.is_empty() {
        out.push_str("No history recorded yet.\n");
        return out;
    }

    let width = rows.iter().map(|r| r.label.len()).max().unwrap_or(8).max(8);
    let _ = writeln!(
        out,
        "{:>6} {:<20} {:<width$} {:>4} {:<9} {:>9} {:>9} {:>9}  {}",
        "ID", "RECORDED", "SCENARIO", "ITER", "STATUS", "MEDIAN", "MIN", "MAX", "ERROR",
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:>6} {:<20} {:<width$} {:>4} {:<9} {:>9} {:>9} {:>9}  {}",
            row.id,
            row.recorded,
            row.label,
            row.iteration,
            row.stats.status.to_string(),
            format_ms(row.stats.median_ms),
            format_ms(row.stats.min_ms),
            format_ms(row.stats.max_ms),
            row.error.as_deref().unwrap_or(""),
        );
    }
    out
}

#[derive(Serialize)]
struct JsonRun<'a> {
    label: &'a str,
    iteration: u32,
    #[serde(flatten)]
    stats: &'a RunStatistics,
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    run_id: &'a str,
    recorded_at: DateTime<Utc>,
    summaries: BTreeMap<String, Summary>,
    runs: Vec<JsonRun<'a>>,
    errors: &'a BTreeMap<String, String>,
}

/// Errors that can occur while writing the results file.
#[derive(Debug)]
pub enum ReportError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => {
                write!(f, "failed to serialize results: {}", source)
            }
            ReportError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            ReportError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} to {}: {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
            ReportError::Rename { source, .. } => Some(source),
        }
    }
}

/// Atomically write the results of this invocation as pretty JSON.
///
/// Writes to a temporary file in the same directory, then renames, so a
/// reader never sees a partial file.
pub fn write_json(path: &Path, run_id: &str, context: &BenchContext) -> Result<(), ReportError> {
    let report = JsonReport {
        run_id,
        recorded_at: Utc::now(),
        summaries: context.summaries(),
        runs: context
            .records
            .iter()
            .map(|r| JsonRun {
                label: &r.label,
                iteration: r.iteration,
                stats: &r.stats,
                error: r.error.as_deref(),
            })
            .collect(),
        errors: &context.errors,
    };
    let json =
        serde_json::to_string_pretty(&report).map_err(|e| ReportError::Serialize { source: e })?;

    let dir = path.parent().unwrap_or(Path::new("."));
    let tmp_path = dir.join(format!(".results.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ReportError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| ReportError::Rename {
        from: tmp_path,
        to: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}
