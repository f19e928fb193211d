//! Report writer.
//!
//! Emits a stable-field-order JSON artefact and a human-readable summary,
//! in plain `println!`-based style rather than via a table-drawing
//! dependency this crate has no other use for.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::model::{FleetReport, OperationStatus};

/// Builds the report filename: `<operation>-report-<ISO8601Z>.json`.
pub fn report_filename(report: &FleetReport) -> String {
    let op = match report.config.operation {
        crate::model::Operation::Upgrade => "upgrade",
        crate::model::Operation::Rollback => "rollback",
    };
    let ts = report.started_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    // RFC3339 colons are not filename-safe on every filesystem.
    let ts = ts.replace(':', "");
    format!("{}-report-{}.json", op, ts)
}

/// Writes the JSON report to `dir/<filename>` with stable field order and
/// a result list already sorted by the scheduler.
/// Two runs producing the same results and config produce byte-identical
/// JSON modulo timestamps.
pub fn write_json(report: &FleetReport, dir: &std::path::Path) -> io::Result<PathBuf> {
    let path = dir.join(report_filename(report));
    let file = File::create(&path)?;
    serde_json::to_writer_pretty(file, report)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(path)
}

/// Renders the human-readable summary to `out`: timing, a
/// statistics table, and tables of failures / dry-run candidates if any.
pub fn write_summary<W: Write>(report: &FleetReport, mut out: W) -> io::Result<()> {
    writeln!(
        out,
        "fleet {} run: {} -> {} ({:.1}s)",
        report.config.operation,
        fmt_ts(report.started_at),
        fmt_ts(report.finished_at),
        report.duration_seconds
    )?;
    if let Some(msg) = &report.message {
        writeln!(out, "note: {}", msg)?;
    }

    let s = &report.statistics;
    writeln!(out, "statistics:")?;
    writeln!(out, "  total        {}", s.total)?;
    writeln!(out, "  eligible     {}", s.eligible)?;
    writeln!(out, "  up_to_date   {}", s.up_to_date)?;
    writeln!(out, "  started      {}", s.started)?;
    writeln!(out, "  succeeded    {}", s.succeeded)?;
    writeln!(out, "  failed       {}", s.failed)?;
    writeln!(out, "  skipped      {}", s.skipped)?;
    writeln!(out, "  compensated  {}", s.compensated)?;

    let failures: Vec<_> = report
        .results
        .iter()
        .filter(|r| r.status == OperationStatus::Failed)
        .collect();
    if !failures.is_empty() {
        writeln!(out, "failures:")?;
        for r in &failures {
            writeln!(
                out,
                "  {}/{}  {:?}  {}",
                r.location,
                r.instance,
                r.error_kind,
                r.error_message.as_deref().unwrap_or("")
            )?;
        }
    }

    let dry_runs: Vec<_> = report
        .results
        .iter()
        .filter(|r| r.status == OperationStatus::DryRun)
        .collect();
    if !dry_runs.is_empty() {
        writeln!(out, "dry-run candidates:")?;
        for r in &dry_runs {
            writeln!(
                out,
                "  {}/{}  -> {}",
                r.location,
                r.instance,
                r.target_version.as_deref().unwrap_or("unknown")
            )?;
        }
    }

    Ok(())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
