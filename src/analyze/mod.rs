//! Offline diagnostics over a recorded trace.
//!
//! Streams the JSONL log once, folds it into per-coroutine state and
//! applies two heuristics: coroutines whose final address looks invalid
//! (suspected SIGBUS / memory corruption) and coroutines that suspended
//! and were never resumed again before the trace ended (lost wakeups).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::sink::record::TraceRecord;

/// A coroutine that suspended and stayed silent for longer than this
/// before the end of the trace is reported as a lost wakeup.
const LOST_WAKEUP_THRESHOLD_NS: u64 = 1_000_000_000;

/// Address a coroutine should never be executing at.
const NULL_ADDR: &str = "0x0000000000000000";

/// Folded per-coroutine trace state.
#[derive(Debug, Clone)]
pub struct CoroState {
    pub probe_id: u64,
    pub first_ts: u64,
    pub last_ts: u64,
    pub last_active: bool,
    pub last_addr: String,
    pub last_tid: u64,
    pub event_count: usize,
    pub tid_migrations: usize,
}

/// Result of one analysis pass.
#[derive(Debug)]
pub struct Report {
    pub total_coroutines: usize,
    pub total_events: usize,
    pub skipped_lines: usize,
    pub duration_ms: f64,
    pub sigbus_risks: Vec<CoroState>,
    pub lost_wakeups: Vec<CoroState>,
}

/// Analyze the JSONL trace at `path`.
pub fn analyze_file(path: &Path) -> Result<Report> {
    let file =
        File::open(path).with_context(|| format!("opening trace file {}", path.display()))?;
    analyze_lines(BufReader::new(file))
}

/// Analyze JSONL records from any line source. Unparseable lines are
/// counted and skipped.
pub fn analyze_lines<R: BufRead>(reader: R) -> Result<Report> {
    let mut states: HashMap<u64, CoroState> = HashMap::new();
    let mut global_min_ts = u64::MAX;
    let mut global_max_ts = 0u64;
    let mut total_events = 0usize;
    let mut skipped = 0usize;

    for line in reader.lines() {
        let line = line.context("reading trace line")?;
        if line.is_empty() {
            continue;
        }

        let record = match TraceRecord::parse_line(&line) {
            Ok(record) => record,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        total_events += 1;
        global_min_ts = global_min_ts.min(record.ts);
        global_max_ts = global_max_ts.max(record.ts);

        match states.get_mut(&record.probe_id) {
            Some(state) => {
                if record.tid != state.last_tid {
                    state.tid_migrations += 1;
                    state.last_tid = record.tid;
                }
                state.last_ts = record.ts;
                state.last_active = record.is_active;
                state.last_addr = record.addr;
                state.event_count += 1;
            }
            None => {
                states.insert(
                    record.probe_id,
                    CoroState {
                        probe_id: record.probe_id,
                        first_ts: record.ts,
                        last_ts: record.ts,
                        last_active: record.is_active,
                        last_tid: record.tid,
                        last_addr: record.addr,
                        event_count: 1,
                        tid_migrations: 0,
                    },
                );
            }
        }
    }

    if skipped > 0 {
        warn!(skipped, "unparseable trace lines ignored");
    }

    let duration_ms = if total_events > 0 {
        (global_max_ts - global_min_ts) as f64 / 1e6
    } else {
        0.0
    };

    let mut sigbus_risks: Vec<CoroState> = states
        .values()
        .filter(|s| s.last_addr == NULL_ADDR || s.last_addr.len() <= 4)
        .cloned()
        .collect();
    sigbus_risks.sort_by_key(|s| s.probe_id);

    let mut lost_wakeups: Vec<CoroState> = states
        .values()
        .filter(|s| !s.last_active && global_max_ts - s.last_ts > LOST_WAKEUP_THRESHOLD_NS)
        .cloned()
        .collect();
    lost_wakeups.sort_by_key(|s| s.last_ts);

    info!(
        coroutines = states.len(),
        events = total_events,
        sigbus_risks = sigbus_risks.len(),
        lost_wakeups = lost_wakeups.len(),
        "analysis complete",
    );

    Ok(Report {
        total_coroutines: states.len(),
        total_events,
        skipped_lines: skipped,
        duration_ms,
        sigbus_risks,
        lost_wakeups,
    })
}

/// Render the report as Markdown and write it to `path`.
pub fn write_report(report: &Report, path: &Path) -> Result<()> {
    std::fs::write(path, render_markdown(report))
        .with_context(|| format!("writing report {}", path.display()))?;

    info!(report = %path.display(), "report written");
    Ok(())
}

fn render_markdown(report: &Report) -> String {
    let mut out = String::new();

    out.push_str("# coroTracer Diagnostic Report\n\n");
    out.push_str("## Overview\n\n");
    let _ = writeln!(out, "* Traced coroutines: {}", report.total_coroutines);
    let _ = writeln!(out, "* State transitions: {}", report.total_events);
    let _ = writeln!(out, "* Recording duration: {:.2} ms", report.duration_ms);
    if report.skipped_lines > 0 {
        let _ = writeln!(out, "* Unparseable lines skipped: {}", report.skipped_lines);
    }

    out.push_str("\n## Suspected SIGBUS / memory corruption\n\n");
    out.push_str("Coroutines whose final recorded address is null or malformed.\n\n");
    if report.sigbus_risks.is_empty() {
        out.push_str("No address anomalies detected.\n");
    } else {
        out.push_str("| Probe ID | Last TS | Address |\n");
        out.push_str("| --- | --- | --- |\n");
        for state in &report.sigbus_risks {
            let _ = writeln!(
                out,
                "| {} | {} | `{}` |",
                state.probe_id, state.last_ts, state.last_addr,
            );
        }
    }

    out.push_str("\n## Lost wakeups\n\n");
    out.push_str(
        "Coroutines that suspended and were never resumed again before the trace ended.\n\n",
    );
    if report.lost_wakeups.is_empty() {
        out.push_str("No lost wakeups detected.\n");
    } else {
        out.push_str("| Probe ID | Last TS | Last TID | Last address |\n");
        out.push_str("| --- | --- | --- | --- |\n");
        for state in &report.lost_wakeups {
            let _ = writeln!(
                out,
                "| {} | {} | {} | `{}` |",
                state.probe_id, state.last_ts, state.last_tid, state.last_addr,
            );
        }
    }

    out
}
