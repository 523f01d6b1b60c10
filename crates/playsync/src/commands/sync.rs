//! `playsync sync`: one history sync, then exit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabled::Tabled;

use playsync_config::Config;
use playsync_core::{FlushOutcome, SyncReport};

use crate::cli::{GlobalOpts, SyncArgs};
use crate::error::CliError;
use crate::output;

use super::{Pipeline, Wiring};

#[derive(Debug, Clone, Serialize, Tabled)]
struct SyncRow {
    #[tabled(rename = "Since", display_with = "utc_timestamp")]
    since: DateTime<Utc>,
    #[tabled(rename = "New")]
    new_records: usize,
    #[tabled(rename = "Skipped")]
    skipped: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "Pages")]
    pages: u32,
    #[tabled(rename = "Duration (ms)")]
    duration_ms: u64,
    #[tabled(rename = "Flush")]
    flush: String,
    #[tabled(rename = "Stored")]
    stored: usize,
}

impl SyncRow {
    fn new(report: &SyncReport, stored: usize) -> Self {
        Self {
            since: report.since,
            new_records: report.new_records,
            skipped: report.skipped,
            failed: report.failed,
            pages: report.pages,
            duration_ms: u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            flush: report.flush.as_ref().map_or_else(|| "-".into(), flush_label),
            stored,
        }
    }
}

fn utc_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn flush_label(outcome: &FlushOutcome) -> String {
    match outcome {
        FlushOutcome::Complete { .. } => "complete".into(),
        FlushOutcome::Incomplete { .. } => "incomplete".into(),
        FlushOutcome::BestEffort => "best-effort".into(),
        FlushOutcome::Cancelled => "cancelled".into(),
    }
}

pub async fn handle(args: SyncArgs, config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let mut sync = config.sync_config();
    if args.all {
        sync.sync_all = true;
    }
    if let Some(hours) = args.lookback_hours {
        sync.lookback = Duration::from_secs(hours.saturating_mul(3600));
    }

    let pipeline = Pipeline::build(
        config,
        sync,
        Wiring {
            history: true,
            monitors: false,
            bus_capacity: args.bus_capacity,
        },
    )?;
    if !pipeline.has_history() {
        return Err(CliError::NoHistorySource);
    }

    let result = pipeline.manager.trigger_sync().await;
    let store = pipeline.store.clone();
    pipeline.shutdown().await;
    let report = result?;

    let rows = [SyncRow::new(&report, store.len())];
    let rendered = output::render_list(global.output, &rows, SyncRow::clone)?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}
