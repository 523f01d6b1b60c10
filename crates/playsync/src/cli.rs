//! Clap derive structures for the `playsync` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// playsync -- playback history ingestion for Tautulli, Jellyfin and Emby
#[derive(Debug, Parser)]
#[command(
    name = "playsync",
    version,
    about = "Ingest playback history from Tautulli, Jellyfin and Emby",
    long_about = "Pulls watch history from Tautulli on a schedule and watches live\n\
        sessions on Jellyfin and Emby servers, normalizing both into one\n\
        playback event stream.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (default: platform config dir)
    #[arg(long, env = "PLAYSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduled sync and session monitors until interrupted
    Run(RunArgs),

    /// Run one history sync and exit
    Sync(SyncArgs),

    /// Ping every configured source
    Check,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Skip the scheduled history sync, monitor live sessions only
    #[arg(long)]
    pub no_sync: bool,

    /// Event bus capacity
    #[arg(long, default_value = "1024")]
    pub bus_capacity: usize,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Import the full history instead of the lookback window
    #[arg(long)]
    pub all: bool,

    /// Override the lookback window, in hours
    #[arg(long, conflicts_with = "all")]
    pub lookback_hours: Option<u64>,

    /// Event bus capacity
    #[arg(long, default_value = "1024")]
    pub bus_capacity: usize,
}
