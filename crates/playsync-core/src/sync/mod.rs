// ── Sync manager ──
//
// `manager` owns lifecycle and shared state; `run` is one pull cycle
// against the history source.

mod manager;
mod run;

pub use manager::{SyncCompleted, SyncManager, SyncManagerBuilder};
pub use run::SyncReport;
