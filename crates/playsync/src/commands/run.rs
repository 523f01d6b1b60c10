//! `playsync run`: scheduled sync plus live session monitors until ctrl-c.

use tracing::info;

use playsync_config::{Config, config_path};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;

use super::{Pipeline, Wiring};

pub async fn handle(args: RunArgs, config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let pipeline = Pipeline::build(
        config,
        config.sync_config(),
        Wiring {
            history: !args.no_sync,
            monitors: true,
            bus_capacity: args.bus_capacity,
        },
    )?;
    if pipeline.is_idle() {
        return Err(CliError::NoSources {
            path: global
                .config
                .clone()
                .unwrap_or_else(config_path)
                .display()
                .to_string(),
        });
    }

    pipeline.manager.set_on_sync_completed(|new_records, duration| {
        info!(
            new_records,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "scheduled sync finished"
        );
    });

    pipeline.manager.start().await;
    info!(
        history = pipeline.has_history(),
        monitors = pipeline.manager.monitors().len(),
        "playsync running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let store = pipeline.store.clone();
    let stats = pipeline.shutdown().await;
    if !global.quiet {
        let published = stats.map_or(0, |s| s.events_received);
        eprintln!("Stopped: {} events stored, {published} published", store.len());
    }
    Ok(())
}
