//! Command handlers and the ingestion pipeline they share.

pub mod check;
pub mod run;
pub mod sync;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use playsync_config::Config;
use playsync_core::{
    BusStats, ChannelBus, EventBus, EventPublisher, MemoryIdentityMap, MemoryStore, SessionMonitor,
    SyncConfig, SyncManager, history_source_from_config,
};

use crate::error::CliError;

/// Which halves of the pipeline to wire up.
#[derive(Debug, Clone, Copy)]
pub struct Wiring {
    pub history: bool,
    pub monitors: bool,
    pub bus_capacity: usize,
}

/// Sync manager and monitors publishing onto an in-process bus that
/// drains into an in-memory store.
pub struct Pipeline {
    pub manager: SyncManager,
    pub store: Arc<MemoryStore>,
    bus: Arc<ChannelBus>,
    has_history: bool,
    consumer_cancel: CancellationToken,
    consumer: JoinHandle<()>,
}

impl Pipeline {
    pub fn build(config: &Config, sync: SyncConfig, wiring: Wiring) -> Result<Self, CliError> {
        if wiring.bus_capacity == 0 {
            return Err(CliError::Validation {
                field: "bus-capacity".into(),
                reason: "must be greater than 0".into(),
            });
        }

        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(ChannelBus::new(wiring.bus_capacity));
        let consumer_cancel = CancellationToken::new();
        let consumer = bus.spawn_store_consumer(store.clone(), consumer_cancel.clone())?;

        let publisher = EventPublisher::new(bus.clone()).with_fallback(store.clone());
        let mut builder = SyncManager::builder(sync, store.clone())
            .publisher(Arc::new(publisher))
            .resolver(Arc::new(MemoryIdentityMap::new()));

        let mut has_history = false;
        if wiring.history {
            if let Some(history) = config.history_source()? {
                debug!(url = %history.url, "history source configured");
                builder = builder.history_source(history_source_from_config(&history)?);
                has_history = true;
            }
        }

        if wiring.monitors {
            for server in config.media_servers()? {
                if let Some(monitor) = SessionMonitor::from_config(&server)? {
                    builder = builder.monitor(monitor);
                }
            }
        }

        Ok(Self {
            manager: builder.build(),
            store,
            bus,
            has_history,
            consumer_cancel,
            consumer,
        })
    }

    pub fn has_history(&self) -> bool {
        self.has_history
    }

    /// True when neither a history source nor any monitor is wired.
    pub fn is_idle(&self) -> bool {
        !self.has_history && self.manager.monitors().is_empty()
    }

    /// Stop the manager, then the bus consumer. Returns final bus stats.
    pub async fn shutdown(self) -> Option<BusStats> {
        self.manager.stop().await;
        self.consumer_cancel.cancel();
        let _ = self.consumer.await;
        self.bus.stats()
    }
}
