// playsync-core: Ingestion and resilient delivery between the backend clients and the event store.

pub mod breaker;
pub mod config;
pub mod convert;
pub mod error;
pub mod identity;
pub mod model;
pub mod monitor;
pub mod poller;
pub mod publisher;
pub mod source;
pub mod store;
pub mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use config::{DeliveryMode, HistorySourceConfig, MediaServerConfig, SessionPollerConfig, SyncConfig};
pub use error::CoreError;
pub use identity::{MemoryIdentityMap, ResolveRequest, UserResolver};
pub use model::{Geolocation, PlaybackEvent, PlaybackState, QualityInfo, Source, UNRESOLVED_USER_ID};
pub use monitor::SessionMonitor;
pub use poller::SessionPoller;
pub use publisher::{BusStats, ChannelBus, Delivery, EventBus, EventPublisher, FlushConfig, FlushOutcome};
pub use source::{HistorySource, Protected, SessionSource, history_source_from_config};
pub use store::{EventStore, MemoryStore};
pub use sync::{SyncManager, SyncManagerBuilder, SyncReport};
