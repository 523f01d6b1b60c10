// playsync-api: Async clients for the playback backends (Tautulli, Jellyfin, Emby)

pub mod error;
pub mod mediaserver;
pub mod tautulli;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use mediaserver::{MediaServerClient, ServerKind};
pub use tautulli::TautulliClient;
pub use transport::{RateLimitedTransport, RetryPolicy, TransportConfig};
pub use websocket::{SessionStream, StreamHandlers};
