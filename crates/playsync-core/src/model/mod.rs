// ── Canonical domain model ──
//
// Every adapter converges on these types before anything is delivered.

pub mod event;
pub mod geo;

pub use event::{PlaybackEvent, PlaybackState, QualityInfo, Source, UNRESOLVED_USER_ID};
pub use geo::Geolocation;
