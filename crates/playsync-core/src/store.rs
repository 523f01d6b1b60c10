// ── Event store contract ──
//
// The durable side of delivery. Implementations must make `insert_event`
// idempotent on the correlation key: the bus path and the fallback path
// may both land the same event.

use std::collections::HashMap;

use dashmap::{DashMap, DashSet};
use futures_util::future::BoxFuture;

use crate::error::CoreError;
use crate::model::{Geolocation, PlaybackEvent};

pub trait EventStore: Send + Sync {
    fn session_key_exists<'a>(&'a self, session_key: &'a str) -> BoxFuture<'a, Result<bool, CoreError>>;

    fn insert_event<'a>(&'a self, event: &'a PlaybackEvent) -> BoxFuture<'a, Result<(), CoreError>>;

    /// Batched lookup. IPs without a row are absent from the result.
    fn get_geolocations<'a>(
        &'a self,
        ips: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, Geolocation>, CoreError>>;

    fn upsert_geolocation<'a>(&'a self, geo: &'a Geolocation) -> BoxFuture<'a, Result<(), CoreError>>;
}

// ── In-memory store ──────────────────────────────────────────────────

/// Concurrent in-memory store, keyed by correlation key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: DashMap<String, PlaybackEvent>,
    session_keys: DashSet<String>,
    geolocations: DashMap<String, Geolocation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All stored events, oldest first.
    pub fn events(&self) -> Vec<PlaybackEvent> {
        let mut events: Vec<_> = self.events.iter().map(|e| e.value().clone()).collect();
        events.sort_by_key(|e| e.started_at);
        events
    }

    pub fn geolocation(&self, ip: &str) -> Option<Geolocation> {
        self.geolocations.get(ip).map(|g| g.clone())
    }

    fn insert_now(&self, event: &PlaybackEvent) -> Result<(), CoreError> {
        event.validate()?;
        let key = event
            .correlation_key
            .clone()
            .unwrap_or_else(|| event.compute_correlation_key());

        self.session_keys.insert(event.session_key.clone());
        self.events.entry(key).or_insert_with(|| event.clone());
        Ok(())
    }
}

impl EventStore for MemoryStore {
    fn session_key_exists<'a>(&'a self, session_key: &'a str) -> BoxFuture<'a, Result<bool, CoreError>> {
        Box::pin(async move { Ok(self.session_keys.contains(session_key)) })
    }

    fn insert_event<'a>(&'a self, event: &'a PlaybackEvent) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move { self.insert_now(event) })
    }

    fn get_geolocations<'a>(
        &'a self,
        ips: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, Geolocation>, CoreError>> {
        Box::pin(async move {
            Ok(ips
                .iter()
                .filter_map(|ip| self.geolocations.get(ip).map(|g| (ip.clone(), g.clone())))
                .collect())
        })
    }

    fn upsert_geolocation<'a>(&'a self, geo: &'a Geolocation) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            self.geolocations.insert(geo.ip_address.clone(), geo.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::model::Source;

    #[tokio::test]
    async fn insert_is_idempotent_on_correlation_key() {
        let store = MemoryStore::new();
        let mut event = PlaybackEvent::new(Source::Tautulli, "42", Utc::now()).unwrap();
        event.ensure_correlation_key();

        store.insert_event(&event).await.unwrap();
        let mut again = event.clone();
        again.id = uuid::Uuid::new_v4();
        store.insert_event(&again).await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.session_key_exists("42").await.unwrap());
        assert!(!store.session_key_exists("43").await.unwrap());
    }

    #[tokio::test]
    async fn geolocation_lookup_returns_only_known_ips() {
        let store = MemoryStore::new();
        store
            .upsert_geolocation(&Geolocation::unknown("10.0.0.1"))
            .await
            .unwrap();

        let ips = vec!["10.0.0.1".to_owned(), "10.0.0.2".to_owned()];
        let found = store.get_geolocations(&ips).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["10.0.0.1"].country, "Unknown");
    }
}
