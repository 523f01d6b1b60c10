// One pull cycle: page through the history source, skip what the store
// already has, enrich, deliver, then flush and report.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use playsync_api::tautulli::HistoryRecord;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::manager::SyncManager;
use crate::config::DeliveryMode;
use crate::error::CoreError;
use crate::identity::{ResolveRequest, resolve_user_id};
use crate::model::{Geolocation, PlaybackEvent, Source};
use crate::publisher::{EventPublisher, FlushOutcome};
use crate::source::HistorySource;

/// Server id used for identity resolution of history rows.
const HISTORY_SERVER_ID: &str = "default";

/// Outcome of one successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Lower bound the run fetched from.
    pub since: DateTime<Utc>,
    pub new_records: usize,
    /// Records whose session key was already stored.
    pub skipped: usize,
    /// Records dropped by per-record errors.
    pub failed: usize,
    pub pages: u32,
    pub duration: Duration,
    pub flush: Option<FlushOutcome>,
}

#[derive(Debug, Default)]
struct BatchTally {
    new_records: usize,
    skipped: usize,
    failed: usize,
}

fn is_usable_ip(ip: &str) -> bool {
    let ip = ip.trim();
    !ip.is_empty() && ip != "N/A"
}

/// Run the flush protocol and turn lost downstream writes into an error,
/// so the run is not recorded as done.
async fn settle(
    publisher: &EventPublisher,
    errors_before: u64,
    cancel: &CancellationToken,
) -> Result<FlushOutcome, CoreError> {
    let outcome = publisher.flush_until_complete(cancel).await;
    match outcome {
        FlushOutcome::Cancelled => Err(CoreError::Cancelled),
        FlushOutcome::Incomplete { received, flushed, .. } => {
            let errors = publisher
                .bus()
                .stats()
                .map_or(0, |s| s.error_count.saturating_sub(errors_before));
            if errors > 0 {
                return Err(CoreError::FlushIncomplete {
                    pending: received.saturating_sub(flushed),
                    errors,
                });
            }
            warn!(received, flushed, "flush gave up with events still pending");
            Ok(outcome)
        }
        FlushOutcome::Complete { .. } | FlushOutcome::BestEffort => Ok(outcome),
    }
}

impl SyncManager {
    /// The `since` boundary for the next run.
    pub(super) fn sync_start_time(&self) -> DateTime<Utc> {
        if let Some(last) = self.last_sync_time() {
            return last;
        }
        let cfg = &self.inner.config;
        if cfg.sync_all {
            return Utc
                .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH);
        }
        let lookback = chrono::Duration::from_std(cfg.lookback).unwrap_or(chrono::Duration::hours(24));
        Utc::now() - lookback
    }

    /// Caller must hold the sync lock.
    pub(super) async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport, CoreError> {
        let clock = Instant::now();
        let since = self.sync_start_time();

        let Some(source) = self.inner.source.clone() else {
            debug!("no history source, nothing to sync");
            return Ok(SyncReport {
                since,
                new_records: 0,
                skipped: 0,
                failed: 0,
                pages: 0,
                duration: clock.elapsed(),
                flush: None,
            });
        };

        let publisher = self.publisher();
        let bus_errors_before = publisher
            .as_ref()
            .and_then(|p| p.bus().stats())
            .map_or(0, |s| s.error_count);
        let batch_size = self.inner.config.batch_size.max(1);
        info!(%since, source = source.name(), "sync starting");

        let mut tally = BatchTally::default();
        let mut seen_keys = HashSet::new();
        let mut offset = 0_u32;
        let mut pages = 0_u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let records = self.fetch_page(source.as_ref(), since, offset, cancel).await?;
            if records.is_empty() {
                break;
            }
            pages += 1;

            let batch = self
                .process_batch(&records, publisher.as_deref(), &mut seen_keys)
                .await?;
            debug!(
                page = pages,
                fetched = records.len(),
                new = batch.new_records,
                skipped = batch.skipped,
                failed = batch.failed,
                "processed page"
            );
            tally.new_records += batch.new_records;
            tally.skipped += batch.skipped;
            tally.failed += batch.failed;

            if records.len() < usize::try_from(batch_size).unwrap_or(usize::MAX) {
                break;
            }
            offset = offset.saturating_add(batch_size);
        }

        let flush = match (&publisher, self.inner.config.mode) {
            (Some(publisher), DeliveryMode::EventSourcing) => {
                Some(settle(publisher, bus_errors_before, cancel).await?)
            }
            _ => None,
        };

        // Stamped only once delivery has settled; dedup absorbs the overlap
        let callback = {
            let mut state = self.write_state();
            state.last_sync = Some(Utc::now());
            state.on_completed.clone()
        };

        let duration = clock.elapsed();
        if let Some(callback) = callback {
            callback(tally.new_records, duration);
        }
        info!(
            new = tally.new_records,
            skipped = tally.skipped,
            failed = tally.failed,
            pages,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "sync completed"
        );

        Ok(SyncReport {
            since,
            new_records: tally.new_records,
            skipped: tally.skipped,
            failed: tally.failed,
            pages,
            duration,
            flush,
        })
    }

    /// Fetch one page, retrying with exponential backoff. An open breaker
    /// is not retried.
    async fn fetch_page(
        &self,
        source: &dyn HistorySource,
        since: DateTime<Utc>,
        offset: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        let cfg = &self.inner.config;
        let mut attempt = 0_u32;

        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CoreError::Cancelled),
                result = source.fetch_since(since, offset, cfg.batch_size.max(1)) => result,
            };

            let err = match result {
                Ok(records) => return Ok(records),
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= cfg.retry_attempts {
                return Err(CoreError::FetchFailed {
                    attempts: attempt + 1,
                    message: format!("offset {offset}: {err}"),
                });
            }

            let delay = cfg.retry_delay.saturating_mul(1_u32 << attempt.min(16));
            warn!(
                error = %err,
                attempt = attempt + 1,
                offset,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "history fetch failed, retrying"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CoreError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Per-record failures are tallied and skipped. Only a dual-path
    /// delivery failure aborts the batch.
    async fn process_batch(
        &self,
        records: &[HistoryRecord],
        publisher: Option<&EventPublisher>,
        seen_keys: &mut HashSet<String>,
    ) -> Result<BatchTally, CoreError> {
        self.ensure_geolocations(records).await;

        let mut tally = BatchTally::default();
        for record in records {
            match self.process_record(record, publisher, seen_keys).await {
                Ok(true) => tally.new_records += 1,
                Ok(false) => tally.skipped += 1,
                Err(e @ CoreError::DeliveryFailed { .. }) => return Err(e),
                Err(e) => {
                    warn!(session_key = %record.effective_session_key(), error = %e, "skipping record");
                    tally.failed += 1;
                }
            }
        }
        Ok(tally)
    }

    /// Returns `Ok(false)` for records already stored or already seen in
    /// this run.
    async fn process_record(
        &self,
        record: &HistoryRecord,
        publisher: Option<&EventPublisher>,
        seen_keys: &mut HashSet<String>,
    ) -> Result<bool, CoreError> {
        let session_key = record.effective_session_key();
        if seen_keys.contains(&session_key) || self.inner.store.session_key_exists(&session_key).await? {
            trace!(%session_key, "already stored");
            return Ok(false);
        }
        if !is_usable_ip(&record.ip_address) {
            return Err(CoreError::InvalidRecord {
                session_key,
                reason: format!("invalid IP address {:?}", record.ip_address),
            });
        }

        let mut event = PlaybackEvent::try_from(record)?;
        let request = ResolveRequest {
            source: Source::Tautulli,
            server_id: HISTORY_SERVER_ID.to_owned(),
            external_user_id: record.user_id.map(|id| id.to_string()).unwrap_or_default(),
            username: Some(record.user.clone()).filter(|u| !u.is_empty()),
            friendly_name: Some(record.friendly_name.clone()).filter(|n| !n.is_empty()),
        };
        event.user_id = resolve_user_id(self.inner.resolver.as_deref(), &request).await;

        self.deliver(event, publisher).await?;
        seen_keys.insert(session_key);
        Ok(true)
    }

    async fn deliver(&self, mut event: PlaybackEvent, publisher: Option<&EventPublisher>) -> Result<(), CoreError> {
        match (self.inner.config.mode, publisher) {
            (DeliveryMode::EventSourcing, Some(publisher)) => {
                publisher.publish_with_fallback(event).await?;
            }
            (DeliveryMode::Notification, Some(publisher)) => {
                event.ensure_correlation_key();
                self.inner.store.insert_event(&event).await?;
                publisher.notify_async(event);
            }
            (_, None) => {
                event.ensure_correlation_key();
                self.inner.store.insert_event(&event).await?;
            }
        }
        Ok(())
    }

    /// Make sure every client IP in the batch has a geolocation row,
    /// inserting "Unknown" placeholders for new ones. Failures only log.
    async fn ensure_geolocations(&self, records: &[HistoryRecord]) {
        let ips: Vec<String> = records
            .iter()
            .map(|r| r.ip_address.trim())
            .filter(|ip| is_usable_ip(ip))
            .map(str::to_owned)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ips.is_empty() {
            return;
        }

        let store = Arc::clone(&self.inner.store);
        let known = match store.get_geolocations(&ips).await {
            Ok(known) => known,
            Err(e) => {
                warn!(error = %e, ips = ips.len(), "geolocation lookup failed, continuing without it");
                return;
            }
        };

        let missing: Vec<&String> = ips.iter().filter(|ip| !known.contains_key(*ip)).collect();
        trace!(hits = known.len(), misses = missing.len(), "geolocation batch lookup");
        for ip in missing {
            if let Err(e) = store.upsert_geolocation(&Geolocation::unknown(ip.as_str())).await {
                warn!(%ip, error = %e, "failed to store fallback geolocation");
            }
        }
    }
}
