//! Scheduler (C5) — the heart of the core. One logical task per active source; each fetch
//! cycle polls (C2), reconciles against the store (C4), normalizes geometry (C1), and emits
//! lifecycle events (C6). See spec.md §4.5 for the full per-tick contract this mirrors.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broadcaster::EventBroadcaster;
use crate::clock::Clock;
use crate::geometry;
use crate::model::{Alert, AlertKey, SourceId};
use crate::parser::CapParser;
use crate::source::SourceRegistry;
use crate::store::AlertStore;

/// spec.md §4.5 step 5: alerts are processed in batches of 50.
const RECONCILE_BATCH_SIZE: usize = 50;
/// Every 10 cycles, a statistics snapshot is logged (spec.md §4.5 step 7).
const STATS_SNAPSHOT_EVERY: u64 = 10;

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub cycles: AtomicU64,
    pub failed_cycles: AtomicU64,
    pub new_count: AtomicU64,
    pub updated_count: AtomicU64,
    pub expired_count: AtomicU64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles": self.cycles.load(Ordering::Relaxed),
            "failedCycles": self.failed_cycles.load(Ordering::Relaxed),
            "new": self.new_count.load(Ordering::Relaxed),
            "updated": self.updated_count.load(Ordering::Relaxed),
            "expired": self.expired_count.load(Ordering::Relaxed),
        })
    }
}

pub struct Scheduler {
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<dyn AlertStore>,
    parser: Arc<CapParser>,
    broadcaster: Arc<EventBroadcaster>,
    clock: Arc<dyn Clock>,
    timers: DashMap<SourceId, JoinHandle<()>>,
    stopping: AtomicBool,
    pub stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SourceRegistry>,
        store: Arc<dyn AlertStore>,
        parser: Arc<CapParser>,
        broadcaster: Arc<EventBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            parser,
            broadcaster,
            clock,
            timers: DashMap::new(),
            stopping: AtomicBool::new(false),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// Snapshot active sources, create one timer per source, trigger an initial fetch.
    /// Callers also start the janitor alongside this (spec.md §4.5's `start()`).
    pub fn start(self: &Arc<Self>) {
        self.stopping.store(false, Ordering::Relaxed);
        for source in self.registry.get_active() {
            self.update_source(source.id);
        }
    }

    fn spawn_source_loop(self: &Arc<Self>, source_id: SourceId) {
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if scheduler.stopping.load(Ordering::Relaxed) {
                    break;
                }
                let still_active = scheduler.run_cycle(source_id, false).await;
                if !still_active || scheduler.stopping.load(Ordering::Relaxed) {
                    break;
                }
                let interval_secs = scheduler
                    .registry
                    .get_by_id(source_id)
                    .map(|s| u64::from(s.fetch_interval_seconds))
                    .unwrap_or(60);
                tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            }
        });
        self.timers.insert(source_id, handle);
    }

    /// Cancel every timer and the janitor; idempotent. In-flight cycles finish their current
    /// HTTP call (bounded by the 120s timeout) and drain before this returns — no
    /// cancellation token reaches into a mid-batch insert (spec.md §5).
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        let keys: Vec<SourceId> = self.timers.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, handle)) = self.timers.remove(&key) {
                let _ = handle.await;
            }
        }
    }

    /// On external config change: re-evaluate one source (reschedule if activated, cancel if
    /// deactivated).
    pub fn update_source(self: &Arc<Self>, id: SourceId) {
        match self.registry.get_by_id(id) {
            Some(source) if source.active => {
                if !self.timers.contains_key(&id) {
                    self.spawn_source_loop(id);
                }
            }
            _ => self.remove_source_interval(id),
        }
    }

    pub fn remove_source_interval(&self, id: SourceId) {
        if let Some((_, handle)) = self.timers.remove(&id) {
            handle.abort();
        }
    }

    /// `manualRefresh(sourceId?)`: bypasses the `needsFetching` guard but stays atomic per
    /// source. Runs synchronously and returns once the cycle (or cycles) complete.
    pub async fn manual_refresh(&self, source_id: Option<SourceId>) -> Vec<SourceId> {
        let targets = match source_id {
            Some(id) => self.registry.get_by_id(id).into_iter().map(|s| s.id).collect(),
            None => self.registry.get_active().into_iter().map(|s| s.id).collect::<Vec<_>>(),
        };
        for id in &targets {
            self.run_cycle(*id, true).await;
        }
        targets
    }

    /// Returns `false` when the source no longer exists or has been deactivated, signalling
    /// the calling timer loop to stop rescheduling itself.
    async fn run_cycle(&self, source_id: SourceId, bypass_needs_fetching: bool) -> bool {
        let source = match self.registry.get_by_id(source_id) {
            Some(s) => s,
            None => return false,
        };
        if !source.active {
            return false;
        }

        let now = self.clock.now();
        if !bypass_needs_fetching && !source.needs_fetching(now) {
            return true;
        }

        let fetch_result = Arc::clone(&self.parser).fetch_alerts(&source).await;
        let attempt_time = self.clock.now();

        match &fetch_result {
            Ok(alerts) => {
                self.registry.record_fetch_attempt(source_id, attempt_time, true, None);
                self.reconcile(source_id, alerts.clone(), attempt_time).await;
            }
            Err(e) => {
                self.stats.failed_cycles.fetch_add(1, Ordering::Relaxed);
                self.registry
                    .record_fetch_attempt(source_id, attempt_time, false, Some(e.to_string()));
                warn!(source = %source.name, error = %e, "fetch cycle failed; repairing expired bit and continuing");
            }
        }

        // spec.md §4.5 step 6: expired-bit repair runs regardless of fetch outcome.
        let expired = self.store.mark_expired(attempt_time, Some(source_id)).await;
        if !expired.is_empty() {
            self.stats.expired_count.fetch_add(expired.len() as u64, Ordering::Relaxed);
            for alert in expired {
                self.broadcaster.alert_expire(alert);
            }
        }

        let cycle_no = self.stats.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        info!(source = %source.name, "fetch cycle complete");
        if cycle_no % STATS_SNAPSHOT_EVERY == 0 {
            info!(stats = %self.stats.snapshot(), "scheduler statistics snapshot");
        }

        true
    }

    async fn reconcile(&self, source_id: SourceId, parsed: Vec<Alert>, now: DateTime<Utc>) {
        let identifiers: HashSet<String> = parsed.iter().map(|a| a.identifier.clone()).collect();
        let existing: HashMap<String, Alert> = self
            .store
            .find_by_identifiers(source_id, &identifiers)
            .await
            .into_iter()
            .map(|a| (a.identifier.clone(), a))
            .collect();

        for batch in parsed.chunks(RECONCILE_BATCH_SIZE) {
            let mut to_upsert = Vec::new();
            let mut to_insert = Vec::new();

            for alert in batch {
                let mut alert = alert.clone();
                alert.active = alert.compute_active(now);

                match existing.get(&alert.identifier) {
                    Some(current) if current.sent == alert.sent && current.active == alert.active => {
                        // Skip: unchanged (spec.md §4.5 step 5).
                    }
                    Some(current) => {
                        // Strip any pre-computed geoJson from the incoming payload: it is
                        // always recomputed by C1 and written separately, so a possibly
                        // invalid pre-computed geometry can never reject the whole batch.
                        alert.strip_geometry();
                        alert.created_at = current.created_at;
                        alert.updated_at = now;
                        to_upsert.push(alert);
                    }
                    None => {
                        alert.strip_geometry();
                        alert.created_at = now;
                        alert.updated_at = now;
                        to_insert.push(alert);
                    }
                }
            }

            if !to_upsert.is_empty() {
                let updated = to_upsert.len() as u64;
                let keys: Vec<AlertKey> = to_upsert
                    .iter()
                    .map(|a| AlertKey::new(a.source_id, a.identifier.clone()))
                    .collect();
                self.store.bulk_upsert(to_upsert).await;
                for key in keys {
                    // geoJson was stripped above and must be recomputed and written
                    // separately, same as a fresh insert (spec.md §4.5 step 5: "it will be
                    // recomputed and written separately"). A C1 or spatial-index failure for
                    // one record never aborts siblings.
                    if let Some(mut alert) = self.store.find_by_id(&key).await {
                        self.normalize_and_persist_geometry(&key, &mut alert).await;
                        self.broadcaster.alert_update(alert);
                    }
                }
                self.stats.updated_count.fetch_add(updated, Ordering::Relaxed);
            }

            if !to_insert.is_empty() {
                let inserted_keys = self.store.bulk_insert(to_insert).await;
                for key in inserted_keys {
                    // A C1 or spatial-index failure for one record never aborts siblings.
                    if let Some(mut alert) = self.store.find_by_id(&key).await {
                        self.normalize_and_persist_geometry(&key, &mut alert).await;
                        self.broadcaster.alert_new(alert);
                        self.stats.new_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Runs C1 over every area of a freshly inserted alert and persists whatever geometry
    /// comes back. A spatial-index rejection is a soft error: logged, the alert stays
    /// stored without valid geometry for that area (spec.md §4.4 / §7).
    async fn normalize_and_persist_geometry(&self, key: &AlertKey, alert: &mut Alert) {
        for (info_index, info) in alert.info.iter().enumerate() {
            for (area_index, area) in info.areas.iter().enumerate() {
                let geo = geometry::normalize_area(&area.polygons, &area.circles, &area.area_desc);
                if let Some(geo) = geo {
                    if self.store.set_geo_json(key, info_index, area_index, geo.clone()).await {
                        alert.info[info_index].areas[area_index].geo_json = Some(geo);
                    } else {
                        warn!(
                            identifier = %alert.identifier,
                            area = %area.area_desc,
                            "spatial index rejected geometry; alert kept without it"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::Source;
    use crate::store::InMemoryAlertStore;

    fn scheduler_with_fixed_clock(now: DateTime<Utc>) -> (Arc<Scheduler>, Arc<SourceRegistry>, Arc<dyn AlertStore>) {
        let registry = Arc::new(SourceRegistry::new());
        let store: Arc<dyn AlertStore> = Arc::new(InMemoryAlertStore::new());
        let parser = Arc::new(CapParser::new(Duration::from_secs(300)));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(now));
        let scheduler = Arc::new(Scheduler::new(registry.clone(), store.clone(), parser, broadcaster, clock));
        (scheduler, registry, store)
    }

    #[tokio::test]
    async fn run_cycle_returns_false_and_is_inert_for_unknown_source() {
        let (scheduler, _registry, _store) = scheduler_with_fixed_clock(Utc::now());
        let bogus = SourceId(uuid::Uuid::new_v4());
        assert!(!scheduler.run_cycle(bogus, true).await);
    }

    #[tokio::test]
    async fn run_cycle_skips_inactive_source_without_fetching() {
        let (scheduler, registry, _store) = scheduler_with_fixed_clock(Utc::now());
        let mut source = Source::new("s", "https://example.invalid/rss.xml", "US");
        source.active = false;
        let id = source.id;
        registry.create(source).unwrap();
        assert!(!scheduler.run_cycle(id, true).await);
    }

    #[tokio::test]
    async fn manual_refresh_with_no_source_id_targets_every_active_source() {
        let (scheduler, registry, _store) = scheduler_with_fixed_clock(Utc::now());
        let mut a = Source::new("a", "https://example.invalid/a.xml", "US");
        a.active = false;
        let mut b = Source::new("b", "https://example.invalid/b.xml", "US");
        b.active = true;
        registry.create(a).unwrap();
        registry.create(b.clone()).unwrap();

        let targeted = scheduler.manual_refresh(None).await;
        assert_eq!(targeted, vec![b.id]);
    }
}
