//! Alert Store (C4). Defined as a trait so the writer (C5) and query API (C8) depend on
//! behavior, not a storage engine; `InMemoryAlertStore` is the one shipped implementation
//! (SPEC_FULL.md §4.4 design note).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::cap::Severity;
use crate::geometry::geojson_contains_point;
use crate::model::{Alert, AlertKey, Identifier, SourceId};

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Active alerts, severity desc then sent desc (spec.md §4.4).
    async fn find_active(&self) -> Vec<Alert>;
    async fn find_by_id(&self, key: &AlertKey) -> Option<Alert>;
    async fn find_by_point(&self, point: [f64; 2]) -> Vec<Alert>;
    async fn find_by_severity(&self, severity: Severity) -> Vec<Alert>;
    async fn find_by_identifiers(&self, source_id: SourceId, identifiers: &HashSet<Identifier>) -> Vec<Alert>;

    /// Update existing records in place. Idempotent per `(sourceId, identifier)`.
    async fn bulk_upsert(&self, alerts: Vec<Alert>);
    /// Insert records that do not yet exist. Returns the keys actually inserted, in order,
    /// so the caller can immediately run C1 + persist `geoJson` against each one.
    async fn bulk_insert(&self, alerts: Vec<Alert>) -> Vec<AlertKey>;
    /// Set a single area's normalized geometry after C1 runs, post-insert.
    async fn set_geo_json(&self, key: &AlertKey, info_index: usize, area_index: usize, geo_json: crate::geometry::GeoJson) -> bool;

    /// Flip `active` false wherever every `info.expires` is in the past, scoped to one
    /// source if given. Returns the records that actually transitioned, so the caller can
    /// broadcast `alert.expire` for each one (spec.md §4.6).
    async fn mark_expired(&self, now: DateTime<Utc>, source_id: Option<SourceId>) -> Vec<Alert>;
    /// Delete inactive records whose latest `expires` and `fetchedAt` are both older than
    /// `cutoff`. Returns the number deleted.
    async fn delete_old_inactive(&self, cutoff: DateTime<Utc>) -> u64;
}

#[derive(Debug, Default)]
pub struct InMemoryAlertStore {
    alerts: DashMap<AlertKey, Alert>,
    len_hint: AtomicU64,
    /// Append-only NDJSON log, one record per write, that lets a restart warm-start from the
    /// last snapshot instead of an empty map. Grounded on the reference server's
    /// `persist_worker`/`flush` pattern (`sinyalist_packets.ndjson`); `None` disables it, which
    /// is what every test in this module does.
    snapshot_path: Option<PathBuf>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warm-starts from `path` if it already holds NDJSON `Alert` records (one per line,
    /// malformed lines are skipped and logged), then appends future writes to the same file.
    pub async fn with_snapshot_path(path: PathBuf) -> Self {
        let alerts = DashMap::new();
        let mut restored = 0u64;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<Alert>(line) {
                        Ok(alert) => {
                            alerts.insert(Self::key_of(&alert), alert);
                            restored += 1;
                        }
                        Err(e) => error!(error = %e, "skipping malformed snapshot line"),
                    }
                }
                info!(restored, path = %path.display(), "warm-started alert store from snapshot");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(error = %e, path = %path.display(), "failed reading snapshot file"),
        }
        Self {
            alerts,
            len_hint: AtomicU64::new(restored),
            snapshot_path: Some(path),
        }
    }

    fn key_of(alert: &Alert) -> AlertKey {
        AlertKey::new(alert.source_id, alert.identifier.clone())
    }

    /// Appends one NDJSON line per alert to `snapshot_path`, if configured. Best-effort: a
    /// write failure is logged, never propagated — the snapshot is a crash-recovery aid, not
    /// the system of record (spec.md §4.4's `InMemoryAlertStore` is the in-test/swap-in
    /// implementation, not the production store).
    async fn append_snapshot(&self, alerts: &[Alert]) {
        let Some(path) = &self.snapshot_path else { return };
        if alerts.is_empty() {
            return;
        }
        match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
            Ok(mut file) => {
                for alert in alerts {
                    if let Ok(line) = serde_json::to_string(alert) {
                        let _ = file.write_all(line.as_bytes()).await;
                        let _ = file.write_all(b"\n").await;
                    }
                }
            }
            Err(e) => error!(error = %e, path = %path.display(), "failed appending to snapshot file"),
        }
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn find_active(&self) -> Vec<Alert> {
        let mut active: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|e| e.value().active)
            .map(|e| e.value().clone())
            .collect();
        active.sort_by(|a, b| {
            b.max_severity()
                .rank()
                .cmp(&a.max_severity().rank())
                .then(b.sent.cmp(&a.sent))
        });
        active
    }

    async fn find_by_id(&self, key: &AlertKey) -> Option<Alert> {
        self.alerts.get(key).map(|e| e.value().clone())
    }

    async fn find_by_point(&self, point: [f64; 2]) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|e| {
                e.value().active
                    && e.value().info.iter().any(|i| {
                        i.areas
                            .iter()
                            .any(|a| a.geo_json.as_ref().is_some_and(|g| geojson_contains_point(g, point)))
                    })
            })
            .map(|e| e.value().clone())
            .collect()
    }

    async fn find_by_severity(&self, severity: Severity) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|e| e.value().active && e.value().max_severity() as u8 == severity as u8)
            .map(|e| e.value().clone())
            .collect()
    }

    async fn find_by_identifiers(&self, source_id: SourceId, identifiers: &HashSet<Identifier>) -> Vec<Alert> {
        identifiers
            .iter()
            .filter_map(|id| {
                self.alerts
                    .get(&AlertKey::new(source_id, id.clone()))
                    .map(|e| e.value().clone())
            })
            .collect()
    }

    async fn bulk_upsert(&self, alerts: Vec<Alert>) {
        self.append_snapshot(&alerts).await;
        for alert in alerts {
            let key = Self::key_of(&alert);
            self.alerts.insert(key, alert);
        }
    }

    async fn bulk_insert(&self, alerts: Vec<Alert>) -> Vec<AlertKey> {
        let mut inserted = Vec::with_capacity(alerts.len());
        let mut newly_stored = Vec::with_capacity(alerts.len());
        for alert in alerts {
            let key = Self::key_of(&alert);
            // `(sourceId, identifier)` unique index (spec.md §3): refuse to double-insert.
            if self.alerts.contains_key(&key) {
                continue;
            }
            self.alerts.insert(key.clone(), alert.clone());
            self.len_hint.fetch_add(1, Ordering::Relaxed);
            inserted.push(key);
            newly_stored.push(alert);
        }
        self.append_snapshot(&newly_stored).await;
        inserted
    }

    async fn set_geo_json(&self, key: &AlertKey, info_index: usize, area_index: usize, geo_json: crate::geometry::GeoJson) -> bool {
        if let Some(mut entry) = self.alerts.get_mut(key) {
            if let Some(info) = entry.info.get_mut(info_index) {
                if let Some(area) = info.areas.get_mut(area_index) {
                    area.geo_json = Some(geo_json);
                    return true;
                }
            }
        }
        false
    }

    async fn mark_expired(&self, now: DateTime<Utc>, source_id: Option<SourceId>) -> Vec<Alert> {
        let mut transitioned = Vec::new();
        for mut entry in self.alerts.iter_mut() {
            if let Some(sid) = source_id {
                if entry.source_id != sid {
                    continue;
                }
            }
            let should_be_active = entry.compute_active(now);
            if entry.active != should_be_active {
                entry.active = should_be_active;
                entry.updated_at = now;
                if !should_be_active {
                    transitioned.push(entry.value().clone());
                }
            }
        }
        transitioned
    }

    async fn delete_old_inactive(&self, cutoff: DateTime<Utc>) -> u64 {
        let mut deleted = 0u64;
        self.alerts.retain(|_, alert| {
            let latest_expires = alert.info.iter().map(|i| i.expires).max();
            let stale = !alert.active
                && alert.fetched_at < cutoff
                && latest_expires.map_or(true, |e| e < cutoff);
            if stale {
                deleted += 1;
            }
            !stale
        });
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::{Certainty, MessageType, Scope, Status, Urgency};
    use crate::model::{Area, Info};
    use uuid::Uuid;

    fn alert(identifier: &str, expires: DateTime<Utc>, active: bool) -> Alert {
        let now = Utc::now();
        Alert {
            source_id: SourceId(Uuid::new_v4()),
            identifier: identifier.to_string(),
            sender: "sender".into(),
            sent: now,
            status: Status::Actual,
            msg_type: MessageType::Alert,
            scope: Scope::Public,
            code: vec![],
            note: None,
            references: None,
            incidents: None,
            info: vec![Info {
                language: "en-US".into(),
                category: vec![],
                event: "Test".into(),
                response_type: vec![],
                urgency: Urgency::Immediate,
                severity: Severity::Severe,
                certainty: Certainty::Observed,
                effective: now,
                onset: None,
                expires,
                sender_name: "sender".into(),
                headline: None,
                description: None,
                instruction: None,
                web: None,
                contact: None,
                parameter: vec![],
                areas: vec![Area {
                    area_desc: "Zone".into(),
                    polygons: vec![],
                    circles: vec![],
                    geocode: vec![],
                    altitude: None,
                    ceiling: None,
                    geo_json: None,
                }],
            }],
            fetched_at: now,
            active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn bulk_insert_is_idempotent_per_source_and_identifier() {
        let store = InMemoryAlertStore::new();
        let a = alert("A1", Utc::now() + chrono::Duration::hours(1), true);
        let key = AlertKey::new(a.source_id, a.identifier.clone());
        let inserted = store.bulk_insert(vec![a.clone()]).await;
        assert_eq!(inserted, vec![key.clone()]);
        let inserted_again = store.bulk_insert(vec![a]).await;
        assert!(inserted_again.is_empty());
    }

    #[tokio::test]
    async fn mark_expired_flips_active_bit() {
        let store = InMemoryAlertStore::new();
        let past = Utc::now() - chrono::Duration::hours(1);
        let a = alert("A2", past, true);
        let key = AlertKey::new(a.source_id, a.identifier.clone());
        store.bulk_insert(vec![a]).await;
        let transitioned = store.mark_expired(Utc::now(), None).await;
        assert_eq!(transitioned.len(), 1);
        assert_eq!(transitioned[0].identifier, "A2");
        assert!(!store.find_by_id(&key).await.unwrap().active);
    }

    #[tokio::test]
    async fn find_active_never_returns_fully_expired_record() {
        let store = InMemoryAlertStore::new();
        let past = Utc::now() - chrono::Duration::hours(1);
        let future = Utc::now() + chrono::Duration::hours(1);
        store.bulk_insert(vec![alert("EXPIRED", past, false), alert("LIVE", future, true)]).await;
        let active = store.find_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].identifier, "LIVE");
    }

    #[tokio::test]
    async fn delete_old_inactive_respects_retention_cutoff() {
        let store = InMemoryAlertStore::new();
        let mut old = alert("OLD", Utc::now() - chrono::Duration::days(40), false);
        old.fetched_at = Utc::now() - chrono::Duration::days(40);
        store.bulk_insert(vec![old]).await;
        let deleted = store.delete_old_inactive(Utc::now() - chrono::Duration::days(30)).await;
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn warm_starts_from_an_existing_ndjson_snapshot() {
        let path = std::env::temp_dir().join(format!("capcast-store-test-{}.ndjson", Uuid::new_v4()));
        let seed = InMemoryAlertStore::with_snapshot_path(path.clone()).await;
        let a = alert("SNAP1", Utc::now() + chrono::Duration::hours(1), true);
        seed.bulk_insert(vec![a.clone()]).await;
        drop(seed);

        let restored = InMemoryAlertStore::with_snapshot_path(path.clone()).await;
        let key = AlertKey::new(a.source_id, a.identifier.clone());
        assert_eq!(restored.find_by_id(&key).await.unwrap().identifier, "SNAP1");

        tokio::fs::remove_file(&path).await.ok();
    }
}
