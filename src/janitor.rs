//! Janitor (C7). A coarse periodic sweep: repair drift in the `active` bit, then delete
//! long-expired inactive records past the retention horizon.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::broadcaster::EventBroadcaster;
use crate::clock::Clock;
use crate::store::AlertStore;

#[derive(Debug, Default)]
pub struct JanitorStats {
    pub sweeps: AtomicU64,
    pub expired_total: AtomicU64,
    pub deleted_total: AtomicU64,
}

impl JanitorStats {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "sweeps": self.sweeps.load(Ordering::Relaxed),
            "expiredTotal": self.expired_total.load(Ordering::Relaxed),
            "deletedTotal": self.deleted_total.load(Ordering::Relaxed),
        })
    }
}

pub struct Janitor {
    store: Arc<dyn AlertStore>,
    broadcaster: Arc<EventBroadcaster>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    retention: Duration,
    pub stats: Arc<JanitorStats>,
}

impl Janitor {
    pub fn new(
        store: Arc<dyn AlertStore>,
        broadcaster: Arc<EventBroadcaster>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            broadcaster,
            clock,
            interval,
            retention,
            stats: Arc::new(JanitorStats::default()),
        }
    }

    pub async fn sweep_once(&self) {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::days(30));

        let expired = self.store.mark_expired(now, None).await;
        let expired_count = expired.len() as u64;
        for alert in expired {
            self.broadcaster.alert_expire(alert);
        }
        let deleted = self.store.delete_old_inactive(cutoff).await;

        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        self.stats.expired_total.fetch_add(expired_count, Ordering::Relaxed);
        self.stats.deleted_total.fetch_add(deleted, Ordering::Relaxed);

        info!(expired = expired_count, deleted, "janitor sweep complete");
    }

    /// Runs forever on `self.interval`. Spawn this once at startup alongside the scheduler.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tick.tick().await;
            self.sweep_once().await;
        }
    }
}

pub fn default_retention() -> Duration {
    Duration::from_secs(30 * 86_400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{Alert, Area, Info, SourceId};
    use crate::store::InMemoryAlertStore;
    use crate::cap::{Certainty, MessageType, Scope, Severity, Status, Urgency};
    use uuid::Uuid;

    fn alert(identifier: &str, expires: chrono::DateTime<Utc>, active: bool, fetched_at: chrono::DateTime<Utc>) -> Alert {
        let now = fetched_at;
        Alert {
            source_id: SourceId(Uuid::new_v4()),
            identifier: identifier.to_string(),
            sender: "s".into(),
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
                severity: Severity::Minor,
                certainty: Certainty::Observed,
                effective: now,
                onset: None,
                expires,
                sender_name: "s".into(),
                headline: None,
                description: None,
                instruction: None,
                web: None,
                contact: None,
                parameter: vec![],
                areas: vec![Area {
                    area_desc: "Z".into(),
                    polygons: vec![],
                    circles: vec![],
                    geocode: vec![],
                    altitude: None,
                    ceiling: None,
                    geo_json: None,
                }],
            }],
            fetched_at,
            active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn sweep_repairs_active_bit_and_purges_old_inactive() {
        let store: Arc<dyn AlertStore> = Arc::new(InMemoryAlertStore::new());
        let now = Utc::now();
        let long_gone = now - chrono::Duration::days(40);

        store
            .bulk_insert(vec![
                alert("DRIFTED", now - chrono::Duration::hours(1), true, now),
                alert("ANCIENT", long_gone, false, long_gone),
            ])
            .await;

        let clock: Arc<dyn Clock> = Arc::new(FixedClock(now));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let janitor = Janitor::new(
            store.clone(),
            broadcaster,
            clock,
            Duration::from_secs(86_400),
            Duration::from_secs(30 * 86_400),
        );
        janitor.sweep_once().await;

        assert_eq!(janitor.stats.expired_total.load(Ordering::Relaxed), 1);
        assert_eq!(janitor.stats.deleted_total.load(Ordering::Relaxed), 1);
        assert!(store.find_active().await.is_empty());
    }
}
