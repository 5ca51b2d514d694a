//! Canonical domain records (spec.md §3). Plain data + free functions — no persistence-layer
//! methods hang off these types (SPEC_FULL.md §9 / spec.md §9's "Object identity" note).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cap::{Certainty, MessageType, Scope, Severity, Status, Urgency};
use crate::geometry::GeoJson;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub Uuid);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The publisher-assigned identifier. Unique in practice; scoped by source defensively
/// (spec.md §3: "`identifier` is ... globally unique in practice but scoped by source").
pub type Identifier = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub feed_url: String,
    /// Base URL detail fetches are built against: `detail_base_url + identifier` (spec.md §4.2).
    pub detail_base_url: String,
    pub country: String,
    pub language: String,
    pub active: bool,
    pub default: bool,
    pub fetch_interval_seconds: u32,
    pub total_fetches: u64,
    pub successful_fetches: u64,
    pub failed_fetches: u64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_successful_fetch_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub const MIN_FETCH_INTERVAL_SECONDS: u32 = 30;

impl Source {
    pub fn new(name: impl Into<String>, feed_url: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            id: SourceId(Uuid::new_v4()),
            name: name.into(),
            feed_url: feed_url.into(),
            detail_base_url: String::new(),
            country: country.into(),
            language: "en".to_string(),
            active: true,
            default: false,
            fetch_interval_seconds: 60,
            total_fetches: 0,
            successful_fetches: 0,
            failed_fetches: 0,
            last_fetched_at: None,
            last_successful_fetch_at: None,
            last_error_message: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn needs_fetching(&self, now: DateTime<Utc>) -> bool {
        match self.last_fetched_at {
            None => true,
            Some(last) => {
                (now - last).num_seconds() >= i64::from(self.fetch_interval_seconds)
            }
        }
    }

    pub fn record_fetch_attempt(&mut self, now: DateTime<Utc>, success: bool, error: Option<String>) {
        self.total_fetches += 1;
        self.last_fetched_at = Some(now);
        if success {
            self.successful_fetches += 1;
            self.last_successful_fetch_at = Some(now);
            self.last_error_message = None;
        } else {
            self.failed_fetches += 1;
            self.last_error_message = error;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub area_desc: String,
    #[serde(default)]
    pub polygons: Vec<String>,
    #[serde(default)]
    pub circles: Vec<String>,
    #[serde(default)]
    pub geocode: Vec<(String, String)>,
    pub altitude: Option<f64>,
    pub ceiling: Option<f64>,
    /// Absent until C1 successfully normalizes the raw polygon/circle strings above.
    pub geo_json: Option<GeoJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub language: String,
    #[serde(default)]
    pub category: Vec<String>,
    pub event: String,
    #[serde(default)]
    pub response_type: Vec<String>,
    pub urgency: Urgency,
    pub severity: Severity,
    pub certainty: Certainty,
    pub effective: DateTime<Utc>,
    pub onset: Option<DateTime<Utc>>,
    pub expires: DateTime<Utc>,
    pub sender_name: String,
    pub headline: Option<String>,
    pub description: Option<String>,
    pub instruction: Option<String>,
    pub web: Option<String>,
    pub contact: Option<String>,
    #[serde(default)]
    pub parameter: Vec<(String, String)>,
    pub areas: Vec<Area>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub source_id: SourceId,
    pub identifier: Identifier,
    pub sender: String,
    pub sent: DateTime<Utc>,
    pub status: Status,
    pub msg_type: MessageType,
    pub scope: Scope,
    #[serde(default)]
    pub code: Vec<String>,
    pub note: Option<String>,
    pub references: Option<String>,
    pub incidents: Option<String>,
    pub info: Vec<Info>,
    pub fetched_at: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// spec.md §3: "active ⇔ at least one info.expires > now at the moment of writing".
    pub fn compute_active(&self, now: DateTime<Utc>) -> bool {
        self.info.iter().any(|i| i.expires > now)
    }

    pub fn max_severity(&self) -> Severity {
        self.info
            .iter()
            .map(|i| i.severity)
            .max_by_key(|s| s.rank())
            .unwrap_or(Severity::Unknown)
    }

    /// Clears any pre-computed `geoJson` from every area. spec.md §4.5: the scheduler must
    /// strip incoming geometry before an upsert — it is always recomputed by C1 and written
    /// separately, so a bad pre-computed geometry can never reject the whole batch. Both the
    /// scheduler and the manual-refresh endpoint share this one cleaner (spec.md §9's open
    /// question about two divergent cleaners is resolved by having exactly one).
    pub fn strip_geometry(&mut self) {
        for info in &mut self.info {
            for area in &mut info.areas {
                area.geo_json = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub source_id: SourceId,
    pub identifier: String,
}

impl AlertKey {
    pub fn new(source_id: SourceId, identifier: impl Into<String>) -> Self {
        Self {
            source_id,
            identifier: identifier.into(),
        }
    }
}
