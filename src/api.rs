//! Query API (C8). Read-side HTTP surface over axum, mirroring the wire table: active list,
//! by-id, by-point, by-severity, stats, manual refresh, source CRUD, and an SSE tail of C6.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::broadcaster::EventBroadcaster;
use crate::cap::Severity;
use crate::error::{CapcastError, Result};
use crate::janitor::Janitor;
use crate::model::{Alert, AlertKey, Source, SourceId};
use crate::parser::CapParser;
use crate::scheduler::Scheduler;
use crate::source::SourceRegistry;
use crate::store::AlertStore;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<dyn AlertStore>,
    pub parser: Arc<CapParser>,
    pub scheduler: Arc<Scheduler>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub janitor: Arc<Janitor>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/cap-alerts/active", get(list_active))
        .route("/cap-alerts/stream", get(stream_events))
        .route("/cap-alerts/stats", get(stats))
        .route("/cap-alerts/fetch", get(trigger_fetch))
        .route("/cap-alerts/refresh", post(refresh))
        .route("/cap-alerts/area/:lat/:lng", get(find_by_point))
        .route("/cap-alerts/severity/:level", get(find_by_severity))
        .route("/cap-alerts/:id", get(get_alert))
        .route("/cap-sources", get(list_sources).post(create_source))
        .route("/cap-sources/seed", post(seed_defaults))
        .route(
            "/cap-sources/:id",
            get(get_source).put(update_source).delete(delete_source),
        )
        .with_state(state)
}

// --- response envelope -------------------------------------------------------------------

/// Wire shape from spec.md §6: `{ success, message?, count?, alerts?|alert?|source(s)?,
/// stats?, error? }`. Constructed with one of the `Envelope::*` entry points per handler.
#[derive(Debug, Serialize)]
pub struct Envelope {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alerts: Option<Vec<Alert>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<Vec<Source>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<serde_json::Value>,
}

impl Envelope {
    fn empty() -> Self {
        Self {
            success: true,
            message: None,
            count: None,
            alerts: None,
            alert: None,
            sources: None,
            source: None,
            stats: None,
        }
    }

    fn alerts(alerts: Vec<Alert>) -> Self {
        Self {
            count: Some(alerts.len()),
            alerts: Some(alerts),
            ..Self::empty()
        }
    }

    fn alert(alert: Alert) -> Self {
        Self {
            alert: Some(alert),
            ..Self::empty()
        }
    }

    fn sources(sources: Vec<Source>) -> Self {
        Self {
            count: Some(sources.len()),
            sources: Some(sources),
            ..Self::empty()
        }
    }

    fn source(source: Source) -> Self {
        Self {
            source: Some(source),
            ..Self::empty()
        }
    }

    fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty()
        }
    }

    fn with_stats(mut self, stats: serde_json::Value) -> Self {
        self.stats = Some(stats);
        self
    }
}

// --- alerts -------------------------------------------------------------------------------

async fn list_active(State(state): State<ApiState>) -> Json<Envelope> {
    Json(Envelope::alerts(state.store.find_active().await))
}

fn parse_alert_id(raw: &str) -> Result<AlertKey> {
    let (source_id, identifier) = raw
        .split_once(':')
        .ok_or_else(|| CapcastError::Validation("alert id must be \"sourceId:identifier\"".into()))?;
    let uuid = Uuid::parse_str(source_id)
        .map_err(|_| CapcastError::Validation(format!("invalid source id: {source_id}")))?;
    Ok(AlertKey::new(SourceId(uuid), identifier.to_string()))
}

async fn get_alert(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<Envelope>> {
    let key = parse_alert_id(&id)?;
    let alert = state
        .store
        .find_by_id(&key)
        .await
        .ok_or_else(|| CapcastError::AlertNotFound(id))?;
    Ok(Json(Envelope::alert(alert)))
}

async fn find_by_point(
    State(state): State<ApiState>,
    Path((lat, lng)): Path<(f64, f64)>,
) -> Result<Json<Envelope>> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(CapcastError::Validation(format!("lat out of range [-90, 90]: {lat}")));
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(CapcastError::Validation(format!("lng out of range [-180, 180]: {lng}")));
    }
    // GeoJSON coordinate order is [lon, lat] (spec.md §6).
    Ok(Json(Envelope::alerts(state.store.find_by_point([lng, lat]).await)))
}

fn parse_severity(raw: &str) -> Result<Severity> {
    match raw {
        "Extreme" => Ok(Severity::Extreme),
        "Severe" => Ok(Severity::Severe),
        "Moderate" => Ok(Severity::Moderate),
        "Minor" => Ok(Severity::Minor),
        "Unknown" => Ok(Severity::Unknown),
        other => Err(CapcastError::Validation(format!("unknown severity level: {other}"))),
    }
}

async fn find_by_severity(State(state): State<ApiState>, Path(level): Path<String>) -> Result<Json<Envelope>> {
    let severity = parse_severity(&level)?;
    Ok(Json(Envelope::alerts(state.store.find_by_severity(severity).await)))
}

async fn stats(State(state): State<ApiState>) -> Json<Envelope> {
    let active = state.store.find_active().await;
    let mut by_severity: HashMap<String, u64> = HashMap::new();
    let mut by_category: HashMap<String, u64> = HashMap::new();
    for alert in &active {
        *by_severity.entry(format!("{:?}", alert.max_severity())).or_default() += 1;
        for info in &alert.info {
            for category in &info.category {
                *by_category.entry(category.clone()).or_default() += 1;
            }
        }
    }

    let snapshot = serde_json::json!({
        "activeAlerts": active.len(),
        "bySeverity": by_severity,
        "byCategory": by_category,
        "sourceCount": state.registry.list().len(),
        "scheduler": state.scheduler.stats.snapshot(),
        "parser": state.parser.stats.snapshot(),
        "janitor": state.janitor.stats.snapshot(),
    });
    Json(Envelope::empty().with_stats(snapshot))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchQuery {
    source_id: Option<Uuid>,
}

/// `GET /cap-alerts/fetch?sourceId=...` — manual trigger via query string.
async fn trigger_fetch(State(state): State<ApiState>, Query(query): Query<FetchQuery>) -> Json<Envelope> {
    let targeted = state.scheduler.manual_refresh(query.source_id.map(SourceId)).await;
    Json(
        Envelope::message(format!("triggered {} fetch cycle(s)", targeted.len()))
            .with_stats(state.scheduler.stats.snapshot()),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    source_id: Option<Uuid>,
}

/// `POST /cap-alerts/refresh` — same contract, body-driven; bypasses `needsFetching` but
/// still runs one cycle per targeted source, atomic per source (spec.md §4.8).
async fn refresh(State(state): State<ApiState>, body: Option<Json<RefreshRequest>>) -> Json<Envelope> {
    let source_id = body.and_then(|Json(b)| b.source_id).map(SourceId);
    let targeted = state.scheduler.manual_refresh(source_id).await;
    Json(
        Envelope::message(format!("refreshed {} source(s)", targeted.len()))
            .with_stats(state.scheduler.stats.snapshot()),
    )
}

/// Server-Sent Events tail of C6, the "subscribed clients" transport for an HTTP-only
/// deployment (SPEC_FULL.md §4.8). WebSocket is a documented alternative, not implemented.
async fn stream_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, BroadcastStreamRecvError>>> {
    let stream = BroadcastStream::new(state.broadcaster.subscribe()).map(|event| {
        let event = event?;
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().data(payload))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- sources ------------------------------------------------------------------------------

async fn list_sources(State(state): State<ApiState>) -> Json<Envelope> {
    Json(Envelope::sources(state.registry.list()))
}

async fn get_source(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Result<Json<Envelope>> {
    let source = state
        .registry
        .get_by_id(SourceId(id))
        .ok_or_else(|| CapcastError::SourceNotFound(id.to_string()))?;
    Ok(Json(Envelope::source(source)))
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

fn default_fetch_interval() -> u32 {
    60
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSourceRequest {
    name: String,
    feed_url: String,
    #[serde(default)]
    detail_base_url: String,
    country: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default)]
    default: bool,
    #[serde(default = "default_fetch_interval")]
    fetch_interval_seconds: u32,
    #[serde(default)]
    metadata: serde_json::Value,
}

async fn create_source(
    State(state): State<ApiState>,
    Json(body): Json<CreateSourceRequest>,
) -> Result<Json<Envelope>> {
    let mut source = Source::new(body.name, body.feed_url, body.country);
    source.detail_base_url = body.detail_base_url;
    source.language = body.language;
    source.active = body.active;
    source.default = body.default;
    source.fetch_interval_seconds = body.fetch_interval_seconds;
    source.metadata = body.metadata;

    let created = state.registry.create(source)?;
    state.scheduler.update_source(created.id);
    state.broadcaster.publish(crate::broadcaster::Event::SourceNew(created.clone()));
    Ok(Json(Envelope::source(created)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSourceRequest {
    name: Option<String>,
    feed_url: Option<String>,
    detail_base_url: Option<String>,
    country: Option<String>,
    language: Option<String>,
    active: Option<bool>,
    default: Option<bool>,
    fetch_interval_seconds: Option<u32>,
    metadata: Option<serde_json::Value>,
}

async fn update_source(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateSourceRequest>,
) -> Result<Json<Envelope>> {
    let updated = state.registry.update(SourceId(id), |s| {
        if let Some(v) = &body.name {
            s.name = v.clone();
        }
        if let Some(v) = &body.feed_url {
            s.feed_url = v.clone();
        }
        if let Some(v) = &body.detail_base_url {
            s.detail_base_url = v.clone();
        }
        if let Some(v) = &body.country {
            s.country = v.clone();
        }
        if let Some(v) = &body.language {
            s.language = v.clone();
        }
        if let Some(v) = body.active {
            s.active = v;
        }
        if let Some(v) = body.default {
            s.default = v;
        }
        if let Some(v) = body.fetch_interval_seconds {
            s.fetch_interval_seconds = v;
        }
        if let Some(v) = &body.metadata {
            s.metadata = v.clone();
        }
    })?;
    state.scheduler.update_source(updated.id);
    state
        .broadcaster
        .publish(crate::broadcaster::Event::SourceUpdate(updated.clone()));
    Ok(Json(Envelope::source(updated)))
}

async fn delete_source(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Result<Json<Envelope>> {
    let source_id = SourceId(id);
    let deleted = state
        .registry
        .get_by_id(source_id)
        .ok_or_else(|| CapcastError::SourceNotFound(id.to_string()))?;
    state.registry.delete(source_id)?;
    state.scheduler.remove_source_interval(source_id);
    state
        .broadcaster
        .publish(crate::broadcaster::Event::SourceDelete(deleted));
    Ok(Json(Envelope::message("source deleted")))
}

async fn seed_defaults(State(state): State<ApiState>) -> Json<Envelope> {
    let count = state.registry.seed_defaults();
    if count > 0 {
        state.scheduler.start();
    }
    Json(Envelope::message(format!("seeded {count} default source(s)")))
}

impl IntoResponse for Envelope {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_id_requires_source_prefix() {
        assert!(parse_alert_id("not-an-id").is_err());
    }

    #[test]
    fn alert_id_rejects_malformed_uuid() {
        assert!(parse_alert_id("not-a-uuid:ABC123").is_err());
    }

    #[test]
    fn alert_id_parses_valid_pair() {
        let uuid = Uuid::new_v4();
        let raw = format!("{uuid}:ABC123");
        let key = parse_alert_id(&raw).unwrap();
        assert_eq!(key.identifier, "ABC123");
        assert_eq!(key.source_id.0, uuid);
    }

    #[test]
    fn severity_parses_known_tokens_only() {
        assert!(parse_severity("Severe").is_ok());
        assert!(parse_severity("severe").is_err());
        assert!(parse_severity("Catastrophic").is_err());
    }
}
