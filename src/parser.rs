//! CAP Parser (C2). Fetches a source's RSS index, resolves each item to a detail XML
//! document (with TTL-cached responses, retries, and HTML fallback), and transforms the
//! result into canonical `model::Alert` records ready for C1/C5.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{instrument, warn};

use crate::cap::{self, AlertXml, HtmlFallback};
use crate::error::{CapcastError, Result};
use crate::model::{Alert, Area, Info, Source};

/// spec.md §4.2: "Limit a single fetchAlerts call to at most 20 RSS items".
const MAX_ITEMS_PER_CYCLE: usize = 20;
/// spec.md §4.2: "pace detail fetches with a 100 ms inter-request delay".
const DETAIL_FETCH_SPACING: Duration = Duration::from_millis(100);
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_BACKOFFS_MS: [u64; 3] = [1_000, 2_000, 4_000];

#[derive(Debug, Default)]
pub struct ParserStats {
    pub requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub html_fallbacks: AtomicU64,
    pub identifiers_missing: AtomicU64,
    pub xml_parse_failures: AtomicU64,
}

impl ParserStats {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": self.requests.load(Ordering::Relaxed),
            "successfulRequests": self.successful_requests.load(Ordering::Relaxed),
            "failedRequests": self.failed_requests.load(Ordering::Relaxed),
            "cacheHits": self.cache_hits.load(Ordering::Relaxed),
            "htmlFallbacks": self.html_fallbacks.load(Ordering::Relaxed),
            "identifiersMissing": self.identifiers_missing.load(Ordering::Relaxed),
            "xmlParseFailures": self.xml_parse_failures.load(Ordering::Relaxed),
        })
    }
}

struct CacheEntry {
    xml: AlertXml,
    cached_at: Instant,
}

pub struct CapParser {
    client: reqwest::Client,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
    pub stats: Arc<ParserStats>,
}

impl CapParser {
    pub fn new(cache_ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("reqwest client with a static config never fails to build");
        Self {
            client,
            cache: DashMap::new(),
            cache_ttl,
            stats: Arc::new(ParserStats::default()),
        }
    }

    /// Issues `GET url`, retrying network errors and 5xx up to 3 times with exponential
    /// backoff (1s, 2s, 4s). 4xx is returned as-is without retrying.
    async fn request_with_retry(&self, url: &str) -> Result<reqwest::Response> {
        let mut last_err = None;
        for (attempt, backoff_ms) in RETRY_BACKOFFS_MS.iter().enumerate() {
            self.stats.requests.fetch_add(1, Ordering::Relaxed);
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(url, status = %resp.status(), attempt, "5xx, retrying");
                    last_err = Some(CapcastError::Transport {
                        url: url.to_string(),
                        source: resp.error_for_status().unwrap_err(),
                    });
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!(url, error = %e, attempt, "transport error, retrying");
                    last_err = Some(CapcastError::Transport {
                        url: url.to_string(),
                        source: e,
                    });
                }
            }
            if attempt < RETRY_BACKOFFS_MS.len() - 1 {
                tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
            }
        }
        Err(last_err.unwrap_or_else(|| CapcastError::Validation(format!("unreachable: {url}"))))
    }

    fn cached(&self, identifier: &str) -> Option<AlertXml> {
        let entry = self.cache.get(identifier)?;
        if entry.cached_at.elapsed() < self.cache_ttl {
            Some(entry.xml.clone())
        } else {
            None
        }
    }

    fn sweep_cache(&self) {
        let ttl = self.cache_ttl;
        self.cache.retain(|_, v| v.cached_at.elapsed() < ttl);
    }

    /// `fetchOneAlert(identifier, baseUrl) -> Alert?` (spec.md §4.2).
    #[instrument(skip(self), fields(identifier))]
    async fn fetch_one_alert(&self, identifier: &str, base_url: &str) -> Option<AlertXml> {
        if let Some(cached) = self.cached(identifier) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Some(cached);
        }

        let url = format!("{base_url}{identifier}");
        let xml = match self.request_with_retry(&url).await {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                match self.html_fallback(&url).await {
                    Some(xml) => xml,
                    None => {
                        self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                }
            }
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(identifier, error = %e, "failed reading response body");
                    self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            },
            Ok(resp) => {
                warn!(identifier, status = %resp.status(), "non-retryable detail fetch failure");
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(identifier, error = %e, "detail fetch failed after retries");
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match cap::parse_alert_xml(&xml) {
            Ok(parsed) => {
                self.stats.successful_requests.fetch_add(1, Ordering::Relaxed);
                self.cache.insert(
                    identifier.to_string(),
                    CacheEntry {
                        xml: parsed.clone(),
                        cached_at: Instant::now(),
                    },
                );
                self.sweep_cache();
                Some(parsed)
            }
            Err(e) => {
                warn!(identifier, error = %e, "xml parse failed");
                self.stats.xml_parse_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn html_fallback(&self, detail_url: &str) -> Option<String> {
        let resp = self.client.get(detail_url).send().await.ok()?;
        let html = resp.text().await.ok()?;
        match cap::scrape_html_fallback(&html) {
            Some(HtmlFallback::XmlLink(link)) => {
                self.stats.html_fallbacks.fetch_add(1, Ordering::Relaxed);
                let resolved = resolve_relative(detail_url, &link);
                let xml_resp = self.client.get(&resolved).send().await.ok()?;
                xml_resp.text().await.ok()
            }
            Some(HtmlFallback::InlineAlert(block)) => {
                self.stats.html_fallbacks.fetch_add(1, Ordering::Relaxed);
                Some(block)
            }
            None => None,
        }
    }

    /// `fetchAlerts(source) -> list<Alert>` (spec.md §4.2). Takes `self` behind an `Arc` so
    /// each detail fetch can be handed to its own `tokio::spawn`ed task — pacing the spacing
    /// between task *starts*, not between future *constructions* (spec.md §4.2/§5: "pace
    /// detail fetches with a 100 ms inter-request delay").
    #[instrument(skip(self, source), fields(source = %source.name))]
    pub async fn fetch_alerts(self: Arc<Self>, source: &Source) -> Result<Vec<Alert>> {
        let resp = self.request_with_retry(&source.feed_url).await?;
        let body = resp
            .text()
            .await
            .map_err(|e| CapcastError::Transport {
                url: source.feed_url.clone(),
                source: e,
            })?;
        let rss = cap::parse_rss(&body)?;

        let identifiers: Vec<String> = rss
            .channel
            .items
            .into_iter()
            .take(MAX_ITEMS_PER_CYCLE)
            .filter_map(|item| {
                let id = cap::extract_identifier(&item);
                if id.is_none() {
                    self.stats.identifiers_missing.fetch_add(1, Ordering::Relaxed);
                    warn!(title = item.title.as_deref().unwrap_or(""), "dropping item with no identifier");
                }
                id
            })
            .collect();

        let mut handles = Vec::with_capacity(identifiers.len());
        for (i, identifier) in identifiers.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(DETAIL_FETCH_SPACING).await;
            }
            let parser = Arc::clone(&self);
            let base_url = source.detail_base_url.clone();
            handles.push(tokio::spawn(async move {
                parser.fetch_one_alert(&identifier, &base_url).await
            }));
        }
        let results = futures::future::join_all(handles).await;

        let now = Utc::now();
        let alerts = results
            .into_iter()
            // A task that panicked is treated like any other single-item failure: dropped,
            // does not fail the batch (spec.md §4.2's "failures of individual items do not
            // fail the batch").
            .filter_map(|r| r.ok().flatten())
            .map(|xml| transform(source.id, xml, now))
            .collect();
        Ok(alerts)
    }
}

/// Resolve a possibly-relative URL found while scraping an HTML fallback page against the
/// page it was scraped from.
fn resolve_relative(base: &str, maybe_relative: &str) -> String {
    match url::Url::parse(base).and_then(|b| b.join(maybe_relative)) {
        Ok(joined) => joined.to_string(),
        Err(_) => maybe_relative.to_string(),
    }
}

/// Transformation step of C2: coerce CAP XML into the canonical `Alert` shape. Timestamps
/// become absolute instants, `senderName` is defaulted, raw polygon/circle strings are
/// preserved verbatim for C1. `geoJson` is intentionally left absent here — C1 computes it,
/// and only after a record has actually been persisted (spec.md §4.5 step 5).
fn transform(source_id: crate::model::SourceId, xml: AlertXml, fetched_at: chrono::DateTime<Utc>) -> Alert {
    let sent = cap::parse_cap_timestamp(&xml.sent).unwrap_or(fetched_at);
    let info = xml
        .infos
        .into_iter()
        .map(|i| {
            let effective = i
                .effective
                .as_deref()
                .and_then(|s| cap::parse_cap_timestamp(s).ok())
                .unwrap_or(sent);
            let onset = i.onset.as_deref().and_then(|s| cap::parse_cap_timestamp(s).ok());
            let expires = i
                .expires
                .as_deref()
                .and_then(|s| cap::parse_cap_timestamp(s).ok())
                .unwrap_or(effective);
            Info {
                language: i.language.unwrap_or_else(|| "en-US".to_string()),
                category: i.categories,
                event: i.event,
                response_type: i.response_types,
                urgency: i.urgency,
                severity: i.severity,
                certainty: i.certainty,
                effective,
                onset,
                expires,
                sender_name: i.sender_name.unwrap_or_else(|| xml.sender.clone()),
                headline: i.headline,
                description: i.description,
                instruction: i.instruction,
                web: i.web,
                contact: i.contact,
                parameter: i.parameters.into_iter().map(|p| (p.value_name, p.value)).collect(),
                areas: i
                    .areas
                    .into_iter()
                    .map(|a| Area {
                        area_desc: a.area_desc,
                        polygons: a.polygons,
                        circles: a.circles,
                        geocode: a.geocodes.into_iter().map(|g| (g.value_name, g.value)).collect(),
                        altitude: a.altitude,
                        ceiling: a.ceiling,
                        geo_json: None,
                    })
                    .collect(),
            }
        })
        .collect();

    Alert {
        source_id,
        identifier: xml.identifier,
        sender: xml.sender,
        sent,
        status: xml.status,
        msg_type: xml.msg_type,
        scope: xml.scope,
        code: xml.codes,
        note: xml.note,
        references: xml.references,
        incidents: xml.incidents,
        info,
        fetched_at,
        active: false, // computed by the writer just before persistence (spec.md §4.5)
        created_at: fetched_at,
        updated_at: fetched_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceId;
    use uuid::Uuid;

    #[test]
    fn transform_defaults_sender_name_and_preserves_raw_geometry_strings() {
        let xml = AlertXml {
            identifier: "X1".into(),
            sender: "agency@example.org".into(),
            sent: "2024-01-01T00:00:00Z".into(),
            status: cap::Status::Actual,
            msg_type: cap::MessageType::Alert,
            scope: cap::Scope::Public,
            codes: vec![],
            note: None,
            references: None,
            incidents: None,
            infos: vec![cap::InfoXml {
                language: None,
                categories: vec![],
                event: "Flood".into(),
                response_types: vec![],
                urgency: cap::Urgency::Immediate,
                severity: cap::Severity::Severe,
                certainty: cap::Certainty::Likely,
                effective: None,
                onset: None,
                expires: Some("2024-01-01T06:00:00Z".into()),
                sender_name: None,
                headline: None,
                description: None,
                instruction: None,
                web: None,
                contact: None,
                parameters: vec![],
                areas: vec![cap::AreaXml {
                    area_desc: "Zone 1".into(),
                    polygons: vec!["10,20 10,30 20,30 20,20".into()],
                    circles: vec![],
                    geocodes: vec![],
                    altitude: None,
                    ceiling: None,
                }],
            }],
        };
        let source_id = SourceId(Uuid::new_v4());
        let alert = transform(source_id, xml, Utc::now());
        assert_eq!(alert.info[0].sender_name, "agency@example.org");
        assert_eq!(alert.info[0].areas[0].polygons[0], "10,20 10,30 20,30 20,20");
        assert!(alert.info[0].areas[0].geo_json.is_none());
    }
}
