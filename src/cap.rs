//! CAP 1.2 wire types and XML decoding (part of C2, the CAP Parser).
//!
//! The wire shapes here mirror the OASIS CAP v1.2 schema element-for-element (grounded on
//! the reference CAP type crate's `v1dot2::Alert`/`Info`/`Area`), but namespace-qualified
//! element names (`cap:alert`, `cap:info`, ...) are stripped to their local names before
//! deserialization, so a plain, unprefixed `quick_xml`/`serde` struct handles both forms
//! identically, per spec.md §4.2's "XML decoder ... strip namespace prefixes".

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::error::{CapcastError, Result};

// --- CAP enumerations -------------------------------------------------------------------

macro_rules! cap_enum {
    ($name:ident { $($variant:ident),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
        pub enum $name {
            $($variant),+
        }
    };
}

cap_enum!(Status { Actual, Exercise, System, Test, Draft });
cap_enum!(MessageType { Alert, Update, Cancel, Ack, Error });
cap_enum!(Scope { Public, Restricted, Private });
cap_enum!(Urgency { Immediate, Expected, Future, Past, Unknown });
cap_enum!(Severity { Extreme, Severe, Moderate, Minor, Unknown });
cap_enum!(Certainty { Observed, Likely, Possible, Unlikely, Unknown });

impl Severity {
    /// Ordering used by `findActive()`: severity desc (spec.md §4.4).
    pub fn rank(self) -> u8 {
        match self {
            Severity::Extreme => 4,
            Severity::Severe => 3,
            Severity::Moderate => 2,
            Severity::Minor => 1,
            Severity::Unknown => 0,
        }
    }
}

// --- XML-facing structures ---------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ParamPairXml {
    #[serde(rename = "valueName")]
    pub value_name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaXml {
    #[serde(rename = "areaDesc")]
    pub area_desc: String,
    #[serde(default, rename = "polygon")]
    pub polygons: Vec<String>,
    #[serde(default, rename = "circle")]
    pub circles: Vec<String>,
    #[serde(default, rename = "geocode")]
    pub geocodes: Vec<ParamPairXml>,
    pub altitude: Option<f64>,
    pub ceiling: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfoXml {
    pub language: Option<String>,
    #[serde(default, rename = "category")]
    pub categories: Vec<String>,
    pub event: String,
    #[serde(default, rename = "responseType")]
    pub response_types: Vec<String>,
    pub urgency: Urgency,
    pub severity: Severity,
    pub certainty: Certainty,
    pub effective: Option<String>,
    pub onset: Option<String>,
    pub expires: Option<String>,
    #[serde(rename = "senderName")]
    pub sender_name: Option<String>,
    pub headline: Option<String>,
    pub description: Option<String>,
    pub instruction: Option<String>,
    pub web: Option<String>,
    pub contact: Option<String>,
    #[serde(default, rename = "parameter")]
    pub parameters: Vec<ParamPairXml>,
    #[serde(default, rename = "area")]
    pub areas: Vec<AreaXml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "alert")]
pub struct AlertXml {
    pub identifier: String,
    pub sender: String,
    pub sent: String,
    pub status: Status,
    #[serde(rename = "msgType")]
    pub msg_type: MessageType,
    pub scope: Scope,
    #[serde(default, rename = "code")]
    pub codes: Vec<String>,
    pub note: Option<String>,
    pub references: Option<String>,
    pub incidents: Option<String>,
    #[serde(default, rename = "info")]
    pub infos: Vec<InfoXml>,
}

/// CAP timestamps are absolute ISO-8601 instants with an explicit offset (spec.md §4.2:
/// "Parse all timestamps as absolute instants").
pub fn parse_cap_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CapcastError::XmlParse(format!("bad timestamp {raw:?}: {e}")))
}

fn namespace_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(</?)[A-Za-z][\w.-]*:"#).unwrap())
}

/// Strip namespace prefixes (`cap:alert` -> `alert`) from element tags, and drop `xmlns`
/// attributes entirely, so the plain structs above deserialize the same document whether or
/// not the publisher prefixed its elements.
pub fn strip_namespace_prefixes(xml: &str) -> String {
    let without_xmlns_decls =
        Regex::new(r#"\sxmlns(:[A-Za-z0-9]+)?="[^"]*""#).unwrap().replace_all(xml, "");
    namespace_prefix_regex()
        .replace_all(&without_xmlns_decls, "$1")
        .into_owned()
}

/// Decode one CAP `<alert>` document. Whitespace around element text is trimmed by
/// `quick_xml`'s serde integration by default.
pub fn parse_alert_xml(xml: &str) -> Result<AlertXml> {
    let normalized = strip_namespace_prefixes(xml);
    quick_xml::de::from_str(&normalized).map_err(|e| CapcastError::XmlParse(e.to_string()))
}

// --- RSS index ------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RssItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RssChannel {
    #[serde(default, rename = "item")]
    pub items: Vec<RssItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "rss")]
pub struct Rss {
    pub channel: RssChannel,
}

pub fn parse_rss(xml: &str) -> Result<Rss> {
    let normalized = strip_namespace_prefixes(xml);
    quick_xml::de::from_str(&normalized).map_err(|e| CapcastError::XmlParse(e.to_string()))
}

// --- Identifier extraction fallback cascade (spec.md §4.2) ------------------------------

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"identifier=(\d+)").unwrap())
}

fn long_digit_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{16,}").unwrap())
}

/// (a) `identifier=(\d+)` in `link`; (b) pure-digit `guid` or the same regex in `guid`;
/// (c) a long digit run (>=16 digits) anywhere in `title`+`description`. First hit wins.
pub fn extract_identifier(item: &RssItem) -> Option<String> {
    if let Some(link) = &item.link {
        if let Some(caps) = identifier_regex().captures(link) {
            return Some(caps[1].to_string());
        }
    }
    if let Some(guid) = &item.guid {
        if guid.chars().all(|c| c.is_ascii_digit()) && !guid.is_empty() {
            return Some(guid.clone());
        }
        if let Some(caps) = identifier_regex().captures(guid) {
            return Some(caps[1].to_string());
        }
    }
    let combined = format!(
        "{} {}",
        item.title.as_deref().unwrap_or(""),
        item.description.as_deref().unwrap_or("")
    );
    if let Some(m) = long_digit_run_regex().find(&combined) {
        return Some(m.as_str().to_string());
    }
    None
}

/// HTML fallback: extract a `FetchXMLFile?identifier=...` link from a scraped human-facing
/// page (spec.md §6 — NDMA-specific, best-effort per spec.md §9).
fn html_fetch_xml_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"href=["']([^"']*FetchXMLFile[^"']*identifier[^"']*)["']"#).unwrap()
    })
}

fn html_inline_alert_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<alert[^>]*>.*?</alert>").unwrap())
}

pub enum HtmlFallback {
    XmlLink(String),
    InlineAlert(String),
}

pub fn scrape_html_fallback(html: &str) -> Option<HtmlFallback> {
    if let Some(caps) = html_fetch_xml_link_regex().captures(html) {
        return Some(HtmlFallback::XmlLink(caps[1].to_string()));
    }
    if let Some(m) = html_inline_alert_regex().find(html) {
        return Some(HtmlFallback::InlineAlert(m.as_str().to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_namespace_prefixes() {
        let xml = r#"<cap:alert xmlns:cap="urn:oasis:names:tc:emergency:cap:1.2"><cap:identifier>x</cap:identifier></cap:alert>"#;
        let stripped = strip_namespace_prefixes(xml);
        assert!(!stripped.contains("cap:"));
        assert!(stripped.contains("<alert>"));
        assert!(stripped.contains("<identifier>x</identifier>"));
    }

    #[test]
    fn extracts_identifier_from_link() {
        let item = RssItem {
            title: None,
            link: Some("https://example.com/detail?identifier=123456".into()),
            guid: None,
            description: None,
        };
        assert_eq!(extract_identifier(&item).as_deref(), Some("123456"));
    }

    #[test]
    fn extracts_identifier_from_pure_digit_guid() {
        let item = RssItem {
            title: None,
            link: Some("https://example.com/no-id-here".into()),
            guid: Some("9876543210".into()),
            description: None,
        };
        assert_eq!(extract_identifier(&item).as_deref(), Some("9876543210"));
    }

    #[test]
    fn extracts_identifier_from_long_digit_run_in_title() {
        let item = RssItem {
            title: Some("Alert ref 12345678901234567 issued".into()),
            link: None,
            guid: None,
            description: None,
        };
        assert_eq!(
            extract_identifier(&item).as_deref(),
            Some("12345678901234567")
        );
    }

    #[test]
    fn drops_item_with_no_identifier_anywhere() {
        let item = RssItem {
            title: Some("short title".into()),
            link: Some("https://example.com/".into()),
            guid: None,
            description: Some("short description".into()),
        };
        assert!(extract_identifier(&item).is_none());
    }

    #[test]
    fn scrapes_fetch_xml_link() {
        let html = r#"<a href="/FetchXMLFile?identifier=5551234">XML</a>"#;
        match scrape_html_fallback(html) {
            Some(HtmlFallback::XmlLink(url)) => {
                assert!(url.contains("FetchXMLFile"));
            }
            _ => panic!("expected XmlLink"),
        }
    }

    #[test]
    fn scrapes_inline_alert_block() {
        let html = "<html><body><alert><identifier>abc</identifier></alert></body></html>";
        match scrape_html_fallback(html) {
            Some(HtmlFallback::InlineAlert(block)) => {
                assert!(block.starts_with("<alert"));
            }
            _ => panic!("expected InlineAlert"),
        }
    }

    #[test]
    fn parses_minimal_alert_document() {
        let xml = r#"<?xml version="1.0"?>
<alert xmlns="urn:oasis:names:tc:emergency:cap:1.2">
  <identifier>43b080713727</identifier>
  <sender>hsas@dhs.gov</sender>
  <sent>2003-04-02T14:39:01-05:00</sent>
  <status>Actual</status>
  <msgType>Alert</msgType>
  <scope>Public</scope>
  <info>
    <category>Security</category>
    <event>Homeland Security Advisory System Update</event>
    <urgency>Immediate</urgency>
    <severity>Severe</severity>
    <certainty>Likely</certainty>
    <senderName>U.S. Government, Department of Homeland Security</senderName>
    <headline>Homeland Security Sets Code ORANGE</headline>
  </info>
</alert>"#;
        let parsed = parse_alert_xml(xml).unwrap();
        assert_eq!(parsed.identifier, "43b080713727");
        assert_eq!(parsed.infos.len(), 1);
        assert_eq!(parsed.infos[0].event, "Homeland Security Advisory System Update");
    }

    #[test]
    fn parses_prefixed_alert_document_identically() {
        let xml = r#"<?xml version="1.0"?>
<cap:alert xmlns:cap="urn:oasis:names:tc:emergency:cap:1.2">
  <cap:identifier>43b080713727</cap:identifier>
  <cap:sender>hsas@dhs.gov</cap:sender>
  <cap:sent>2003-04-02T14:39:01-05:00</cap:sent>
  <cap:status>Actual</cap:status>
  <cap:msgType>Alert</cap:msgType>
  <cap:scope>Public</cap:scope>
  <cap:info>
    <cap:category>Security</cap:category>
    <cap:event>Homeland Security Advisory System Update</cap:event>
    <cap:urgency>Immediate</cap:urgency>
    <cap:severity>Severe</cap:severity>
    <cap:certainty>Likely</cap:certainty>
  </cap:info>
</cap:alert>"#;
        let parsed = parse_alert_xml(xml).unwrap();
        assert_eq!(parsed.identifier, "43b080713727");
    }
}
