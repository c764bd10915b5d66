//! Core data model shared by the source plugins, the cleaning pipeline and the stores.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "iprep-core";

/// Maximum description length kept on a cleaned entry, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListCategory {
    #[default]
    Blacklist,
    Whitelist,
    Greylist,
}

impl ListCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blacklist => "blacklist",
            Self::Whitelist => "whitelist",
            Self::Greylist => "greylist",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "blacklist" | "blocklist" | "deny" => Some(Self::Blacklist),
            "whitelist" | "allowlist" | "allow" => Some(Self::Whitelist),
            "greylist" | "graylist" | "watch" => Some(Self::Greylist),
            _ => None,
        }
    }
}

/// Record produced by a source plugin before any cleaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub ip_address: String,
    pub source_name: String,
    pub category: ListCategory,
    pub confidence: f64,
    pub detection_date: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl RawRecord {
    /// Builds a record detected now. Confidence is clamped into `[0, 1]`; NaN becomes 0.
    pub fn new(
        ip_address: impl Into<String>,
        source_name: impl Into<String>,
        category: ListCategory,
        confidence: f64,
    ) -> Self {
        Self {
            ip_address: ip_address.into(),
            source_name: source_name.into(),
            category,
            confidence: clamp_confidence(confidence),
            detection_date: Utc::now(),
            expiry_date: None,
            metadata: Map::new(),
        }
    }

    pub fn with_detection_date(mut self, detection_date: DateTime<Utc>) -> Self {
        self.detection_date = detection_date;
        self
    }

    pub fn with_expiry_date(mut self, expiry_date: Option<DateTime<Utc>>) -> Self {
        self.expiry_date = expiry_date;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Loosely-typed mapping consumed by the cleaning pipeline.
    ///
    /// `description` and `threat_type` are lifted out of the metadata when a plugin set them.
    pub fn to_loose(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert("ip".into(), JsonValue::String(self.ip_address.clone()));
        map.insert("source".into(), JsonValue::String(self.source_name.clone()));
        map.insert("category".into(), JsonValue::String(self.category.as_str().into()));
        map.insert("confidence".into(), JsonValue::from(self.confidence));
        map.insert(
            "detection_date".into(),
            JsonValue::String(self.detection_date.to_rfc3339()),
        );
        if let Some(expiry) = self.expiry_date {
            map.insert("expiry_date".into(), JsonValue::String(expiry.to_rfc3339()));
        }
        for key in ["description", "threat_type"] {
            if let Some(value) = self.metadata.get(key) {
                map.insert(key.into(), value.clone());
            }
        }
        map.insert("metadata".into(), JsonValue::Object(self.metadata.clone()));
        JsonValue::Object(map)
    }
}

/// Parses the timestamp shapes feeds commonly emit. Naive values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y.%m.%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    value
        .parse::<i64>()
        .ok()
        .filter(|secs| *secs > 0)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_update_interval() -> u64 {
    3600
}

fn default_priority() -> u32 {
    5
}

fn empty_settings() -> JsonValue {
    JsonValue::Object(Map::new())
}

/// Per-source configuration as stored in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub name: String,
    /// Registry entry to instantiate; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between successful refreshes.
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// 1 is the highest priority.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "empty_settings")]
    pub settings: JsonValue,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin: None,
            enabled: default_enabled(),
            update_interval: default_update_interval(),
            priority: default_priority(),
            settings: empty_settings(),
        }
    }

    pub fn with_settings(mut self, settings: JsonValue) -> Self {
        self.settings = settings;
        self
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.as_deref().unwrap_or(&self.name)
    }

    pub fn setting(&self, key: &str) -> Option<&JsonValue> {
        self.settings.get(key)
    }

    /// Trimmed, non-empty string setting.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.setting(key)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        match self.setting(key)? {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn setting_f64(&self, key: &str) -> Option<f64> {
        match self.setting(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        match self.setting(key)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// String-to-string map setting, e.g. HTTP headers.
    pub fn setting_string_map(&self, key: &str) -> Vec<(String, String)> {
        self.setting(key)
            .and_then(JsonValue::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreatType {
    #[default]
    Blacklist,
    Malware,
    Phishing,
    Spam,
    Botnet,
    Exploit,
}

impl ThreatType {
    pub const ALL: [ThreatType; 6] = [
        ThreatType::Blacklist,
        ThreatType::Malware,
        ThreatType::Phishing,
        ThreatType::Spam,
        ThreatType::Botnet,
        ThreatType::Exploit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blacklist => "blacklist",
            Self::Malware => "malware",
            Self::Phishing => "phishing",
            Self::Spam => "spam",
            Self::Botnet => "botnet",
            Self::Exploit => "exploit",
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    /// National CERTs and regulators.
    Policy,
    Commercial,
    #[default]
    Community,
}

/// Static description of a feed attached during enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub authority: String,
    pub update_frequency: String,
    #[serde(default)]
    pub trust_tier: TrustTier,
}

impl SourceProfile {
    pub fn unknown() -> Self {
        Self {
            authority: "unknown".to_string(),
            update_frequency: "unknown".to_string(),
            trust_tier: TrustTier::Community,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressClass {
    A,
    B,
    C,
    Ipv6,
    Other,
}

/// Coarse legacy address-class hint. Not geolocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub address_class: AddressClass,
    pub description: String,
    pub heuristic: bool,
}

/// Validated, normalized and enriched entry ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedEntry {
    pub ip: String,
    pub source: String,
    pub category: ListCategory,
    /// `YYYY-MM-DD`.
    pub detection_date: String,
    pub description: String,
    pub threat_type: ThreatType,
    pub confidence_level: ConfidenceLevel,
    pub entry_hash: String,
    pub risk_score: u8,
    pub region_info: RegionInfo,
    pub source_profile: SourceProfile,
    pub processed_at: DateTime<Utc>,
}

/// Counters for one cleaning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationStats {
    pub total_processed: usize,
    pub valid_ips: usize,
    pub invalid_ips: usize,
    pub duplicates: usize,
    pub enriched: usize,
    pub saved: usize,
    /// Entries the store already held with identical content.
    #[serde(default)]
    pub skipped: usize,
    pub errors: usize,
}

impl ValidationStats {
    pub fn absorb_upsert(&mut self, outcome: &UpsertOutcome) {
        self.saved += outcome.imported_count;
        self.skipped += outcome.skipped_count;
        self.errors += outcome.error_count;
    }
}

/// Result of one bulk upsert against a persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub success: bool,
    pub imported_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpsertOutcome {
    pub fn failed(error: impl Into<String>, attempted: usize) -> Self {
        Self {
            success: false,
            imported_count: 0,
            skipped_count: 0,
            error_count: attempted,
            error: Some(error.into()),
        }
    }
}
