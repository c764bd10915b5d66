//! Validation, deduplication, normalization and enrichment of raw feed records.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, LazyLock};

use chrono::{NaiveDate, Utc};
use iprep_core::{
    parse_timestamp, AddressClass, CleanedEntry, ConfidenceLevel, ListCategory, RegionInfo,
    SourceProfile, ThreatType, TrustTier, UpsertOutcome, ValidationStats, MAX_DESCRIPTION_CHARS,
};
use iprep_storage::EntryStore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern"));
static ENTITY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("entity pattern"));

const DENYLIST: [IpAddr; 6] = [
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
    IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)),
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
    IpAddr::V4(Ipv4Addr::new(224, 0, 0, 0)),
    IpAddr::V4(Ipv4Addr::new(239, 255, 255, 255)),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpRejection {
    #[error("empty address")]
    Empty,
    #[error("unparseable address {0:?}")]
    Unparseable(String),
    #[error("{0} is on the denylist")]
    Denylisted(IpAddr),
    #[error("{0} is not publicly routable ({1})")]
    NonPublic(IpAddr, &'static str),
}

/// Why a single record was dropped from a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error(transparent)]
    Invalid(#[from] IpRejection),
    #[error("duplicate address {0}")]
    Duplicate(String),
    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub high: i32,
    pub medium: i32,
    pub low: i32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            high: 30,
            medium: 20,
            low: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustBonus {
    pub policy: i32,
    pub commercial: i32,
    pub community: i32,
}

impl Default for TrustBonus {
    fn default() -> Self {
        Self {
            policy: 10,
            commercial: 5,
            community: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecencyBonus {
    pub recent_days: i64,
    pub recent_bonus: i32,
    pub fresh_days: i64,
    pub fresh_bonus: i32,
}

impl Default for RecencyBonus {
    fn default() -> Self {
        Self {
            recent_days: 7,
            recent_bonus: 10,
            fresh_days: 30,
            fresh_bonus: 5,
        }
    }
}

/// Risk-score weights and per-source profiles; the `cleaning:` section of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub base_score: i32,
    pub confidence: ConfidenceWeights,
    pub trust: TrustBonus,
    pub recency: RecencyBonus,
    /// Keyed by canonical (upper-case) source name.
    pub source_profiles: BTreeMap<String, SourceProfile>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let profile = |authority: &str, update_frequency: &str, trust_tier| SourceProfile {
            authority: authority.to_string(),
            update_frequency: update_frequency.to_string(),
            trust_tier,
        };
        let source_profiles = BTreeMap::from([
            (
                "OTP_PORTAL".to_string(),
                profile("National CERT threat portal", "daily", TrustTier::Policy),
            ),
            (
                "SESSION_PORTAL".to_string(),
                profile("Partner threat-sharing portal", "daily", TrustTier::Commercial),
            ),
            (
                "SPAMHAUS_DROP".to_string(),
                profile("Spamhaus Project", "12 hours", TrustTier::Commercial),
            ),
        ]);
        Self {
            base_score: 50,
            confidence: ConfidenceWeights::default(),
            trust: TrustBonus::default(),
            recency: RecencyBonus::default(),
            source_profiles,
        }
    }
}

impl ScoringConfig {
    pub fn profile_for(&self, canonical_source: &str) -> SourceProfile {
        self.source_profiles
            .get(canonical_source)
            .cloned()
            .unwrap_or_else(SourceProfile::unknown)
    }

    pub fn risk_score(
        &self,
        confidence: ConfidenceLevel,
        trust_tier: TrustTier,
        age_days: i64,
    ) -> u8 {
        let confidence_weight = match confidence {
            ConfidenceLevel::High => self.confidence.high,
            ConfidenceLevel::Medium => self.confidence.medium,
            ConfidenceLevel::Low => self.confidence.low,
        };
        let trust_bonus = match trust_tier {
            TrustTier::Policy => self.trust.policy,
            TrustTier::Commercial => self.trust.commercial,
            TrustTier::Community => self.trust.community,
        };
        let age_days = age_days.max(0);
        let recency_bonus = if age_days <= self.recency.recent_days {
            self.recency.recent_bonus
        } else if age_days <= self.recency.fresh_days {
            self.recency.fresh_bonus
        } else {
            0
        };
        let total = i64::from(self.base_score)
            + i64::from(confidence_weight)
            + i64::from(trust_bonus)
            + i64::from(recency_bonus);
        total.clamp(0, 100) as u8
    }
}

/// Accepts only publicly routable unicast addresses.
pub fn validate_ip(raw: &str) -> Result<IpAddr, IpRejection> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IpRejection::Empty);
    }
    let addr: IpAddr = trimmed
        .parse()
        .map_err(|_| IpRejection::Unparseable(trimmed.to_string()))?;
    if DENYLIST.contains(&addr) {
        return Err(IpRejection::Denylisted(addr));
    }
    match addr {
        IpAddr::V4(v4) => check_v4(v4).map_err(|why| IpRejection::NonPublic(addr, why))?,
        IpAddr::V6(v6) => {
            check_v6(v6).map_err(|why| IpRejection::NonPublic(addr, why))?;
            if let Some(v4) = embedded_v4(v6) {
                check_v4(v4).map_err(|why| IpRejection::NonPublic(addr, why))?;
            }
        }
    }
    Ok(addr.to_canonical())
}

/// IPv4 address carried inside an IPv6 one: mapped, compatible, NAT64 or 6to4.
fn embedded_v4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let s = addr.segments();
    let tail = Ipv4Addr::new((s[6] >> 8) as u8, s[6] as u8, (s[7] >> 8) as u8, s[7] as u8);
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return Some(mapped);
    }
    if s[..6].iter().all(|seg| *seg == 0) {
        return Some(tail);
    }
    if s[..6] == [0x0064, 0xff9b, 0, 0, 0, 0] {
        return Some(tail);
    }
    if s[0] == 0x2002 {
        return Some(Ipv4Addr::new((s[1] >> 8) as u8, s[1] as u8, (s[2] >> 8) as u8, s[2] as u8));
    }
    None
}

fn check_v4(addr: Ipv4Addr) -> Result<(), &'static str> {
    let [a, b, c, _] = addr.octets();
    if a == 0 {
        return Err("this-network");
    }
    if a >= 224 {
        return Err(if addr.is_multicast() { "multicast" } else { "reserved" });
    }
    if addr.is_loopback() {
        return Err("loopback");
    }
    if addr.is_private() {
        return Err("private");
    }
    if addr.is_link_local() {
        return Err("link-local");
    }
    if addr.is_documentation() {
        return Err("documentation");
    }
    if a == 100 && (64..=127).contains(&b) {
        return Err("shared address space");
    }
    if (a == 192 && b == 0 && c == 0) || (a == 198 && (b == 18 || b == 19)) {
        return Err("reserved");
    }
    Ok(())
}

fn check_v6(addr: Ipv6Addr) -> Result<(), &'static str> {
    let segments = addr.segments();
    if addr.is_unspecified() {
        return Err("unspecified");
    }
    if addr.is_loopback() {
        return Err("loopback");
    }
    if addr.is_multicast() {
        return Err("multicast");
    }
    if segments[0] & 0xfe00 == 0xfc00 {
        return Err("unique local");
    }
    if segments[0] & 0xffc0 == 0xfe80 {
        return Err("link-local");
    }
    if segments[0] == 0x2001 && segments[1] == 0x0db8 {
        return Err("documentation");
    }
    Ok(())
}

/// Canonical text of a validated address: IPv4-mapped folded to IPv4, compressed, lower-case.
pub fn normalize_ip(addr: IpAddr) -> String {
    addr.to_canonical().to_string().to_ascii_lowercase()
}

/// SHA-256 hex of the normalized address.
pub fn entry_hash(normalized_ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_ip.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn canonical_source(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '.' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

fn decode_entity(body: &str) -> Option<String> {
    let decoded = match body {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        _ => {
            let code = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                body.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)?
        }
    };
    Some(decoded.to_string())
}

/// Decodes common entities, strips markup, collapses whitespace and truncates.
///
/// Decoding runs first so escaped markup is removed along with literal tags.
/// Any angle bracket left over is dropped; the result never carries markup.
pub fn clean_description(raw: &str) -> String {
    let decoded = ENTITY_PATTERN.replace_all(raw, |caps: &regex::Captures<'_>| {
        decode_entity(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    });
    let without_tags = TAG_PATTERN.replace_all(&decoded, " ");
    let collapsed = without_tags
        .split(|c: char| c.is_whitespace() || c == '<' || c == '>')
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.chars().take(MAX_DESCRIPTION_CHARS).collect()
}

fn confidence_from_score(score: f64) -> ConfidenceLevel {
    let score = if score > 1.0 { score / 100.0 } else { score };
    if score >= 0.8 {
        ConfidenceLevel::High
    } else if score >= 0.5 {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    }
}

/// Numbers and words collapse onto high/medium/low; anything else is medium.
pub fn normalize_confidence(value: Option<&JsonValue>) -> ConfidenceLevel {
    match value {
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .map(confidence_from_score)
            .unwrap_or(ConfidenceLevel::Medium),
        Some(JsonValue::String(s)) => {
            let word = s.trim().to_ascii_lowercase();
            match word.as_str() {
                "high" | "h" | "critical" | "severe" | "strong" | "confirmed" => ConfidenceLevel::High,
                "medium" | "med" | "m" | "moderate" | "normal" => ConfidenceLevel::Medium,
                "low" | "l" | "weak" | "info" | "suspected" => ConfidenceLevel::Low,
                other => other
                    .parse::<f64>()
                    .map(confidence_from_score)
                    .unwrap_or(ConfidenceLevel::Medium),
            }
        }
        _ => ConfidenceLevel::Medium,
    }
}

const THREAT_SYNONYMS: &[(&str, ThreatType)] = &[
    ("ransomware", ThreatType::Malware),
    ("trojan", ThreatType::Malware),
    ("virus", ThreatType::Malware),
    ("worm", ThreatType::Malware),
    ("phish", ThreatType::Phishing),
    ("spam", ThreatType::Spam),
    ("c&c", ThreatType::Botnet),
    ("c2", ThreatType::Botnet),
    ("command and control", ThreatType::Botnet),
    ("bot", ThreatType::Botnet),
    ("brute", ThreatType::Exploit),
    ("scan", ThreatType::Exploit),
    ("attack", ThreatType::Exploit),
    ("intrusion", ThreatType::Exploit),
];

pub fn normalize_threat(value: Option<&str>) -> ThreatType {
    let Some(value) = value.map(|v| v.trim().to_ascii_lowercase()).filter(|v| !v.is_empty()) else {
        return ThreatType::default();
    };
    if let Some(named) = ThreatType::ALL.iter().find(|t| value.contains(t.as_str())) {
        return *named;
    }
    THREAT_SYNONYMS
        .iter()
        .find(|(needle, _)| value.contains(needle))
        .map(|(_, threat)| *threat)
        .unwrap_or_default()
}

/// Legacy class hint from the leading octet. Not geolocation.
pub fn region_info(addr: IpAddr) -> RegionInfo {
    let v4 = match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    };
    let (address_class, description) = match v4.map(|v4| v4.octets()[0]) {
        Some(1..=126) => (AddressClass::A, "class A range (1-126)"),
        Some(128..=191) => (AddressClass::B, "class B range (128-191)"),
        Some(192..=223) => (AddressClass::C, "class C range (192-223)"),
        Some(_) => (AddressClass::Other, "outside classful unicast ranges"),
        None => (AddressClass::Ipv6, "IPv6 address"),
    };
    RegionInfo {
        address_class,
        description: description.to_string(),
        heuristic: true,
    }
}

fn str_field<'a>(record: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find_map(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Outcome of one `process_batch` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub entries: Vec<CleanedEntry>,
    pub stats: ValidationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upsert: Option<UpsertOutcome>,
}

/// Cleans batches for one source. The dedup set and counters span every batch
/// until `reset_stats`.
pub struct CleaningPipeline {
    source_tag: String,
    scoring: ScoringConfig,
    store: Option<Arc<dyn EntryStore>>,
    seen: HashSet<String>,
    stats: ValidationStats,
}

impl CleaningPipeline {
    pub fn new(source_tag: impl Into<String>, scoring: ScoringConfig) -> Self {
        Self {
            source_tag: source_tag.into(),
            scoring,
            store: None,
            seen: HashSet::new(),
            stats: ValidationStats::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EntryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn get_processing_stats(&self) -> ValidationStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ValidationStats::default();
        self.seen.clear();
    }

    /// Runs one record through validate → dedup → normalize → enrich.
    pub fn process_record(&mut self, record: &JsonValue) -> Result<CleanedEntry, RecordError> {
        let fields = record
            .as_object()
            .ok_or_else(|| RecordError::Malformed(format!("expected a mapping, got {record}")))?;

        let raw_ip = str_field(fields, &["ip", "ip_address"]).unwrap_or_default();
        let addr = validate_ip(raw_ip)?;
        let ip = normalize_ip(addr);
        let entry_hash = entry_hash(&ip);
        if !self.seen.insert(entry_hash.clone()) {
            return Err(RecordError::Duplicate(ip));
        }

        let source = canonical_source(str_field(fields, &["source", "source_name"]).unwrap_or(&self.source_tag));
        let description = str_field(fields, &["description"])
            .map(clean_description)
            .unwrap_or_default();

        let today = Utc::now().date_naive();
        let detected: NaiveDate = str_field(fields, &["detection_date", "date"])
            .and_then(parse_timestamp)
            .map(|ts| ts.date_naive())
            .unwrap_or(today);

        let category_field = str_field(fields, &["category"]);
        let category = category_field.and_then(ListCategory::parse).unwrap_or_default();
        let threat_hint = str_field(fields, &["threat_type"])
            .or_else(|| category_field.filter(|c| ListCategory::parse(c).is_none()));
        let threat_type = normalize_threat(threat_hint);
        let confidence_level = normalize_confidence(fields.get("confidence"));

        let source_profile = self.scoring.profile_for(&source);
        let risk_score = self.scoring.risk_score(
            confidence_level,
            source_profile.trust_tier,
            (today - detected).num_days(),
        );

        Ok(CleanedEntry {
            ip,
            source,
            category,
            detection_date: detected.format("%Y-%m-%d").to_string(),
            description,
            threat_type,
            confidence_level,
            entry_hash,
            risk_score,
            region_info: region_info(addr),
            source_profile,
            processed_at: Utc::now(),
        })
    }

    /// Cleans a batch and, when a store is attached, upserts it under `<SOURCE>_CLEANED`.
    pub async fn process_batch(&mut self, records: &[JsonValue]) -> BatchResult {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            self.stats.total_processed += 1;
            match self.process_record(record) {
                Ok(entry) => {
                    self.stats.valid_ips += 1;
                    self.stats.enriched += 1;
                    entries.push(entry);
                }
                Err(RecordError::Invalid(reason)) => {
                    self.stats.invalid_ips += 1;
                    debug!(source = %self.source_tag, %reason, "record rejected");
                }
                Err(RecordError::Duplicate(ip)) => {
                    self.stats.duplicates += 1;
                    debug!(source = %self.source_tag, %ip, "duplicate record dropped");
                }
                Err(err @ RecordError::Malformed(_)) => {
                    self.stats.errors += 1;
                    warn!(source = %self.source_tag, error = %err, "record dropped");
                }
            }
        }

        let upsert = match (&self.store, entries.is_empty()) {
            (Some(store), false) => {
                let tag = format!("{}_CLEANED", canonical_source(&self.source_tag));
                let outcome = store.bulk_upsert(&entries, &tag).await;
                self.stats.absorb_upsert(&outcome);
                if !outcome.success {
                    warn!(
                        source = %self.source_tag,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "bulk upsert failed"
                    );
                }
                Some(outcome)
            }
            _ => None,
        };

        info!(
            source = %self.source_tag,
            processed = self.stats.total_processed,
            valid = self.stats.valid_ips,
            invalid = self.stats.invalid_ips,
            duplicates = self.stats.duplicates,
            saved = self.stats.saved,
            skipped = self.stats.skipped,
            "batch cleaned"
        );
        BatchResult {
            entries,
            stats: self.stats,
            upsert,
        }
    }
}
