//! Parsers for the feed formats shared by the file, url and portal-replay sources.
//!
//! Every parser yields `RawRecord`s carrying provenance metadata (`origin`, `format`
//! and the line or row the address came from).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use iprep_core::{parse_timestamp, ListCategory, RawRecord, SourceConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::FetchError;

pub static IPV4_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b")
        .expect("valid ipv4 pattern")
});

pub(crate) const IP_KEYS: &[&str] = &[
    "ip", "ip_address", "ipaddress", "ip_addr", "ipaddr", "address", "addr", "src_ip",
    "source_ip", "indicator", "ioc", "host",
];
pub(crate) const DESCRIPTION_KEYS: &[&str] = &[
    "description", "desc", "comment", "comments", "reason", "memo", "note", "notes",
];
pub(crate) const DATE_KEYS: &[&str] = &[
    "detection_date", "date", "first_seen", "firstseen", "detected", "detected_at",
    "registered", "registered_at", "reported_at", "last_seen", "lastseen", "timestamp",
];
const EXPIRY_KEYS: &[&str] = &["expiry_date", "expiry", "expires", "expires_at", "valid_until"];
pub(crate) const THREAT_KEYS: &[&str] = &["threat_type", "threat", "type", "attack_type", "malware"];
const CONFIDENCE_KEYS: &[&str] = &["confidence", "score", "reliability"];
const LIST_KEYS: &[&str] = &["data", "items", "entries", "results", "records", "ips", "indicators"];

const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// One address per line, `#`/`;` comments.
    Text,
    /// CSV/TSV with or without a header row.
    Delimited,
    /// JSON document or JSON lines.
    Json,
    /// Free-form log lines with embedded IPv4 addresses.
    Log,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Delimited => "delimited",
            Self::Json => "json",
            Self::Log => "log",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" | "plain" | "list" => Some(Self::Text),
            "csv" | "tsv" | "delimited" | "table" => Some(Self::Delimited),
            "json" | "jsonl" | "ndjson" | "structured" => Some(Self::Json),
            "log" => Some(Self::Log),
            _ => None,
        }
    }

    /// Detection from a file path or URL path; query strings are ignored.
    pub fn from_path(path: &str) -> Option<Self> {
        match extension_of(path)?.as_str() {
            "txt" | "list" | "lst" | "netset" | "ipset" => Some(Self::Text),
            "csv" | "tsv" => Some(Self::Delimited),
            "json" | "jsonl" | "ndjson" => Some(Self::Json),
            "log" => Some(Self::Log),
            _ => None,
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "text/csv" | "application/csv" | "text/tab-separated-values" => Some(Self::Delimited),
            "application/json" | "application/x-ndjson" | "application/jsonl" => Some(Self::Json),
            "text/plain" => Some(Self::Text),
            m if m.ends_with("+json") => Some(Self::Json),
            _ => None,
        }
    }

    /// File extension used when storing a captured body in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Delimited => "csv",
            Self::Json => "json",
            Self::Log => "log",
        }
    }
}

fn extension_of(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Delimiter implied by a path: tab for `.tsv`, comma otherwise.
pub fn delimiter_for_path(path: &str) -> u8 {
    if extension_of(path).as_deref() == Some("tsv") {
        b'\t'
    } else {
        b','
    }
}

/// Record-level defaults taken from a source's settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDefaults {
    pub category: ListCategory,
    pub confidence: f64,
    pub threat_type: Option<String>,
}

impl RecordDefaults {
    pub fn from_config(config: &SourceConfig, fallback_confidence: f64) -> Self {
        Self {
            category: config
                .setting_str("category")
                .and_then(ListCategory::parse)
                .unwrap_or_default(),
            confidence: config
                .setting_f64("confidence")
                .map(normalize_confidence)
                .unwrap_or(fallback_confidence),
            threat_type: config.setting_str("threat_type").map(ToString::to_string),
        }
    }
}

/// Where the text came from and how to read it.
#[derive(Debug, Clone)]
pub struct ParseContext<'a> {
    pub source_name: &'a str,
    pub origin: &'a str,
    pub defaults: &'a RecordDefaults,
    pub delimiter: Option<u8>,
    pub ip_field: Option<&'a str>,
}

impl<'a> ParseContext<'a> {
    pub fn new(source_name: &'a str, origin: &'a str, defaults: &'a RecordDefaults) -> Self {
        Self {
            source_name,
            origin,
            defaults,
            delimiter: None,
            ip_field: None,
        }
    }

    fn record(&self, ip: &str, format: DataFormat) -> RawRecord {
        let mut record = RawRecord::new(
            ip.trim(),
            self.source_name,
            self.defaults.category,
            self.defaults.confidence,
        )
        .with_metadata("origin", self.origin)
        .with_metadata("format", format.as_str());
        if let Some(threat) = &self.defaults.threat_type {
            record = record.with_metadata("threat_type", threat.as_str());
        }
        record
    }

    fn is_ip_key(&self, key: &str) -> bool {
        match self.ip_field {
            Some(field) => normalize_key(field) == key,
            None => IP_KEYS.contains(&key),
        }
    }
}

pub fn parse_records(
    format: DataFormat,
    text: &str,
    ctx: &ParseContext<'_>,
) -> Result<Vec<RawRecord>, FetchError> {
    let records = match format {
        DataFormat::Text => parse_text(text, ctx),
        DataFormat::Delimited => parse_delimited(text, ctx)?,
        DataFormat::Json => parse_json(text, ctx)?,
        DataFormat::Log => parse_log(text, ctx),
    };
    debug!(
        source = ctx.source_name,
        origin = ctx.origin,
        format = format.as_str(),
        records = records.len(),
        "parsed feed"
    );
    Ok(records)
}

/// Scores above 1 are read as percentages.
fn normalize_confidence(value: f64) -> f64 {
    if value > 1.0 {
        (value / 100.0).clamp(0.0, 1.0)
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub(crate) fn normalize_key(key: &str) -> String {
    key.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

pub(crate) fn looks_like_ip(value: &str) -> bool {
    let value = value.trim();
    let host = value.split_once('/').map_or(value, |(host, _)| host);
    host.parse::<IpAddr>().is_ok()
}

pub(crate) fn snippet(line: &str) -> String {
    line.chars().take(SNIPPET_CHARS).collect()
}

/// Folds a named field into the record: well-known keys set typed fields,
/// everything else lands in the metadata.
fn apply_field(record: &mut RawRecord, key: &str, value: &JsonValue) {
    let text = match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    };
    let text = text.filter(|s| !s.is_empty());

    if let Some(text) = text.as_deref() {
        if DESCRIPTION_KEYS.contains(&key) {
            record
                .metadata
                .entry("description")
                .or_insert_with(|| JsonValue::String(text.to_string()));
            return;
        }
        if DATE_KEYS.contains(&key) {
            if let Some(ts) = parse_timestamp(text) {
                record.detection_date = ts;
                return;
            }
        }
        if EXPIRY_KEYS.contains(&key) {
            if let Some(ts) = parse_timestamp(text) {
                record.expiry_date = Some(ts);
                return;
            }
        }
        if CONFIDENCE_KEYS.contains(&key) {
            if let Ok(score) = text.parse::<f64>() {
                record.confidence = normalize_confidence(score);
                return;
            }
        }
        if key == "category" {
            match ListCategory::parse(text) {
                Some(category) => record.category = category,
                None => {
                    record
                        .metadata
                        .insert("threat_type".into(), JsonValue::String(text.to_string()));
                }
            }
            return;
        }
        if THREAT_KEYS.contains(&key) {
            record
                .metadata
                .insert("threat_type".into(), JsonValue::String(text.to_string()));
            return;
        }
    }
    if !value.is_null() {
        record.metadata.insert(key.to_string(), value.clone());
    }
}

/// Splits off a trailing `#` or `;` comment.
fn split_comment(line: &str) -> (&str, Option<&str>) {
    match line.find(['#', ';']) {
        Some(idx) => {
            let comment = line[idx + 1..].trim();
            (&line[..idx], (!comment.is_empty()).then_some(comment))
        }
        None => (line, None),
    }
}

fn parse_text(text: &str, ctx: &ParseContext<'_>) -> Vec<RawRecord> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(['#', ';']) || line.starts_with("//") {
            continue;
        }
        let (data, comment) = split_comment(line);
        let Some(token) = data
            .split(|c: char| c.is_whitespace() || c == ',')
            .find(|t| !t.is_empty())
        else {
            continue;
        };
        let mut record = ctx.record(token, DataFormat::Text).with_metadata("line", idx + 1);
        if let Some(comment) = comment {
            record = record.with_metadata("description", comment);
        }
        out.push(record);
    }
    out
}

fn parse_log(text: &str, ctx: &ParseContext<'_>) -> Vec<RawRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut seen: HashMap<String, (usize, usize, String)> = HashMap::new();
    for (idx, line) in text.lines().enumerate() {
        for found in IPV4_PATTERN.find_iter(line) {
            let ip = found.as_str().to_string();
            match seen.get_mut(&ip) {
                Some((_, occurrences, _)) => *occurrences += 1,
                None => {
                    order.push(ip.clone());
                    seen.insert(ip, (idx + 1, 1, snippet(line.trim())));
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|ip| {
            let (line, occurrences, snippet) = seen.remove(&ip)?;
            Some(
                ctx.record(&ip, DataFormat::Log)
                    .with_metadata("line", line)
                    .with_metadata("occurrences", occurrences)
                    .with_metadata("snippet", snippet),
            )
        })
        .collect()
}

fn parse_delimited(text: &str, ctx: &ParseContext<'_>) -> Result<Vec<RawRecord>, FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(ctx.delimiter.unwrap_or(b','))
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row.map_err(|e| FetchError::Parse(format!("row {}: {e}", idx + 1)))?;
        if row.iter().all(str::is_empty) {
            continue;
        }
        rows.push(row);
    }
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };

    let header: Vec<String> = first.iter().map(normalize_key).collect();
    let header_ip_idx = header.iter().position(|key| ctx.is_ip_key(key));
    let has_header = header_ip_idx.is_some() || !first.iter().any(looks_like_ip);
    let data_rows = if has_header { &rows[1..] } else { &rows[..] };

    let mut out = Vec::new();
    for (offset, row) in data_rows.iter().enumerate() {
        let row_no = offset + if has_header { 2 } else { 1 };
        let ip_idx = match header_ip_idx {
            Some(idx) => idx,
            None => match row.iter().position(looks_like_ip) {
                Some(idx) => idx,
                None => continue,
            },
        };
        let Some(ip) = row.get(ip_idx).filter(|s| !s.is_empty()) else {
            continue;
        };
        let mut record = ctx.record(ip, DataFormat::Delimited).with_metadata("row", row_no);
        if header_ip_idx.is_some() {
            for (idx, cell) in row.iter().enumerate() {
                if idx == ip_idx || cell.is_empty() {
                    continue;
                }
                if let Some(key) = header.get(idx).filter(|k| !k.is_empty()) {
                    apply_field(&mut record, key, &JsonValue::String(cell.to_string()));
                }
            }
        } else {
            let rest = row
                .iter()
                .enumerate()
                .filter(|(idx, cell)| *idx != ip_idx && !cell.is_empty())
                .map(|(_, cell)| cell)
                .collect::<Vec<_>>();
            if !rest.is_empty() {
                record = record.with_metadata("description", rest.join(" | "));
            }
        }
        out.push(record);
    }
    Ok(out)
}

fn json_items(value: JsonValue) -> Result<Vec<JsonValue>, FetchError> {
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut obj) => {
            for key in LIST_KEYS {
                if let Some(JsonValue::Array(items)) = obj.remove(*key) {
                    return Ok(items);
                }
            }
            if obj.keys().any(|k| IP_KEYS.contains(&normalize_key(k).as_str())) {
                return Ok(vec![JsonValue::Object(obj)]);
            }
            Err(FetchError::Parse(
                "json document has no record list or ip field".to_string(),
            ))
        }
        other => Err(FetchError::Parse(format!("unexpected json document: {other}"))),
    }
}

fn parse_json(text: &str, ctx: &ParseContext<'_>) -> Result<Vec<RawRecord>, FetchError> {
    let items = match serde_json::from_str::<JsonValue>(text) {
        Ok(value) => json_items(value)?,
        Err(whole_err) => {
            // JSON lines fallback.
            let mut items = Vec::new();
            for (idx, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let item = serde_json::from_str::<JsonValue>(line).map_err(|e| {
                    FetchError::Parse(format!("invalid json ({whole_err}); line {}: {e}", idx + 1))
                })?;
                items.push(item);
            }
            items
        }
    };

    let mut out = Vec::new();
    for (idx, item) in items.into_iter().enumerate() {
        match item {
            JsonValue::String(ip) if !ip.trim().is_empty() => {
                out.push(ctx.record(&ip, DataFormat::Json).with_metadata("item", idx));
            }
            JsonValue::Object(obj) => {
                if let Some(record) = json_object_record(obj, idx, ctx) {
                    out.push(record);
                }
            }
            _ => debug!(source = ctx.source_name, item = idx, "skipping json item without address"),
        }
    }
    Ok(out)
}

fn json_object_record(obj: Map<String, JsonValue>, idx: usize, ctx: &ParseContext<'_>) -> Option<RawRecord> {
    let fields = obj
        .into_iter()
        .map(|(k, v)| (normalize_key(&k), v))
        .collect::<Vec<_>>();
    let ip = fields
        .iter()
        .find(|(k, v)| ctx.is_ip_key(k) && v.as_str().is_some_and(|s| !s.trim().is_empty()))
        .and_then(|(_, v)| v.as_str().map(ToString::to_string))?;

    let mut record = ctx.record(&ip, DataFormat::Json).with_metadata("item", idx);
    for (key, value) in &fields {
        if ctx.is_ip_key(key) {
            continue;
        }
        apply_field(&mut record, key, value);
    }
    Some(record)
}
