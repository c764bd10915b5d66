use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use iprep_core::{parse_timestamp, RawRecord, SourceConfig};
use iprep_storage::{FetchOptions, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::formats::{
    looks_like_ip, normalize_key, snippet, RecordDefaults, DATE_KEYS, DESCRIPTION_KEYS,
    IPV4_PATTERN, IP_KEYS, THREAT_KEYS,
};
use crate::plugin::{credential, SourceCore, SourceMetadata, SourcePlugin};
use crate::FetchError;

const DEFAULT_CONFIDENCE: f64 = 0.8;
const DEFAULT_MAX_PAGES: u32 = 10;

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").expect("table selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("row selector"));
static HEADER_CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").expect("th selector"));
static DATA_CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("td selector"));
static PASSWORD_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("input[type=password]").expect("password selector"));
static OTP_INPUT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        "input[autocomplete=one-time-code], input[name*=otp], input[name*=passcode], input[name*=mfa]",
    )
    .expect("otp selector")
});

/// Which parser produced the rows of a portal page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// A table whose header names an address column.
    Structured,
    /// Any table row with an IP-shaped cell.
    HeuristicTable,
    /// Address pattern scan over the page text.
    TextScan,
}

impl ExtractionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::HeuristicTable => "heuristic_table",
            Self::TextScan => "text_scan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRow {
    pub ip: String,
    pub description: Option<String>,
    pub detected: Option<String>,
    pub threat: Option<String>,
}

impl PortalRow {
    fn bare(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            description: None,
            detected: None,
            threat: None,
        }
    }
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn host_part(value: &str) -> &str {
    value.split_once('/').map_or(value, |(host, _)| host).trim()
}

fn header_row(table: ElementRef<'_>) -> Option<Vec<String>> {
    table
        .select(&ROW)
        .map(|row| row.select(&HEADER_CELL).map(cell_text).collect::<Vec<_>>())
        .find(|cells| !cells.is_empty())
        .map(|cells| cells.iter().map(|c| normalize_key(c)).collect())
}

fn column_of(header: &[String], keys: &[&str]) -> Option<usize> {
    header.iter().position(|h| keys.contains(&h.as_str()))
}

fn structured_rows(document: &Html) -> Vec<PortalRow> {
    let mut out = Vec::new();
    for table in document.select(&TABLE) {
        let Some(header) = header_row(table) else {
            continue;
        };
        let Some(ip_idx) = column_of(&header, IP_KEYS) else {
            continue;
        };
        let description_idx = column_of(&header, DESCRIPTION_KEYS);
        let date_idx = column_of(&header, DATE_KEYS);
        let threat_idx = column_of(&header, THREAT_KEYS);

        for row in table.select(&ROW) {
            let cells = row.select(&DATA_CELL).map(cell_text).collect::<Vec<_>>();
            let Some(ip) = cells.get(ip_idx).map(|c| host_part(c)).filter(|c| looks_like_ip(c)) else {
                continue;
            };
            let pick = |idx: Option<usize>| {
                idx.and_then(|i| cells.get(i))
                    .filter(|c| !c.is_empty())
                    .cloned()
            };
            out.push(PortalRow {
                ip: ip.to_string(),
                description: pick(description_idx),
                detected: pick(date_idx),
                threat: pick(threat_idx),
            });
        }
    }
    out
}

fn heuristic_rows(document: &Html) -> Vec<PortalRow> {
    let mut out = Vec::new();
    for row in document.select(&ROW) {
        let cells = row.select(&DATA_CELL).map(cell_text).collect::<Vec<_>>();
        let Some(ip_idx) = cells.iter().position(|c| looks_like_ip(host_part(c))) else {
            continue;
        };
        let others = cells
            .iter()
            .enumerate()
            .filter(|(idx, cell)| *idx != ip_idx && !cell.is_empty())
            .map(|(_, cell)| cell.as_str())
            .collect::<Vec<_>>();
        let detected = others
            .iter()
            .find(|c| parse_timestamp(c).is_some())
            .map(|c| c.to_string());
        let description = others
            .iter()
            .filter(|c| Some(**c) != detected.as_deref())
            .copied()
            .collect::<Vec<_>>();
        out.push(PortalRow {
            ip: host_part(&cells[ip_idx]).to_string(),
            description: (!description.is_empty()).then(|| description.join(" | ")),
            detected,
            threat: None,
        });
    }
    out
}

fn text_scan_rows(document: &Html) -> Vec<PortalRow> {
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    let mut seen = HashSet::new();
    IPV4_PATTERN
        .find_iter(&text)
        .filter(|m| seen.insert(m.as_str().to_string()))
        .map(|m| PortalRow::bare(m.as_str()))
        .collect()
}

/// Extracts address rows from one portal page, trying each strategy in turn.
pub fn extract_portal_rows(html: &str) -> (ExtractionStrategy, Vec<PortalRow>) {
    let document = Html::parse_document(html);
    let structured = structured_rows(&document);
    if !structured.is_empty() {
        return (ExtractionStrategy::Structured, structured);
    }
    let heuristic = heuristic_rows(&document);
    if !heuristic.is_empty() {
        return (ExtractionStrategy::HeuristicTable, heuristic);
    }
    (ExtractionStrategy::TextScan, text_scan_rows(&document))
}

/// A response still showing a password field means the login did not take.
fn login_rejected(html: &str) -> bool {
    Html::parse_document(html).select(&PASSWORD_INPUT).next().is_some()
}

/// The portal answered the login with a one-time passcode prompt.
fn otp_challenge(html: &str) -> bool {
    Html::parse_document(html).select(&OTP_INPUT).next().is_some()
}

/// `username`/`password` credentials plus any `login_form` extras, under the
/// configured field names.
pub(crate) fn login_form(config: &SourceConfig) -> Result<Vec<(String, String)>, FetchError> {
    let username = credential(config, "username")
        .ok_or_else(|| FetchError::Settings("missing username".to_string()))?;
    let password = credential(config, "password")
        .ok_or_else(|| FetchError::Settings("missing password".to_string()))?;
    let mut form = config.setting_string_map("login_form");
    form.push((
        config.setting_str("username_field").unwrap_or("username").to_string(),
        username.to_string(),
    ));
    form.push((
        config.setting_str("password_field").unwrap_or("password").to_string(),
        password.to_string(),
    ));
    Ok(form)
}

/// Posts the login form on a cookie-carrying session. A passcode prompt or an
/// echoed login page is an authentication failure.
pub(crate) async fn form_login(
    session: &HttpFetcher,
    source: &str,
    login_url: &Url,
    form: &[(String, String)],
    options: &FetchOptions,
) -> Result<(), FetchError> {
    let reply = session.post_form(source, login_url.as_str(), form, options).await?;
    let body = reply.text();
    if otp_challenge(&body) {
        return Err(FetchError::Auth(format!(
            "one-time passcode requested by {}",
            reply.final_url
        )));
    }
    if login_rejected(&body) {
        return Err(FetchError::Auth(format!("login rejected by {}", reply.final_url)));
    }
    info!(source, "portal login accepted");
    Ok(())
}

#[derive(Debug, Clone)]
struct PortalSettings {
    login_url: Url,
    list_url: Url,
    form: Vec<(String, String)>,
    page_param: String,
    max_pages: u32,
}

/// Portal requiring a form login; blacklist pages are scraped with a
/// cookie-carrying session.
///
/// Settings: `base_url`, `username`, `password` (required), `login_path`,
/// `list_path`, `username_field`, `password_field`, `login_form` (extra
/// fields), `page_param`, `max_pages`, `timeout`, `headers`.
#[derive(Debug)]
pub struct SessionPortalSource {
    core: SourceCore,
    http: HttpFetcher,
}

impl SessionPortalSource {
    pub const PLUGIN: &'static str = "session_portal";

    pub fn new(config: SourceConfig, http: HttpFetcher) -> Self {
        Self {
            core: SourceCore::new(config),
            http,
        }
    }

    fn settings(&self) -> Result<PortalSettings, FetchError> {
        let config = self.core.config();
        let base = config
            .setting_str("base_url")
            .and_then(|raw| Url::parse(raw).ok())
            .ok_or_else(|| FetchError::Settings("missing or invalid base_url".to_string()))?;
        let form = login_form(config)?;
        let join = |key: &str, default: &str| {
            let path = config.setting_str(key).unwrap_or(default);
            base.join(path)
                .map_err(|e| FetchError::Settings(format!("{key}: {e}")))
        };

        Ok(PortalSettings {
            login_url: join("login_path", "/login")?,
            list_url: join("list_path", "/blacklist")?,
            form,
            page_param: config.setting_str("page_param").unwrap_or("page").to_string(),
            max_pages: config
                .setting_u64("max_pages")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MAX_PAGES),
        })
    }

    fn fetch_options(&self) -> FetchOptions {
        let config = self.core.config();
        FetchOptions {
            headers: config.setting_string_map("headers"),
            timeout: config
                .setting_u64("timeout")
                .filter(|secs| *secs > 0)
                .map(std::time::Duration::from_secs),
        }
    }

    fn to_record(
        &self,
        row: PortalRow,
        strategy: ExtractionStrategy,
        page: u32,
        origin: &str,
        defaults: &RecordDefaults,
    ) -> RawRecord {
        let mut record = RawRecord::new(row.ip, self.core.name(), defaults.category, defaults.confidence)
            .with_metadata("origin", origin)
            .with_metadata("format", "html")
            .with_metadata("extraction", strategy.as_str())
            .with_metadata("page", page);
        if let Some(detected) = row.detected.as_deref().and_then(parse_timestamp) {
            record.detection_date = detected;
        }
        if let Some(description) = row.description {
            record = record.with_metadata("description", snippet(&description));
        }
        if let Some(threat) = row.threat.or_else(|| defaults.threat_type.clone()) {
            record = record.with_metadata("threat_type", threat);
        }
        record
    }
}

/// Appends rows not seen on earlier pages. Returns how many were new.
fn merge_page(seen: &mut HashSet<String>, rows: Vec<PortalRow>, out: &mut Vec<PortalRow>) -> usize {
    let before = out.len();
    out.extend(rows.into_iter().filter(|row| seen.insert(row.ip.clone())));
    out.len() - before
}

#[async_trait]
impl SourcePlugin for SessionPortalSource {
    fn source_name(&self) -> &'static str {
        Self::PLUGIN
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            plugin: Self::PLUGIN,
            description: "Blacklist scraped from a portal behind a form login",
            requires_credentials: true,
        }
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn validate_config(&self) -> bool {
        self.settings().is_ok()
    }

    async fn fetch_data(&self) -> Result<Vec<RawRecord>, FetchError> {
        let settings = self.settings()?;
        let name = self.core.name();
        let options = self.fetch_options();
        let session = self.http.session()?;
        form_login(&session, name, &settings.login_url, &settings.form, &options).await?;

        let defaults = RecordDefaults::from_config(self.core.config(), DEFAULT_CONFIDENCE);
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for page in 1..=settings.max_pages {
            let mut url = settings.list_url.clone();
            url.query_pairs_mut()
                .append_pair(&settings.page_param, &page.to_string());
            let body = session.get(name, url.as_str(), &options).await?.text();

            let (strategy, rows) = extract_portal_rows(&body);
            let mut fresh = Vec::new();
            let added = merge_page(&mut seen, rows, &mut fresh);
            debug!(source = name, page, added, strategy = strategy.as_str(), "portal page parsed");
            if added == 0 {
                break;
            }
            records.extend(
                fresh
                    .into_iter()
                    .map(|row| self.to_record(row, strategy, page, url.as_str(), &defaults)),
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{quiet_fetcher, serve};
    use axum::extract::{Form, Query, State};
    use axum::http::{header, HeaderMap};
    use axum::response::{Html, IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::Router;
    use iprep_storage::HttpClientConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn source(settings: serde_json::Value) -> SessionPortalSource {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        SessionPortalSource::new(SourceConfig::new("portal").with_settings(settings), http)
    }

    #[test]
    fn credentials_are_required_and_must_be_resolved() {
        assert!(!source(json!({})).validate_config());
        assert!(!source(json!({
            "base_url": "https://portal.example.net",
            "username": "${PORTAL_USER}",
            "password": "secret"
        }))
        .validate_config());
        assert!(!source(json!({
            "base_url": "https://portal.example.net",
            "username": "analyst",
            "password": ""
        }))
        .validate_config());
        assert!(source(json!({
            "base_url": "https://portal.example.net",
            "username": "analyst",
            "password": "secret"
        }))
        .validate_config());
    }

    #[test]
    fn settings_resolve_paths_and_form_fields() {
        let settings = source(json!({
            "base_url": "https://portal.example.net/app/",
            "username": "analyst",
            "password": "secret",
            "list_path": "reports/ips",
            "username_field": "user_id",
            "login_form": {"csrf": "abc"},
            "max_pages": "3"
        }))
        .settings()
        .expect("settings");
        assert_eq!(settings.login_url.as_str(), "https://portal.example.net/login");
        assert_eq!(settings.list_url.as_str(), "https://portal.example.net/app/reports/ips");
        assert_eq!(settings.max_pages, 3);
        assert!(settings.form.contains(&("user_id".to_string(), "analyst".to_string())));
        assert!(settings.form.contains(&("csrf".to_string(), "abc".to_string())));
    }

    #[test]
    fn structured_table_maps_named_columns() {
        let html = r#"<table>
            <tr><th>No</th><th>IP Address</th><th>Reason</th><th>Registered</th><th>Type</th></tr>
            <tr><td>1</td><td>45.9.8.7</td><td>SSH   brute force</td><td>2026-02-01</td><td>exploit</td></tr>
            <tr><td>2</td><td>61.2.3.4/32</td><td></td><td>2026-02-02</td><td>spam</td></tr>
        </table>"#;
        let (strategy, rows) = extract_portal_rows(html);
        assert_eq!(strategy, ExtractionStrategy::Structured);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ip, "45.9.8.7");
        assert_eq!(rows[0].description.as_deref(), Some("SSH brute force"));
        assert_eq!(rows[0].detected.as_deref(), Some("2026-02-01"));
        assert_eq!(rows[0].threat.as_deref(), Some("exploit"));
        assert_eq!(rows[1].ip, "61.2.3.4");
        assert_eq!(rows[1].description, None);
    }

    #[test]
    fn unlabelled_table_falls_back_to_heuristic_scan() {
        let html = r#"<table>
            <tr><td>2026-01-09</td><td>77.1.2.3</td><td>botnet c2</td></tr>
            <tr><td>total</td><td>1</td></tr>
        </table>"#;
        let (strategy, rows) = extract_portal_rows(html);
        assert_eq!(strategy, ExtractionStrategy::HeuristicTable);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].detected.as_deref(), Some("2026-01-09"));
        assert_eq!(rows[0].description.as_deref(), Some("botnet c2"));
    }

    #[test]
    fn plain_page_falls_back_to_text_scan() {
        let html = "<div><p>Blocked: 88.1.1.1, 88.2.2.2 and again 88.1.1.1</p></div>";
        let (strategy, rows) = extract_portal_rows(html);
        assert_eq!(strategy, ExtractionStrategy::TextScan);
        assert_eq!(
            rows.iter().map(|r| r.ip.as_str()).collect::<Vec<_>>(),
            vec!["88.1.1.1", "88.2.2.2"]
        );
    }

    #[test]
    fn login_page_echo_is_detected() {
        assert!(login_rejected(r#"<form><input type="password" name="pw"></form>"#));
        assert!(!login_rejected("<table><tr><td>1.2.3.4</td></tr></table>"));
        assert!(otp_challenge(r#"<form><input name="otp_code" inputmode="numeric"></form>"#));
        assert!(otp_challenge(r#"<input type="text" autocomplete="one-time-code">"#));
        assert!(!otp_challenge(r#"<form><input type="password" name="pw"></form>"#));
    }

    fn portal_page(rows: &[&str]) -> String {
        let body = rows
            .iter()
            .map(|ip| format!("<tr><td>{ip}</td><td>scanner</td></tr>"))
            .collect::<String>();
        format!("<table><tr><th>IP</th><th>Reason</th></tr>{body}</table>")
    }

    async fn portal_login(Form(form): Form<HashMap<String, String>>) -> Response {
        if form.get("password").map(String::as_str) == Some("secret") {
            ([(header::SET_COOKIE, "sid=granted; Path=/")], Html("<p>welcome</p>")).into_response()
        } else {
            Html(r#"<form><input name="username"><input type="password" name="password"></form>"#)
                .into_response()
        }
    }

    async fn portal_list(
        State(requested): State<Arc<Mutex<Vec<String>>>>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Html<String> {
        let page = query.get("page").cloned().unwrap_or_default();
        requested.lock().push(page.clone());
        let signed_in = headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("sid=granted"));
        if !signed_in {
            return Html(String::from("<p>please sign in</p>"));
        }
        Html(match page.as_str() {
            "1" => portal_page(&["45.9.8.7", "61.2.3.4"]),
            "2" => portal_page(&["61.2.3.4", "77.1.2.3"]),
            _ => portal_page(&["77.1.2.3"]),
        })
    }

    async fn portal() -> (String, Arc<Mutex<Vec<String>>>) {
        let requested = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route("/login", post(portal_login))
            .route("/blacklist", get(portal_list))
            .with_state(requested.clone());
        (serve(router).await, requested)
    }

    #[tokio::test]
    async fn logs_in_and_pages_until_nothing_new() {
        let (base_url, requested) = portal().await;
        let source = SessionPortalSource::new(
            SourceConfig::new("portal").with_settings(json!({
                "base_url": base_url,
                "username": "analyst",
                "password": "secret"
            })),
            quiet_fetcher(),
        );

        let records = source.fetch_data().await.expect("fetch");
        assert_eq!(
            records.iter().map(|r| r.ip_address.as_str()).collect::<Vec<_>>(),
            vec!["45.9.8.7", "61.2.3.4", "77.1.2.3"]
        );
        assert_eq!(records[0].metadata["page"], 1);
        assert_eq!(records[2].metadata["page"], 2);
        assert_eq!(records[0].metadata["extraction"], "structured");
        assert_eq!(*requested.lock(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn rejected_login_is_an_auth_failure() {
        let (base_url, requested) = portal().await;
        let source = SessionPortalSource::new(
            SourceConfig::new("portal").with_settings(json!({
                "base_url": base_url,
                "username": "analyst",
                "password": "wrong"
            })),
            quiet_fetcher(),
        );

        let err = source.fetch_data().await.unwrap_err();
        assert!(matches!(err, FetchError::Auth(ref msg) if msg.starts_with("login rejected")));
        assert!(requested.lock().is_empty());
    }

    #[test]
    fn pagination_stops_when_a_page_adds_nothing() {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let page1 = vec![PortalRow::bare("1.1.1.1"), PortalRow::bare("2.2.2.2")];
        let page2 = vec![PortalRow::bare("2.2.2.2"), PortalRow::bare("3.3.3.3")];
        let page3 = vec![PortalRow::bare("1.1.1.1")];
        assert_eq!(merge_page(&mut seen, page1, &mut out), 2);
        assert_eq!(merge_page(&mut seen, page2, &mut out), 1);
        assert_eq!(merge_page(&mut seen, page3, &mut out), 0);
        assert_eq!(out.len(), 3);
    }
}
