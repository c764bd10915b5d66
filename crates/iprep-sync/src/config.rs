use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use iprep_core::SourceConfig;
use iprep_storage::HttpClientConfig;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::info;

use crate::pipeline::ScoringConfig;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern"));

/// Written to the config path on first run.
pub const DEFAULT_CONFIG: &str = r#"# IP reputation sources.
# ${VAR} placeholders inside `settings` are substituted from the environment at load time.
# `plugin` selects the registry entry (file, url, session_portal, otp_portal) and
# defaults to the source name.
sources:
  local_blocklist:
    plugin: file
    enabled: true
    priority: 1
    update_interval: 3600
    settings:
      path: ./data/blocklist.txt
      confidence: 0.7
  spamhaus_drop:
    plugin: url
    enabled: false
    priority: 2
    update_interval: 43200
    settings:
      url: https://www.spamhaus.org/drop/drop.txt
      timeout: 30
      threat_type: botnet
  session_portal:
    enabled: false
    priority: 3
    update_interval: 86400
    settings:
      base_url: ${SESSION_PORTAL_URL}
      username: ${SESSION_PORTAL_USERNAME}
      password: ${SESSION_PORTAL_PASSWORD}
      login_path: /login
      list_path: /blacklist
      max_pages: 10
  otp_portal:
    enabled: false
    priority: 4
    update_interval: 86400
    settings:
      username: ${OTP_PORTAL_USERNAME}
      password: ${OTP_PORTAL_PASSWORD}
      backup_dir: ./data/otp_portal
cleaning:
  base_score: 50
  confidence: { high: 30, medium: 20, low: 10 }
  trust: { policy: 10, commercial: 5, community: 0 }
  recency: { recent_days: 7, recent_bonus: 10, fresh_days: 30, fresh_bonus: 5 }
"#;

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct IprepConfig {
    pub config_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_workers: usize,
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl IprepConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("IPREP_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            user_agent: std::env::var("IPREP_USER_AGENT")
                .unwrap_or_else(|_| "iprep-ingest/0.1".to_string()),
            http_timeout_secs: std::env::var("IPREP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            max_workers: std::env::var("IPREP_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(4),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            scheduler_enabled: std::env::var("IPREP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("IPREP_SYNC_CRON").unwrap_or_else(|_| "0 */6 * * *".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

/// On-disk shape of `sources.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerFile {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub cleaning: ScoringConfig,
}

/// Replaces `${VAR}` in every string of `value`, recursing through maps and
/// sequences. Names `lookup` cannot resolve stay verbatim.
pub fn substitute_placeholders(value: JsonValue, lookup: &dyn Fn(&str) -> Option<String>) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(
            PLACEHOLDER
                .replace_all(&s, |caps: &Captures<'_>| {
                    lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned(),
        ),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .map(|item| substitute_placeholders(item, lookup))
                .collect(),
        ),
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_placeholders(v, lookup)))
                .collect(),
        ),
        other => other,
    }
}

pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Reads the config file, writing `DEFAULT_CONFIG` first when it does not exist.
/// Source names are filled from their keys; placeholders are left unresolved.
pub async fn load_manager_file(path: &Path) -> Result<ManagerFile> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(path, DEFAULT_CONFIG)
            .await
            .with_context(|| format!("writing default config to {}", path.display()))?;
        info!(path = %path.display(), "wrote default source configuration");
    }

    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut file: ManagerFile = if text.trim().is_empty() {
        ManagerFile::default()
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    };
    for (name, config) in &mut file.sources {
        config.name = name.clone();
    }
    Ok(file)
}

pub async fn save_manager_file(path: &Path, file: &ManagerFile) -> Result<()> {
    let text = serde_yaml::to_string(file).context("serializing source configuration")?;
    let temp = path.with_extension("yaml.tmp");
    fs::write(&temp, text)
        .await
        .with_context(|| format!("writing {}", temp.display()))?;
    fs::rename(&temp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))
}
