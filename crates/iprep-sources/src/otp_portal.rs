use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use iprep_core::{RawRecord, SourceConfig};
use iprep_storage::{ArtifactStore, FetchOptions, HttpFetcher};
use tracing::{info, warn};
use url::Url;

use crate::file::configured_delimiter;
use crate::formats::{delimiter_for_path, parse_records, DataFormat, ParseContext, RecordDefaults};
use crate::plugin::{credential, SourceCore, SourceMetadata, SourcePlugin};
use crate::session_portal::{form_login, login_form};
use crate::url_feed::resolve_format;
use crate::FetchError;

const DEFAULT_CONFIDENCE: f64 = 0.9;

/// Portal guarded by a one-time passcode.
///
/// When `base_url` is set a fresh export is attempted first: with a
/// pre-authenticated `session_cookie` directly, otherwise after a form login
/// with `username`/`password`. A passcode prompt after login is an auth
/// failure. Any failure falls back to replaying the newest export in
/// `backup_dir`; a successful fresh export is captured there.
#[derive(Debug)]
pub struct OtpPortalSource {
    core: SourceCore,
    http: HttpFetcher,
    artifact_root: PathBuf,
}

impl OtpPortalSource {
    pub const PLUGIN: &'static str = "otp_portal";

    pub fn new(config: SourceConfig, http: HttpFetcher, artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            core: SourceCore::new(config),
            http,
            artifact_root: artifact_root.into(),
        }
    }

    fn backup_dir(&self) -> PathBuf {
        match self.core.config().setting_str("backup_dir") {
            Some(dir) => PathBuf::from(dir),
            None => self.artifact_root.join(self.core.name()),
        }
    }

    /// Login and export URLs, or `None` when no live portal is configured.
    fn portal_urls(&self) -> Result<Option<(Url, Url)>, FetchError> {
        let config = self.core.config();
        let Some(raw) = config.setting_str("base_url") else {
            return Ok(None);
        };
        let base = Url::parse(raw).map_err(|e| FetchError::Settings(format!("base_url: {e}")))?;
        let join = |key: &str, default: &str| {
            base.join(config.setting_str(key).unwrap_or(default))
                .map_err(|e| FetchError::Settings(format!("{key}: {e}")))
        };
        Ok(Some((join("login_path", "/login")?, join("export_path", "/export")?)))
    }

    fn fetch_options(&self) -> FetchOptions {
        let config = self.core.config();
        FetchOptions {
            headers: config.setting_string_map("headers"),
            timeout: config
                .setting_u64("timeout")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    fn parse_body(
        &self,
        text: &str,
        format: DataFormat,
        origin: &str,
        path_hint: &str,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let config = self.core.config();
        let defaults = RecordDefaults::from_config(config, DEFAULT_CONFIDENCE);
        let mut ctx = ParseContext::new(self.core.name(), origin, &defaults);
        ctx.delimiter = Some(configured_delimiter(config).unwrap_or_else(|| delimiter_for_path(path_hint)));
        ctx.ip_field = config.setting_str("ip_field");
        parse_records(format, text, &ctx)
    }

    /// Fresh export from the live portal; `None` when only backups are configured.
    async fn fetch_live(&self) -> Result<Option<Vec<RawRecord>>, FetchError> {
        let Some((login_url, export_url)) = self.portal_urls()? else {
            return Ok(None);
        };
        let name = self.core.name();
        let config = self.core.config();
        let mut options = self.fetch_options();

        let records = match credential(config, "session_cookie") {
            Some(cookie) => {
                options.headers.push(("Cookie".to_string(), cookie.to_string()));
                self.fetch_export(&self.http, &export_url, &options).await?
            }
            None => {
                let session = self.http.session()?;
                let form = login_form(config)?;
                form_login(&session, name, &login_url, &form, &options).await?;
                self.fetch_export(&session, &export_url, &options).await?
            }
        };
        Ok(Some(records))
    }

    async fn fetch_export(
        &self,
        http: &HttpFetcher,
        url: &Url,
        options: &FetchOptions,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let name = self.core.name();
        let config = self.core.config();
        let response = http.get(name, url.as_str(), options).await?;
        let format = resolve_format(config, response.content_type.as_deref(), url.path())?;
        let text = response.text();
        let records = self.parse_body(&text, format, &response.final_url, url.path())?;
        if records.is_empty() {
            return Err(FetchError::NoData(format!("export at {url} contained no addresses")));
        }

        let stored = ArtifactStore::new(self.backup_dir())
            .store_bytes(Utc::now(), name, format.extension(), &response.body)
            .await?;
        info!(
            source = name,
            path = %stored.absolute_path.display(),
            deduplicated = stored.deduplicated,
            "captured fresh portal export"
        );
        Ok(records
            .into_iter()
            .map(|r| r.with_metadata("replay", false))
            .collect())
    }

    async fn replay_latest(&self) -> Result<Vec<RawRecord>, FetchError> {
        let dir = self.backup_dir();
        let Some(path) = newest_backup(&dir, self.core.name()).await? else {
            return Err(FetchError::NoData(format!("no backup export in {}", dir.display())));
        };
        let path_str = path.to_string_lossy().into_owned();
        let format = match self.core.config().setting_str("format") {
            Some(name) => DataFormat::parse(name)
                .ok_or_else(|| FetchError::Settings(format!("unsupported format {name:?}")))?,
            None => DataFormat::from_path(&path_str).unwrap_or(DataFormat::Text),
        };
        let bytes = tokio::fs::read(&path).await.map_err(|source| FetchError::Io {
            path: path_str.clone(),
            source,
        })?;
        info!(source = self.core.name(), backup = %path.display(), "replaying portal backup");

        let origin = format!("file://{path_str}");
        let records = self.parse_body(&String::from_utf8_lossy(&bytes), format, &origin, &path_str)?;
        Ok(records
            .into_iter()
            .map(|r| r.with_metadata("replay", true).with_metadata("backup_file", path_str.as_str()))
            .collect())
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Newest of the latest captured artifact and loose files dropped into `dir`.
async fn newest_backup(dir: &Path, source: &str) -> Result<Option<PathBuf>, FetchError> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(None);
    }
    let mut candidates = Vec::new();
    if let Some(captured) = ArtifactStore::new(dir).latest_artifact(source).await? {
        candidates.push(captured);
    }

    let io_err = |source| FetchError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if !hidden && entry.file_type().await.map_err(io_err)?.is_file() {
            candidates.push(path);
        }
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for path in candidates {
        let Some(mtime) = modified(&path).await else {
            continue;
        };
        if newest.as_ref().map_or(true, |(best, _)| mtime > *best) {
            newest = Some((mtime, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[async_trait]
impl SourcePlugin for OtpPortalSource {
    fn source_name(&self) -> &'static str {
        Self::PLUGIN
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            plugin: Self::PLUGIN,
            description: "OTP-protected portal export, replayed from captured backups",
            requires_credentials: true,
        }
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn validate_config(&self) -> bool {
        let config = self.core.config();
        credential(config, "username").is_some() && credential(config, "password").is_some()
    }

    async fn fetch_data(&self) -> Result<Vec<RawRecord>, FetchError> {
        match self.fetch_live().await {
            Ok(Some(records)) => return Ok(records),
            Ok(None) => {}
            Err(err) => warn!(
                source = self.core.name(),
                error = %err,
                "fresh export failed; falling back to backup"
            ),
        }
        self.replay_latest().await
    }
}
