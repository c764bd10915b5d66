use std::time::Duration;

use async_trait::async_trait;
use iprep_core::{RawRecord, SourceConfig};
use iprep_storage::{FetchOptions, HttpFetcher};
use url::Url;

use crate::file::configured_delimiter;
use crate::formats::{delimiter_for_path, parse_records, DataFormat, ParseContext, RecordDefaults};
use crate::plugin::{SourceCore, SourceMetadata, SourcePlugin};
use crate::FetchError;

const DEFAULT_CONFIDENCE: f64 = 0.6;

/// Remote list fetched over HTTP(S).
///
/// Format precedence: explicit `format` setting, response content type, URL
/// extension, then plain text.
#[derive(Debug)]
pub struct UrlSource {
    core: SourceCore,
    http: HttpFetcher,
}

impl UrlSource {
    pub const PLUGIN: &'static str = "url";

    pub fn new(config: SourceConfig, http: HttpFetcher) -> Self {
        Self {
            core: SourceCore::new(config),
            http,
        }
    }

    fn url(&self) -> Option<Url> {
        let raw = self.core.config().setting_str("url")?;
        Url::parse(raw)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
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
}

pub(crate) fn resolve_format(
    config: &SourceConfig,
    content_type: Option<&str>,
    path: &str,
) -> Result<DataFormat, FetchError> {
    if let Some(name) = config.setting_str("format") {
        return DataFormat::parse(name)
            .ok_or_else(|| FetchError::Settings(format!("unsupported format {name:?}")));
    }
    // text/plain is too generic to override a more specific extension.
    let from_header = content_type
        .and_then(DataFormat::from_content_type)
        .filter(|f| *f != DataFormat::Text);
    Ok(from_header
        .or_else(|| DataFormat::from_path(path))
        .unwrap_or(DataFormat::Text))
}

#[async_trait]
impl SourcePlugin for UrlSource {
    fn source_name(&self) -> &'static str {
        Self::PLUGIN
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            plugin: Self::PLUGIN,
            description: "IP list downloaded from an HTTP(S) URL",
            requires_credentials: false,
        }
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn validate_config(&self) -> bool {
        self.url().is_some()
    }

    async fn fetch_data(&self) -> Result<Vec<RawRecord>, FetchError> {
        let url = self
            .url()
            .ok_or_else(|| FetchError::Settings("missing or invalid url".to_string()))?;
        let response = self
            .http
            .get(self.core.name(), url.as_str(), &self.fetch_options())
            .await?;

        let config = self.core.config();
        let format = resolve_format(config, response.content_type.as_deref(), url.path())?;
        let text = response.text();
        let defaults = RecordDefaults::from_config(config, DEFAULT_CONFIDENCE);
        let mut ctx = ParseContext::new(self.core.name(), &response.final_url, &defaults);
        ctx.delimiter = Some(configured_delimiter(config).unwrap_or_else(|| delimiter_for_path(url.path())));
        ctx.ip_field = config.setting_str("ip_field");

        parse_records(format, &text, &ctx)
    }
}
