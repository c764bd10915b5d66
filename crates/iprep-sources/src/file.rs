use async_trait::async_trait;
use iprep_core::{RawRecord, SourceConfig};
use tracing::debug;

use crate::formats::{delimiter_for_path, parse_records, DataFormat, ParseContext, RecordDefaults};
use crate::plugin::{SourceCore, SourceMetadata, SourcePlugin};
use crate::FetchError;

const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Local list file: plain text, CSV/TSV, JSON or a log.
///
/// Settings: `path` (or `file_path`), optional `format`, `delimiter`, `ip_field`,
/// `category`, `confidence` and `threat_type`.
#[derive(Debug)]
pub struct FileSource {
    core: SourceCore,
}

impl FileSource {
    pub const PLUGIN: &'static str = "file";

    pub fn new(config: SourceConfig) -> Self {
        Self {
            core: SourceCore::new(config),
        }
    }

    fn path(&self) -> Option<&str> {
        let config = self.core.config();
        config
            .setting_str("path")
            .or_else(|| config.setting_str("file_path"))
    }

    fn format_for(&self, path: &str) -> Result<DataFormat, FetchError> {
        match self.core.config().setting_str("format") {
            Some(name) => DataFormat::parse(name)
                .ok_or_else(|| FetchError::Settings(format!("unsupported format {name:?}"))),
            None => Ok(DataFormat::from_path(path).unwrap_or(DataFormat::Text)),
        }
    }
}

/// Single-byte delimiter from settings; `\t` and `tab` are accepted.
pub(crate) fn configured_delimiter(config: &SourceConfig) -> Option<u8> {
    let raw = config.setting("delimiter")?.as_str()?;
    match raw {
        "\t" | "\\t" | "tab" => Some(b'\t'),
        other if other.len() == 1 => other.bytes().next(),
        _ => None,
    }
}

#[async_trait]
impl SourcePlugin for FileSource {
    fn source_name(&self) -> &'static str {
        Self::PLUGIN
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            plugin: Self::PLUGIN,
            description: "IP list read from a local file",
            requires_credentials: false,
        }
    }

    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn validate_config(&self) -> bool {
        self.path().is_some()
    }

    async fn fetch_data(&self) -> Result<Vec<RawRecord>, FetchError> {
        let path = self
            .path()
            .ok_or_else(|| FetchError::Settings("missing path".to_string()))?;
        let format = self.format_for(path)?;

        let bytes = tokio::fs::read(path).await.map_err(|source| FetchError::Io {
            path: path.to_string(),
            source,
        })?;
        let text = String::from_utf8_lossy(&bytes);
        debug!(source = self.core.name(), path, bytes = bytes.len(), "read list file");

        let config = self.core.config();
        let defaults = RecordDefaults::from_config(config, DEFAULT_CONFIDENCE);
        let origin = format!("file://{path}");
        let mut ctx = ParseContext::new(self.core.name(), &origin, &defaults);
        ctx.delimiter = Some(configured_delimiter(config).unwrap_or_else(|| delimiter_for_path(path)));
        ctx.ip_field = config.setting_str("ip_field");

        parse_records(format, &text, &ctx)
    }
}
