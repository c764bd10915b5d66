//! Source plugin contract, built-in plugins and the compile-time registry.

mod file;
pub mod formats;
mod otp_portal;
mod plugin;
mod registry;
mod session_portal;
#[cfg(test)]
mod test_support;
mod url_feed;

use iprep_storage::HttpFetchError;
use thiserror::Error;

pub use file::FileSource;
pub use formats::{DataFormat, RecordDefaults};
pub use otp_portal::OtpPortalSource;
pub use plugin::{
    HealthReport, SourceCore, SourceMetadata, SourcePlugin, UpdateOutcome, DEFAULT_MAX_ERRORS,
};
pub use registry::{SourceConstructor, SourceContext, SourceRegistry, BUILTIN_SOURCES};
pub use session_portal::{extract_portal_rows, ExtractionStrategy, PortalRow, SessionPortalSource};
pub use url_feed::UrlSource;

pub const CRATE_NAME: &str = "iprep-sources";

/// Transient origin failure. Isolated per source; never escapes `update()`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Http(#[from] HttpFetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("no data available: {0}")]
    NoData(String),
    #[error("invalid source settings: {0}")]
    Settings(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Registration and configuration failures. These are the only errors raised to callers.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("configuration error for source {name}: {reason}")]
    Configuration { name: String, reason: String },
}
