use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use iprep_core::SourceConfig;
use iprep_storage::{HttpClientConfig, HttpFetcher};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::file::FileSource;
use crate::otp_portal::OtpPortalSource;
use crate::plugin::SourcePlugin;
use crate::session_portal::SessionPortalSource;
use crate::url_feed::UrlSource;
use crate::SourceError;

/// Shared resources handed to every plugin constructor.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub http: HttpFetcher,
    pub artifact_root: PathBuf,
}

impl SourceContext {
    pub fn new(http: HttpClientConfig, artifact_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http)?,
            artifact_root: artifact_root.into(),
        })
    }
}

pub type SourceConstructor = fn(SourceConfig, &SourceContext) -> Arc<dyn SourcePlugin>;

fn build_file(config: SourceConfig, _ctx: &SourceContext) -> Arc<dyn SourcePlugin> {
    Arc::new(FileSource::new(config))
}

fn build_url(config: SourceConfig, ctx: &SourceContext) -> Arc<dyn SourcePlugin> {
    Arc::new(UrlSource::new(config, ctx.http.clone()))
}

fn build_session_portal(config: SourceConfig, ctx: &SourceContext) -> Arc<dyn SourcePlugin> {
    Arc::new(SessionPortalSource::new(config, ctx.http.clone()))
}

fn build_otp_portal(config: SourceConfig, ctx: &SourceContext) -> Arc<dyn SourcePlugin> {
    Arc::new(OtpPortalSource::new(config, ctx.http.clone(), ctx.artifact_root.clone()))
}

/// Built-in plugins, registered by `auto_discover_sources`.
pub const BUILTIN_SOURCES: &[(&str, SourceConstructor)] = &[
    (FileSource::PLUGIN, build_file),
    (UrlSource::PLUGIN, build_url),
    (SessionPortalSource::PLUGIN, build_session_portal),
    (OtpPortalSource::PLUGIN, build_otp_portal),
];

const PROBE_NAME: &str = "__probe__";

/// Name → constructor map plus the context every constructor receives.
pub struct SourceRegistry {
    ctx: SourceContext,
    constructors: RwLock<BTreeMap<&'static str, SourceConstructor>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("ctx", &self.ctx)
            .field("registered", &self.list_registered())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            constructors: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &SourceContext {
        &self.ctx
    }

    /// Builds a throwaway instance to learn the canonical name, then stores the constructor.
    pub fn register(&self, constructor: SourceConstructor) -> Result<&'static str, SourceError> {
        let probe = constructor(SourceConfig::new(PROBE_NAME), &self.ctx);
        let name = probe.source_name();
        if name.trim().is_empty() {
            return Err(SourceError::Configuration {
                name: PROBE_NAME.to_string(),
                reason: "plugin reported an empty source name".to_string(),
            });
        }
        if self.constructors.write().insert(name, constructor).is_none() {
            debug!(source = name, "registered source plugin");
        }
        Ok(name)
    }

    pub fn get_source_class(&self, name: &str) -> Result<SourceConstructor, SourceError> {
        self.constructors
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| SourceError::UnknownSource(name.to_string()))
    }

    /// Registers every built-in plugin. Safe to call repeatedly.
    pub fn auto_discover_sources(&self) -> usize {
        let mut registered = 0;
        for (expected, constructor) in BUILTIN_SOURCES {
            match self.register(*constructor) {
                Ok(_) => registered += 1,
                Err(err) => warn!(source = *expected, error = %err, "failed to register built-in source"),
            }
        }
        info!(registered, "source plugins discovered");
        registered
    }

    /// Instantiates the plugin named by `config.plugin` (or the source name).
    pub fn instantiate(&self, config: SourceConfig) -> Result<Arc<dyn SourcePlugin>, SourceError> {
        let constructor = self.get_source_class(config.plugin_name())?;
        Ok(constructor(config, &self.ctx))
    }

    pub fn list_registered(&self) -> Vec<&'static str> {
        self.constructors.read().keys().copied().collect()
    }
}
