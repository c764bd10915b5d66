use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use iprep_core::{RawRecord, SourceConfig, UpsertOutcome, ValidationStats};
use iprep_sources::{
    HealthReport, SourceError, SourceMetadata, SourcePlugin, SourceRegistry, UpdateOutcome,
};
use iprep_storage::EntryStore;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{env_lookup, load_manager_file, save_manager_file, substitute_placeholders, ManagerFile};
use crate::pipeline::{CleaningPipeline, ScoringConfig};

/// Per-source line of a refresh cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRunResult {
    pub source: String,
    pub status: String,
    pub entries_count: usize,
    /// Seconds spent in the plugin's `update()`.
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaning: Option<ValidationStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upsert: Option<UpsertOutcome>,
}

impl SourceRunResult {
    fn empty(source: &str, status: &str) -> Self {
        Self {
            source: source.to_string(),
            status: status.to_string(),
            entries_count: 0,
            duration: 0.0,
            reason: None,
            error: None,
            error_count: None,
            cleaning: None,
            upsert: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Aggregate of one `update_all_sources` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub total_sources: usize,
    pub successful_sources: usize,
    /// Raw records returned by successful sources.
    pub total_entries: usize,
    /// Entries that survived cleaning.
    pub total_cleaned: usize,
    pub results: Vec<SourceRunResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SourceStatus {
    Report {
        plugin: &'static str,
        priority: u32,
        update_interval: u64,
        #[serde(flatten)]
        health: HealthReport,
        metadata: SourceMetadata,
    },
    Error {
        error: String,
    },
}

/// Owns the configured plugin instances and runs refresh cycles over them.
pub struct SourceManager {
    registry: Arc<SourceRegistry>,
    config_path: PathBuf,
    sources: RwLock<BTreeMap<String, Arc<dyn SourcePlugin>>>,
    /// Configs as written, before placeholder substitution; what `save_config` persists.
    declared: RwLock<BTreeMap<String, SourceConfig>>,
    scoring: RwLock<ScoringConfig>,
    store: Option<Arc<dyn EntryStore>>,
    last_run: Mutex<Option<RunSummary>>,
}

impl SourceManager {
    pub fn new(registry: Arc<SourceRegistry>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            config_path: config_path.into(),
            sources: RwLock::new(BTreeMap::new()),
            declared: RwLock::new(BTreeMap::new()),
            scoring: RwLock::new(ScoringConfig::default()),
            store: None,
            last_run: Mutex::new(None),
        }
    }

    /// Without a store, cleaned batches are returned but not persisted.
    pub fn with_store(mut self, store: Arc<dyn EntryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn scoring(&self) -> ScoringConfig {
        self.scoring.read().clone()
    }

    /// Loads `sources.yaml`. Sources that fail to build are logged and skipped
    /// but kept in the declared set so `save_config` does not drop them.
    pub async fn load_config(&self) -> Result<usize> {
        let file = load_manager_file(&self.config_path).await?;
        *self.scoring.write() = file.cleaning;

        let mut loaded = 0;
        for (name, config) in file.sources {
            match self.register_config(config.clone()) {
                Ok(()) => loaded += 1,
                Err(err) => warn!(source = %name, error = %err, "skipping configured source"),
            }
            self.declared.write().insert(name, config);
        }
        info!(loaded, path = %self.config_path.display(), "source configuration loaded");
        Ok(loaded)
    }

    pub async fn save_config(&self) -> Result<()> {
        let mut sources = self.declared.read().clone();
        for (name, source) in self.sources.read().iter() {
            if let Some(config) = sources.get_mut(name) {
                config.enabled = source.core().is_enabled();
            }
        }
        let file = ManagerFile {
            sources,
            cleaning: self.scoring(),
        };
        save_manager_file(&self.config_path, &file).await?;
        info!(path = %self.config_path.display(), "source configuration saved");
        Ok(())
    }

    fn register_config(&self, declared: SourceConfig) -> Result<(), SourceError> {
        let mut resolved = declared;
        resolved.settings = substitute_placeholders(resolved.settings, &env_lookup);
        let name = resolved.name.clone();
        let source = self.registry.instantiate(resolved)?;
        if !source.validate_config() {
            return Err(SourceError::Configuration {
                name,
                reason: format!("invalid settings for {} source", source.source_name()),
            });
        }
        self.sources.write().insert(name, source);
        Ok(())
    }

    /// Builds, validates and registers a source. Nothing is kept on failure.
    pub fn add_source(&self, name: &str, config_data: JsonValue) -> Result<(), SourceError> {
        let mut config: SourceConfig =
            serde_json::from_value(config_data).map_err(|e| SourceError::Configuration {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        config.name = name.to_string();
        self.register_config(config.clone())?;
        self.declared.write().insert(name.to_string(), config);
        info!(source = name, "source added");
        Ok(())
    }

    pub fn remove_source(&self, name: &str) -> bool {
        self.declared.write().remove(name);
        self.sources.write().remove(name).is_some()
    }

    pub fn list_sources(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    pub fn last_run(&self) -> Option<RunSummary> {
        self.last_run.lock().clone()
    }

    fn source(&self, name: &str) -> Result<Arc<dyn SourcePlugin>, SourceError> {
        self.sources
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::UnknownSource(name.to_string()))
    }

    pub fn enable_source(&self, name: &str) -> Result<(), SourceError> {
        self.source(name)?.core().set_enabled(true);
        info!(source = name, "source enabled");
        Ok(())
    }

    /// Only future cycles are affected.
    pub fn disable_source(&self, name: &str) -> Result<(), SourceError> {
        self.source(name)?.core().set_enabled(false);
        info!(source = name, "source disabled");
        Ok(())
    }

    /// Manual circuit reset.
    pub fn reset_source(&self, name: &str) -> Result<(), SourceError> {
        self.source(name)?.core().reset_errors();
        info!(source = name, "source error count reset");
        Ok(())
    }

    pub fn get_source_status(&self) -> BTreeMap<String, SourceStatus> {
        let sources = self.sources.read().clone();
        sources
            .into_iter()
            .map(|(name, source)| {
                let status = catch_unwind(AssertUnwindSafe(|| {
                    let config = source.config();
                    SourceStatus::Report {
                        plugin: source.source_name(),
                        priority: config.priority,
                        update_interval: config.update_interval,
                        health: source.health_check(),
                        metadata: source.metadata(),
                    }
                }))
                .unwrap_or_else(|panic| {
                    let error = panic_message(panic.as_ref());
                    warn!(source = %name, %error, "status check failed");
                    SourceStatus::Error { error }
                });
                (name, status)
            })
            .collect()
    }

    /// Refreshes every enabled source on at most `max_workers` concurrent tasks.
    pub async fn update_all_sources(&self, max_workers: usize) -> RunSummary {
        let start_time = Utc::now();
        let clock = Instant::now();

        let mut due = self
            .sources
            .read()
            .iter()
            .filter(|(_, source)| source.core().is_enabled())
            .map(|(name, source)| (source.config().priority, name.clone(), Arc::clone(source)))
            .collect::<Vec<_>>();
        due.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        let total_sources = due.len();
        info!(total_sources, max_workers, "starting source refresh");

        let scoring = self.scoring();
        let store = self.store.clone();
        let results = stream::iter(due.into_iter().map(|(_, name, source)| {
            let task = run_source(name.clone(), source, scoring.clone(), store.clone());
            let handle = tokio::spawn(task.instrument(info_span!("source_update", source = %name)));
            async move {
                handle.await.unwrap_or_else(|err| {
                    let mut result = SourceRunResult::empty(&name, "error");
                    result.error = Some(if err.is_panic() {
                        format!("worker panicked: {}", panic_message(err.into_panic().as_ref()))
                    } else {
                        format!("worker cancelled: {err}")
                    });
                    warn!(source = %name, error = result.error.as_deref().unwrap_or_default(), "source worker failed");
                    result
                })
            }
        }))
        .boxed()
        .buffer_unordered(max_workers.max(1))
        .collect::<Vec<_>>()
        .await;

        let summary = RunSummary {
            start_time,
            end_time: Utc::now(),
            duration: clock.elapsed().as_secs_f64(),
            total_sources,
            successful_sources: results.iter().filter(|r| r.is_success()).count(),
            total_entries: results.iter().map(|r| r.entries_count).sum(),
            total_cleaned: results
                .iter()
                .filter_map(|r| r.cleaning.map(|c| c.valid_ips))
                .sum(),
            results,
        };
        info!(
            total_sources = summary.total_sources,
            successful_sources = summary.successful_sources,
            total_entries = summary.total_entries,
            total_cleaned = summary.total_cleaned,
            duration = summary.duration,
            "source refresh finished"
        );
        *self.last_run.lock() = Some(summary.clone());
        summary
    }

    /// Refreshes a single source through the same clean-and-persist path.
    pub async fn update_source(&self, name: &str) -> Result<SourceRunResult, SourceError> {
        let source = self.source(name)?;
        Ok(run_source(name.to_string(), source, self.scoring(), self.store.clone())
            .instrument(info_span!("source_update", source = %name))
            .await)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn run_source(
    name: String,
    source: Arc<dyn SourcePlugin>,
    scoring: ScoringConfig,
    store: Option<Arc<dyn EntryStore>>,
) -> SourceRunResult {
    match source.update().await {
        UpdateOutcome::Skipped { reason } => {
            let mut result = SourceRunResult::empty(&name, "skipped");
            result.reason = Some(reason);
            result
        }
        UpdateOutcome::Error { error, error_count } => {
            let mut result = SourceRunResult::empty(&name, "error");
            result.error = Some(error);
            result.error_count = Some(error_count);
            result
        }
        UpdateOutcome::Success {
            entries,
            entries_count,
            duration,
            ..
        } => {
            let loose = entries.iter().map(RawRecord::to_loose).collect::<Vec<_>>();
            let mut pipeline = CleaningPipeline::new(name.as_str(), scoring);
            if let Some(store) = store {
                pipeline = pipeline.with_store(store);
            }
            let batch = pipeline.process_batch(&loose).await;
            let mut result = SourceRunResult::empty(&name, "success");
            result.entries_count = entries_count;
            result.duration = duration;
            result.cleaning = Some(batch.stats);
            result.upsert = batch.upsert;
            result
        }
    }
}
