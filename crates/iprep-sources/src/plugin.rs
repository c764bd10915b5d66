use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use iprep_core::{RawRecord, SourceConfig};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::FetchError;

pub const DEFAULT_MAX_ERRORS: u32 = 5;

/// A credential setting that is present, non-empty and not an unresolved `${VAR}`.
pub(crate) fn credential<'a>(config: &'a SourceConfig, key: &str) -> Option<&'a str> {
    config.setting_str(key).filter(|value| !value.contains("${"))
}

/// Result of one `update()` call. Serialized with a `status` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UpdateOutcome {
    Skipped {
        reason: String,
    },
    Success {
        entries: Vec<RawRecord>,
        entries_count: usize,
        /// Seconds.
        duration: f64,
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
        error_count: u32,
    },
}

impl UpdateOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub error_count: u32,
    pub max_errors: u32,
    pub enabled: bool,
    pub last_update: Option<DateTime<Utc>>,
}

/// Static description of a plugin kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMetadata {
    pub plugin: &'static str,
    pub description: &'static str,
    pub requires_credentials: bool,
}

#[derive(Debug, Clone)]
struct HealthState {
    enabled: bool,
    error_count: u32,
    last_update: Option<DateTime<Utc>>,
}

/// Configuration plus mutable health state shared by every plugin.
#[derive(Debug)]
pub struct SourceCore {
    config: SourceConfig,
    max_errors: u32,
    state: Mutex<HealthState>,
}

impl SourceCore {
    pub fn new(config: SourceConfig) -> Self {
        let max_errors = config
            .setting_u64("max_errors")
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_ERRORS);
        let state = HealthState {
            enabled: config.enabled,
            error_count: 0,
            last_update: None,
        };
        Self {
            config,
            max_errors,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn max_errors(&self) -> u32 {
        self.max_errors
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn error_count(&self) -> u32 {
        self.state.lock().error_count
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_update
    }

    /// Manual circuit reset.
    pub fn reset_errors(&self) {
        self.state.lock().error_count = 0;
    }

    pub fn should_update_at(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        if !state.enabled || state.error_count >= self.max_errors {
            return false;
        }
        let secs = self.config.update_interval.min(i64::MAX as u64 / 1_000) as i64;
        let interval = ChronoDuration::seconds(secs);
        match state.last_update {
            None => true,
            Some(last) => now.signed_duration_since(last) >= interval,
        }
    }

    pub fn record_success(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.error_count = 0;
        state.last_update = Some(at);
    }

    /// Returns the new consecutive error count.
    pub fn record_failure(&self) -> u32 {
        let mut state = self.state.lock();
        state.error_count = state.error_count.saturating_add(1);
        state.error_count
    }

    pub fn health(&self, config_valid: bool) -> HealthReport {
        let state = self.state.lock().clone();
        HealthReport {
            healthy: config_valid && state.error_count < self.max_errors,
            error_count: state.error_count,
            max_errors: self.max_errors,
            enabled: state.enabled,
            last_update: state.last_update,
        }
    }

    fn skip_reason(&self) -> String {
        let state = self.state.lock();
        if !state.enabled {
            "disabled".to_string()
        } else if state.error_count >= self.max_errors {
            format!("circuit open after {} consecutive errors", state.error_count)
        } else {
            "update interval not elapsed".to_string()
        }
    }
}

/// Capability implemented by every origin of IP reputation records.
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Canonical registry name of the plugin kind.
    fn source_name(&self) -> &'static str;

    fn metadata(&self) -> SourceMetadata;

    fn core(&self) -> &SourceCore;

    fn validate_config(&self) -> bool;

    /// Runs the full fetch. Every call goes back to the origin.
    async fn fetch_data(&self) -> Result<Vec<RawRecord>, FetchError>;

    fn config(&self) -> &SourceConfig {
        self.core().config()
    }

    fn should_update(&self) -> bool {
        self.core().should_update_at(Utc::now())
    }

    /// Timed fetch that never fails: errors become `UpdateOutcome::Error`.
    async fn update(&self) -> UpdateOutcome {
        let core = self.core();
        if !self.should_update() {
            let reason = core.skip_reason();
            debug!(source = core.name(), %reason, "source update skipped");
            return UpdateOutcome::Skipped { reason };
        }

        let started = Instant::now();
        match self.fetch_data().await {
            Ok(entries) => {
                let timestamp = Utc::now();
                core.record_success(timestamp);
                let duration = started.elapsed().as_secs_f64();
                info!(
                    source = core.name(),
                    entries = entries.len(),
                    duration,
                    "source update succeeded"
                );
                UpdateOutcome::Success {
                    entries_count: entries.len(),
                    entries,
                    duration,
                    timestamp,
                }
            }
            Err(err) => {
                let error_count = core.record_failure();
                warn!(
                    source = core.name(),
                    error = %err,
                    error_count,
                    max_errors = core.max_errors(),
                    "source update failed"
                );
                UpdateOutcome::Error {
                    error: err.to_string(),
                    error_count,
                }
            }
        }
    }

    fn health_check(&self) -> HealthReport {
        self.core().health(self.validate_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iprep_core::ListCategory;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakySource {
        core: SourceCore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SourcePlugin for FlakySource {
        fn source_name(&self) -> &'static str {
            "flaky"
        }

        fn metadata(&self) -> SourceMetadata {
            SourceMetadata {
                plugin: "flaky",
                description: "test source",
                requires_credentials: false,
            }
        }

        fn core(&self) -> &SourceCore {
            &self.core
        }

        fn validate_config(&self) -> bool {
            true
        }

        async fn fetch_data(&self) -> Result<Vec<RawRecord>, FetchError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(FetchError::NoData("origin down".into()))
            } else {
                Ok(vec![RawRecord::new("8.8.8.8", "flaky", ListCategory::Blacklist, 0.9)])
            }
        }
    }

    fn flaky(fail: bool, update_interval: u64) -> FlakySource {
        let mut config = SourceConfig::new("flaky");
        config.update_interval = update_interval;
        config.settings = serde_json::json!({"max_errors": 3});
        FlakySource {
            core: SourceCore::new(config),
            fail: AtomicBool::new(fail),
        }
    }

    #[tokio::test]
    async fn success_resets_errors_and_records_last_update() {
        let source = flaky(true, 0);
        assert!(matches!(source.update().await, UpdateOutcome::Error { error_count: 1, .. }));

        source.fail.store(false, Ordering::SeqCst);
        let outcome = source.update().await;
        match outcome {
            UpdateOutcome::Success { entries_count, ref entries, .. } => {
                assert_eq!(entries_count, 1);
                assert_eq!(entries[0].ip_address, "8.8.8.8");
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(source.core().error_count(), 0);
        assert!(source.core().last_update().is_some());
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_circuit() {
        let source = flaky(true, 0);
        for expected in 1..=3 {
            match source.update().await {
                UpdateOutcome::Error { error_count, .. } => assert_eq!(error_count, expected),
                other => panic!("expected error, got {other:?}"),
            }
        }
        let health = source.health_check();
        assert!(!health.healthy);
        assert_eq!(health.max_errors, 3);
        assert!(!source.should_update());
        assert_eq!(source.update().await.status(), "skipped");

        source.core().reset_errors();
        assert!(source.should_update());
        assert!(source.health_check().healthy);
    }

    #[tokio::test]
    async fn interval_gates_updates_after_success() {
        let source = flaky(false, 3600);
        assert!(source.should_update());
        assert!(source.update().await.is_success());
        assert!(!source.should_update());
        assert_eq!(source.update().await.status(), "skipped");
    }

    #[test]
    fn disabling_keeps_health_state() {
        let source = flaky(true, 0);
        source.core().record_failure();
        source.core().set_enabled(false);
        assert!(!source.should_update());
        let health = source.health_check();
        assert!(!health.enabled);
        assert_eq!(health.error_count, 1);
        source.core().set_enabled(true);
        assert_eq!(source.core().error_count(), 1);
        assert!(source.should_update());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let value = serde_json::to_value(UpdateOutcome::Error {
            error: "boom".into(),
            error_count: 2,
        })
        .unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error_count"], 2);
    }
}
