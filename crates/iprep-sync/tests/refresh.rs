use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use iprep_core::{ListCategory, RawRecord, SourceConfig};
use iprep_sources::{
    FetchError, HealthReport, SourceContext, SourceCore, SourceError, SourceMetadata, SourcePlugin,
    SourceRegistry,
};
use iprep_storage::{HttpClientConfig, MemoryEntryStore};
use iprep_sync::{SourceManager, SourceStatus};
use serde_json::json;
use tempfile::tempdir;

/// Behaviour is driven by the `mode` setting: `ok` (default), `fail`, `panic`, `bad_health`.
struct ScriptedSource {
    core: SourceCore,
}

impl ScriptedSource {
    fn mode(&self) -> &str {
        self.core.config().setting_str("mode").unwrap_or("ok")
    }
}

#[async_trait]
impl SourcePlugin for ScriptedSource {
    fn source_name(&self) -> &'static str {
        "scripted"
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            plugin: "scripted",
            description: "scripted test source",
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
        match self.mode() {
            "fail" => Err(FetchError::NoData("scripted outage".to_string())),
            "panic" => panic!("scripted panic"),
            _ => Ok(self
                .core
                .config()
                .setting("ips")
                .and_then(|v| v.as_array())
                .map(|ips| {
                    ips.iter()
                        .filter_map(|ip| ip.as_str())
                        .map(|ip| RawRecord::new(ip, self.core.name(), ListCategory::Blacklist, 0.9))
                        .collect()
                })
                .unwrap_or_default()),
        }
    }

    fn health_check(&self) -> HealthReport {
        if self.mode() == "bad_health" {
            panic!("health probe exploded");
        }
        self.core.health(self.validate_config())
    }
}

fn build_scripted(config: SourceConfig, _ctx: &SourceContext) -> Arc<dyn SourcePlugin> {
    Arc::new(ScriptedSource {
        core: SourceCore::new(config),
    })
}

fn registry() -> Arc<SourceRegistry> {
    let ctx = SourceContext::new(HttpClientConfig::default(), std::env::temp_dir()).expect("context");
    let registry = SourceRegistry::new(ctx);
    registry.auto_discover_sources();
    registry.register(build_scripted).expect("register scripted");
    Arc::new(registry)
}

fn manager(config_path: &Path) -> (SourceManager, Arc<MemoryEntryStore>) {
    let store = Arc::new(MemoryEntryStore::new());
    let manager = SourceManager::new(registry(), config_path).with_store(store.clone());
    (manager, store)
}

fn scripted(priority: u32, settings: serde_json::Value) -> serde_json::Value {
    json!({"plugin": "scripted", "priority": priority, "update_interval": 0, "settings": settings})
}

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn one_failing_or_panicking_source_does_not_affect_the_others() {
    let dir = tempdir().expect("tempdir");
    let (manager, store) = manager(&dir.path().join("sources.yaml"));
    manager
        .add_source("healthy", scripted(1, json!({"ips": ["8.8.8.8", "1.1.1.1", "10.0.0.1"]})))
        .expect("healthy");
    manager
        .add_source("broken", scripted(2, json!({"mode": "fail"})))
        .expect("broken");
    manager
        .add_source("crashing", scripted(3, json!({"mode": "panic"})))
        .expect("crashing");

    let summary = manager.update_all_sources(3).await;
    assert_eq!(summary.total_sources, 3);
    assert_eq!(summary.successful_sources, 1);
    assert_eq!(summary.total_entries, 3);
    assert_eq!(summary.total_cleaned, 2);

    let by_name = |name: &str| {
        summary
            .results
            .iter()
            .find(|r| r.source == name)
            .unwrap_or_else(|| panic!("missing result for {name}"))
    };
    let healthy = by_name("healthy");
    assert_eq!(healthy.status, "success");
    let cleaning = healthy.cleaning.expect("cleaning stats");
    assert_eq!(cleaning.invalid_ips, 1);
    assert_eq!(cleaning.saved, 2);
    assert_eq!(by_name("broken").status, "error");
    assert_eq!(by_name("broken").error_count, Some(1));
    assert_eq!(by_name("crashing").status, "error");
    assert!(by_name("crashing")
        .error
        .as_deref()
        .is_some_and(|e| e.contains("scripted panic")));

    assert_eq!(store.len().await, 2);
    assert!(store.get("8.8.8.8", "HEALTHY").await.is_some());
    assert_eq!(manager.last_run(), Some(summary));
}

#[tokio::test]
async fn single_worker_runs_sources_in_priority_order() {
    let dir = tempdir().expect("tempdir");
    let (manager, _store) = manager(&dir.path().join("sources.yaml"));
    for (name, priority) in [("zulu", 1), ("alpha", 3), ("mike", 1), ("bravo", 2)] {
        manager
            .add_source(name, scripted(priority, json!({"ips": ["9.9.9.9"]})))
            .expect("add");
    }
    let summary = manager.update_all_sources(1).await;
    let order = summary.results.iter().map(|r| r.source.as_str()).collect::<Vec<_>>();
    assert_eq!(order, vec!["mike", "zulu", "bravo", "alpha"]);
}

#[tokio::test]
async fn repeated_failures_open_the_circuit_until_reset() {
    let dir = tempdir().expect("tempdir");
    let (manager, _store) = manager(&dir.path().join("sources.yaml"));
    manager
        .add_source("flaky", scripted(1, json!({"mode": "fail", "max_errors": 2})))
        .expect("add");

    for expected in 1..=2 {
        let result = manager.update_source("flaky").await.expect("known source");
        assert_eq!(result.status, "error");
        assert_eq!(result.error_count, Some(expected));
    }
    let summary = manager.update_all_sources(2).await;
    assert_eq!(summary.results[0].status, "skipped");
    assert!(summary.results[0]
        .reason
        .as_deref()
        .is_some_and(|r| r.contains("circuit open")));

    match &manager.get_source_status()["flaky"] {
        SourceStatus::Report { health, .. } => {
            assert!(!health.healthy);
            assert_eq!(health.error_count, 2);
            assert_eq!(health.max_errors, 2);
        }
        other => panic!("unexpected status {other:?}"),
    }

    manager.reset_source("flaky").expect("reset");
    let result = manager.update_source("flaky").await.expect("known source");
    assert_eq!(result.status, "error");
    assert_eq!(result.error_count, Some(1));
}

#[tokio::test]
async fn disabled_sources_are_left_out_and_keep_their_health() {
    let dir = tempdir().expect("tempdir");
    let (manager, _store) = manager(&dir.path().join("sources.yaml"));
    manager
        .add_source("primary", scripted(1, json!({"ips": ["8.8.8.8"]})))
        .expect("add");
    manager
        .add_source("secondary", scripted(2, json!({"mode": "fail"})))
        .expect("add");
    manager.update_all_sources(2).await;

    manager.disable_source("secondary").expect("disable");
    let summary = manager.update_all_sources(2).await;
    assert_eq!(summary.total_sources, 1);
    match &manager.get_source_status()["secondary"] {
        SourceStatus::Report { health, .. } => {
            assert!(!health.enabled);
            assert_eq!(health.error_count, 1);
        }
        other => panic!("unexpected status {other:?}"),
    }

    manager.enable_source("secondary").expect("enable");
    assert_eq!(manager.update_all_sources(2).await.total_sources, 2);
    assert!(matches!(
        manager.disable_source("ghost"),
        Err(SourceError::UnknownSource(_))
    ));
}

#[tokio::test]
async fn credential_sources_without_settings_are_refused() {
    let dir = tempdir().expect("tempdir");
    let (manager, _store) = manager(&dir.path().join("sources.yaml"));

    let err = manager.add_source("session_portal", json!({})).unwrap_err();
    assert!(matches!(err, SourceError::Configuration { .. }));
    assert!(!manager.list_sources().contains(&"session_portal".to_string()));

    let err = manager
        .add_source("otp_portal", json!({"settings": {"username": "${NO_SUCH_USER}", "password": "x"}}))
        .unwrap_err();
    assert!(matches!(err, SourceError::Configuration { .. }));

    let err = manager.add_source("mystery", json!({})).unwrap_err();
    assert!(matches!(err, SourceError::UnknownSource(name) if name == "mystery"));

    let err = manager.add_source("bad_shape", json!({"priority": "first"})).unwrap_err();
    assert!(matches!(err, SourceError::Configuration { .. }));
    assert!(manager.list_sources().is_empty());
}

#[tokio::test]
async fn status_isolates_a_failing_health_probe() {
    let dir = tempdir().expect("tempdir");
    let (manager, _store) = manager(&dir.path().join("sources.yaml"));
    manager.add_source("fine", scripted(1, json!({}))).expect("add");
    manager
        .add_source("weird", scripted(2, json!({"mode": "bad_health"})))
        .expect("add");

    let status = manager.get_source_status();
    match &status["fine"] {
        SourceStatus::Report {
            plugin,
            priority,
            health,
            metadata,
            ..
        } => {
            assert_eq!(*plugin, "scripted");
            assert_eq!(*priority, 1);
            assert!(health.healthy);
            assert!(!metadata.requires_credentials);
        }
        other => panic!("unexpected status {other:?}"),
    }
    match &status["weird"] {
        SourceStatus::Error { error } => assert!(error.contains("health probe exploded")),
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn config_loads_with_env_placeholders_and_saves_them_verbatim() {
    std::env::set_var("IPREP_TEST_FEED_PATH", fixtures().join("feeds/blocklist.txt"));
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("sources.yaml");
    std::fs::write(
        &path,
        r#"
sources:
  soc_list:
    plugin: file
    priority: 1
    update_interval: 0
    settings:
      path: ${IPREP_TEST_FEED_PATH}
  partner_portal:
    plugin: session_portal
    enabled: false
    settings:
      base_url: https://portal.example.net
      username: ${IPREP_TEST_UNSET_USER}
      password: ${IPREP_TEST_UNSET_PASSWORD}
cleaning:
  base_score: 40
"#,
    )
    .expect("write config");

    let (manager, store) = manager(&path);
    assert_eq!(manager.load_config().await.expect("load"), 1);
    assert_eq!(manager.list_sources(), vec!["soc_list".to_string()]);
    assert_eq!(manager.scoring().base_score, 40);

    let summary = manager.update_all_sources(2).await;
    assert_eq!(summary.successful_sources, 1);
    assert_eq!(store.len().await, 3);

    manager.disable_source("soc_list").expect("disable");
    manager.save_config().await.expect("save");
    let saved = std::fs::read_to_string(&path).expect("read saved");
    assert!(saved.contains("${IPREP_TEST_FEED_PATH}"));
    assert!(saved.contains("partner_portal"));
    assert!(saved.contains("base_score: 40"));

    let (reloaded, _) = crate::manager(&path);
    reloaded.load_config().await.expect("reload");
    match &reloaded.get_source_status()["soc_list"] {
        SourceStatus::Report { health, .. } => assert!(!health.enabled),
        other => panic!("unexpected status {other:?}"),
    }

    assert!(manager.remove_source("soc_list"));
    assert!(!manager.remove_source("soc_list"));
    assert!(manager.list_sources().is_empty());
}

#[tokio::test]
async fn missing_config_file_gets_the_default_written() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("sources.yaml");
    let (manager, _store) = manager(&path);
    manager.load_config().await.expect("load");
    assert!(path.exists());
    let written = std::fs::read_to_string(&path).expect("read");
    assert!(written.contains("session_portal"));
    // Portal credentials are unresolved placeholders, so only the plain sources load.
    let sources = manager.list_sources();
    assert!(sources.contains(&"local_blocklist".to_string()));
    assert!(!sources.contains(&"session_portal".to_string()));
}
