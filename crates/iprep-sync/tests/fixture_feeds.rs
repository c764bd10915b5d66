use std::path::{Path, PathBuf};
use std::sync::Arc;

use iprep_core::{ConfidenceLevel, SourceConfig, ThreatType, ValidationStats};
use iprep_sources::{extract_portal_rows, ExtractionStrategy, SourceContext, SourcePlugin, SourceRegistry};
use iprep_storage::{HttpClientConfig, MemoryEntryStore};
use iprep_sync::{CleaningPipeline, ScoringConfig};
use serde_json::json;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn registry() -> SourceRegistry {
    let ctx = SourceContext::new(HttpClientConfig::default(), std::env::temp_dir()).expect("context");
    let registry = SourceRegistry::new(ctx);
    registry.auto_discover_sources();
    registry
}

fn file_source(name: &str, path: PathBuf) -> Arc<dyn SourcePlugin> {
    let mut config = SourceConfig::new(name).with_settings(json!({"path": path}));
    config.plugin = Some("file".to_string());
    registry().instantiate(config).expect("file source")
}

async fn clean(source: &Arc<dyn SourcePlugin>) -> iprep_sync::BatchResult {
    let records = source.fetch_data().await.expect("fetch");
    let loose = records.iter().map(|r| r.to_loose()).collect::<Vec<_>>();
    CleaningPipeline::new(source.config().name.clone(), ScoringConfig::default())
        .process_batch(&loose)
        .await
}

#[tokio::test]
async fn text_blocklist_drops_private_malformed_and_repeated_addresses() {
    let source = file_source("soc_blocklist", fixtures().join("feeds/blocklist.txt"));
    let result = clean(&source).await;

    assert_eq!(
        result.stats,
        ValidationStats {
            total_processed: 6,
            valid_ips: 3,
            invalid_ips: 2,
            duplicates: 1,
            enriched: 3,
            saved: 0,
            skipped: 0,
            errors: 0,
        }
    );
    let ips = result.entries.iter().map(|e| e.ip.as_str()).collect::<Vec<_>>();
    assert_eq!(ips, vec!["45.155.205.233", "185.220.101.1", "103.75.201.4"]);
    assert!(result.entries.iter().all(|e| e.source == "SOC_BLOCKLIST"));
    assert_eq!(result.entries[0].description, "ssh brute force");
}

#[tokio::test]
async fn csv_feed_maps_columns_into_cleaned_fields() {
    let source = file_source("csv_feed", fixtures().join("feeds/indicators.csv"));
    let result = clean(&source).await;

    assert_eq!(result.stats.valid_ips, 2);
    assert_eq!(result.stats.invalid_ips, 1);
    let mirai = &result.entries[0];
    assert_eq!(mirai.ip, "91.240.118.172");
    assert_eq!(mirai.threat_type, ThreatType::Botnet);
    assert_eq!(mirai.confidence_level, ConfidenceLevel::High);
    assert_eq!(mirai.description, "Mirai C2 & loader");
    assert_eq!(mirai.detection_date, "2026-10-15");
    assert_eq!(result.entries[1].threat_type, ThreatType::Spam);
    assert_eq!(result.entries[1].confidence_level, ConfidenceLevel::Medium);
}

#[tokio::test]
async fn json_and_log_feeds_are_cleaned() {
    let json_source = file_source("json_feed", fixtures().join("feeds/indicators.json"));
    let json_result = clean(&json_source).await;
    assert_eq!(json_result.stats.total_processed, 3);
    assert_eq!(json_result.stats.valid_ips, 3);
    assert_eq!(json_result.entries[0].threat_type, ThreatType::Phishing);
    assert_eq!(json_result.entries[1].ip, "2a06:98c0:3600::103");
    assert_eq!(json_result.entries[1].confidence_level, ConfidenceLevel::Low);

    let log_source = file_source("bastion_auth", fixtures().join("feeds/auth.log"));
    let records = log_source.fetch_data().await.expect("fetch");
    assert_eq!(records[0].metadata["occurrences"], 2);
    let log_result = clean(&log_source).await;
    assert_eq!(log_result.stats.valid_ips, 2);
    assert_eq!(log_result.stats.invalid_ips, 1);
}

#[tokio::test]
async fn otp_backup_replay_feeds_the_store() {
    let mut config = SourceConfig::new("otp_portal").with_settings(json!({
        "username": "analyst",
        "password": "secret",
        "backup_dir": fixtures().join("otp_backup"),
    }));
    config.update_interval = 0;
    let source = registry().instantiate(config).expect("otp source");
    assert!(source.validate_config());

    let store = Arc::new(MemoryEntryStore::new());
    let records = source.fetch_data().await.expect("replay");
    assert!(records.iter().all(|r| r.metadata["replay"] == true));
    let loose = records.iter().map(|r| r.to_loose()).collect::<Vec<_>>();
    let result = CleaningPipeline::new("otp_portal", ScoringConfig::default())
        .with_store(store.clone())
        .process_batch(&loose)
        .await;

    assert_eq!(result.stats.saved, 2);
    let stored = store.get("103.145.13.200", "OTP_PORTAL").await.expect("stored");
    assert_eq!(stored.source_tag, "OTP_PORTAL_CLEANED");
    assert_eq!(stored.entry.threat_type, ThreatType::Malware);
    assert_eq!(stored.entry.description, "Ransomware staging");
}

#[test]
fn portal_fixture_uses_structured_extraction() {
    let html = std::fs::read_to_string(fixtures().join("portal/blacklist_page1.html")).expect("fixture");
    let (strategy, rows) = extract_portal_rows(&html);
    assert_eq!(strategy, ExtractionStrategy::Structured);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].ip, "80.94.95.15");
    assert_eq!(rows[1].threat.as_deref(), Some("phishing"));
}
