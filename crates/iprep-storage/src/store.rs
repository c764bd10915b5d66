use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use iprep_core::{CleanedEntry, UpsertOutcome};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Persistence collaborator. `(ip, source)` is the natural key; repeated calls with
/// overlapping entries must be safe.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn bulk_upsert(&self, entries: &[CleanedEntry], source_tag: &str) -> UpsertOutcome;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub entry: CleanedEntry,
    pub source_tag: String,
}

/// In-process store used for previews and tests.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    entries: Mutex<HashMap<(String, String), StoredEntry>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn get(&self, ip: &str, source: &str) -> Option<StoredEntry> {
        self.entries
            .lock()
            .await
            .get(&(ip.to_string(), source.to_string()))
            .cloned()
    }

    /// Snapshot sorted by `(ip, source)`.
    pub async fn snapshot(&self) -> Vec<StoredEntry> {
        let map = self.entries.lock().await;
        let mut out = map.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| (&a.entry.ip, &a.entry.source).cmp(&(&b.entry.ip, &b.entry.source)));
        out
    }
}

fn same_content(a: &CleanedEntry, b: &CleanedEntry) -> bool {
    a.entry_hash == b.entry_hash
        && a.detection_date == b.detection_date
        && a.description == b.description
        && a.threat_type == b.threat_type
        && a.confidence_level == b.confidence_level
        && a.risk_score == b.risk_score
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn bulk_upsert(&self, entries: &[CleanedEntry], source_tag: &str) -> UpsertOutcome {
        let mut map = self.entries.lock().await;
        let mut outcome = UpsertOutcome {
            success: true,
            ..Default::default()
        };
        for entry in entries {
            let key = (entry.ip.clone(), entry.source.clone());
            match map.get(&key) {
                Some(existing) if same_content(&existing.entry, entry) => outcome.skipped_count += 1,
                _ => {
                    map.insert(
                        key,
                        StoredEntry {
                            entry: entry.clone(),
                            source_tag: source_tag.to_string(),
                        },
                    );
                    outcome.imported_count += 1;
                }
            }
        }
        outcome
    }
}

const UPSERT_SQL: &str = r#"
INSERT INTO ip_reputation_entries (
    ip, source, category, detection_date, description, threat_type,
    confidence_level, entry_hash, risk_score, region_info, source_profile,
    source_tag, processed_at
)
VALUES ($1, $2, $3, $4::date, $5, $6, $7, $8, $9, $10, $11, $12, $13)
ON CONFLICT (ip, source) DO UPDATE SET
    category = EXCLUDED.category,
    detection_date = EXCLUDED.detection_date,
    description = EXCLUDED.description,
    threat_type = EXCLUDED.threat_type,
    confidence_level = EXCLUDED.confidence_level,
    entry_hash = EXCLUDED.entry_hash,
    risk_score = EXCLUDED.risk_score,
    region_info = EXCLUDED.region_info,
    source_profile = EXCLUDED.source_profile,
    source_tag = EXCLUDED.source_tag,
    processed_at = EXCLUDED.processed_at
WHERE ip_reputation_entries.detection_date IS DISTINCT FROM EXCLUDED.detection_date
   OR ip_reputation_entries.description IS DISTINCT FROM EXCLUDED.description
   OR ip_reputation_entries.threat_type IS DISTINCT FROM EXCLUDED.threat_type
   OR ip_reputation_entries.confidence_level IS DISTINCT FROM EXCLUDED.confidence_level
   OR ip_reputation_entries.risk_score IS DISTINCT FROM EXCLUDED.risk_score
"#;

/// Postgres-backed store. The `ip_reputation_entries` table, with a unique
/// constraint on `(ip, source)`, is provisioned outside this crate.
#[derive(Debug, Clone)]
pub struct PgEntryStore {
    pool: PgPool,
}

impl PgEntryStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    async fn upsert_in_transaction(
        &self,
        entries: &[CleanedEntry],
        source_tag: &str,
    ) -> Result<(usize, usize), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut imported = 0usize;
        let mut skipped = 0usize;
        for entry in entries {
            let result = sqlx::query(UPSERT_SQL)
                .bind(&entry.ip)
                .bind(&entry.source)
                .bind(entry.category.as_str())
                .bind(&entry.detection_date)
                .bind(&entry.description)
                .bind(entry.threat_type.as_str())
                .bind(entry.confidence_level.as_str())
                .bind(&entry.entry_hash)
                .bind(i16::from(entry.risk_score))
                .bind(Json(&entry.region_info))
                .bind(Json(&entry.source_profile))
                .bind(source_tag)
                .bind(entry.processed_at)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                imported += 1;
            } else {
                skipped += 1;
            }
        }
        tx.commit().await?;
        Ok((imported, skipped))
    }
}

#[async_trait]
impl EntryStore for PgEntryStore {
    async fn bulk_upsert(&self, entries: &[CleanedEntry], source_tag: &str) -> UpsertOutcome {
        match self.upsert_in_transaction(entries, source_tag).await {
            Ok((imported_count, skipped_count)) => {
                info!(source_tag, imported_count, skipped_count, "bulk upsert committed");
                UpsertOutcome {
                    success: true,
                    imported_count,
                    skipped_count,
                    error_count: 0,
                    error: None,
                }
            }
            Err(err) => {
                warn!(source_tag, error = %err, "bulk upsert rolled back");
                UpsertOutcome::failed(err.to_string(), entries.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use iprep_core::{
        AddressClass, ConfidenceLevel, ListCategory, RegionInfo, SourceProfile, ThreatType,
    };

    fn entry(ip: &str, source: &str, risk_score: u8) -> CleanedEntry {
        CleanedEntry {
            ip: ip.to_string(),
            source: source.to_string(),
            category: ListCategory::Blacklist,
            detection_date: "2026-02-24".to_string(),
            description: String::new(),
            threat_type: ThreatType::Blacklist,
            confidence_level: ConfidenceLevel::High,
            entry_hash: format!("hash-{ip}"),
            risk_score,
            region_info: RegionInfo {
                address_class: AddressClass::A,
                description: "class A".to_string(),
                heuristic: true,
            },
            source_profile: SourceProfile::unknown(),
            processed_at: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn memory_upsert_is_idempotent_per_ip_and_source() {
        let store = MemoryEntryStore::new();
        let batch = vec![entry("8.8.8.8", "TEST", 80), entry("1.1.1.1", "TEST", 70)];

        let first = store.bulk_upsert(&batch, "TEST_CLEANED").await;
        assert!(first.success);
        assert_eq!(first.imported_count, 2);

        let second = store.bulk_upsert(&batch, "TEST_CLEANED").await;
        assert_eq!(second.imported_count, 0);
        assert_eq!(second.skipped_count, 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn memory_upsert_updates_changed_rows_and_keeps_sources_apart() {
        let store = MemoryEntryStore::new();
        store.bulk_upsert(&[entry("8.8.8.8", "A", 60)], "A_CLEANED").await;
        let outcome = store
            .bulk_upsert(&[entry("8.8.8.8", "A", 90), entry("8.8.8.8", "B", 60)], "MIXED")
            .await;
        assert_eq!(outcome.imported_count, 2);
        assert_eq!(store.len().await, 2);
        let updated = store.get("8.8.8.8", "A").await.expect("stored");
        assert_eq!(updated.entry.risk_score, 90);
        assert_eq!(updated.source_tag, "MIXED");
    }
}
