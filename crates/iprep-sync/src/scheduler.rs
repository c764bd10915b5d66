use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::IprepConfig;
use crate::manager::SourceManager;

/// Builds a scheduler that refreshes every source on `config.sync_cron`, or
/// `None` when scheduling is disabled. The caller starts it.
pub async fn maybe_build_scheduler(
    config: &IprepConfig,
    manager: Arc<SourceManager>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let max_workers = config.max_workers;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let manager = Arc::clone(&manager);
        Box::pin(async move {
            let summary = manager.update_all_sources(max_workers).await;
            info!(
                successful_sources = summary.successful_sources,
                total_sources = summary.total_sources,
                total_cleaned = summary.total_cleaned,
                "scheduled refresh finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "source refresh scheduled");
    Ok(Some(sched))
}
