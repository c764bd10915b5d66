//! Source refresh orchestration, configuration and the cleaning pipeline.

pub mod config;
pub mod manager;
pub mod pipeline;
mod scheduler;

pub use config::{IprepConfig, ManagerFile, DEFAULT_CONFIG};
pub use manager::{RunSummary, SourceManager, SourceRunResult, SourceStatus};
pub use pipeline::{BatchResult, CleaningPipeline, IpRejection, RecordError, ScoringConfig};
pub use scheduler::maybe_build_scheduler;

pub const CRATE_NAME: &str = "iprep-sync";
