//! HTTP fetch utilities, captured-export storage and persistence collaborators.

mod artifact;
mod http;
mod store;

pub use artifact::{ArtifactStore, StoredArtifact};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchOptions, FetchedResponse,
    HttpClientConfig, HttpFetchError, HttpFetcher, RetryDisposition,
};
pub use store::{EntryStore, MemoryEntryStore, PgEntryStore, StoredEntry};

pub const CRATE_NAME: &str = "iprep-storage";
