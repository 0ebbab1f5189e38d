use std::time::Duration;

use crate::WatchedKey;

/// Failures from the resource-type resolver.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid apiVersion: {0}")]
    InvalidApiVersion(String),
    #[error("resource type not served: {api_version}/{kind}")]
    NotFound { api_version: String, kind: String },
    #[error("discovery: {0}")]
    Discovery(#[source] anyhow::Error),
}

/// Failures reported by a resource cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache is already running")]
    AlreadyRunning,
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("watch: {0}")]
    Watch(#[source] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("configuration: cannot resolve {api_version}/{kind}: {source}")]
    UnresolvedResource {
        api_version: String,
        kind: String,
        #[source]
        source: ResolveError,
    },
    #[error("timed out after {after:?} waiting for caches to sync: {pending:?}")]
    SyncTimeout { after: Duration, pending: Vec<String> },
    #[error("watch {watch} failed before initial sync: {source}")]
    CacheFailed {
        watch: String,
        #[source]
        source: CacheError,
    },
    #[error("cancelled before caches synced")]
    Cancelled,
    #[error("dispatcher is already running")]
    AlreadyRunning,
    /// Object vanished from the mirror with no recoverable payload.
    #[error("stale event for {0}: no live or last known state")]
    Stale(WatchedKey),
}

impl DispatchError {
    /// Configuration errors are raised synchronously by registration and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, DispatchError::Configuration(_) | DispatchError::UnresolvedResource { .. })
    }

    /// Errors that abort `run` during startup.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            DispatchError::SyncTimeout { .. } | DispatchError::CacheFailed { .. } | DispatchError::Cancelled
        )
    }
}
