use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One file that a publisher failed to transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    /// Path relative to the workspace content root
    pub path: String,
    /// Backend-specific reason
    pub reason: String,
}

/// Errors raised by registries, workspace sources, publishers and the coordinator.
///
/// The type is `Clone` so a failure can be attached to the `Workspace` or
/// `PublishJob` it belongs to and still be returned to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Type '{0}' is already registered with a different factory")]
    DuplicateType(String),

    #[error("Unknown type '{type_id}'. Available: {available}")]
    UnknownType { type_id: String, available: String },

    #[error("Failed to instantiate '{type_id}': {source}")]
    Instantiation {
        type_id: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Failed to mount workspace '{workspace}': {cause}")]
    Mount { workspace: String, cause: String },

    #[error("Failed to refresh workspace '{workspace}': {cause}")]
    Refresh { workspace: String, cause: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Destination changed concurrently: {0}")]
    Conflict(String),

    #[error("Partial transfer: {} file(s) transferred, {} failed", .transferred.len(), .failed.len())]
    PartialTransfer {
        transferred: Vec<String>,
        failed: Vec<TransferFailure>,
    },

    #[error("{operation} timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    #[error("A publish is already in progress for site '{site_key}'")]
    SyncBusy { site_key: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Workspace '{workspace}' of site '{site_key}' is not mounted")]
    NotMounted { site_key: String, workspace: String },

    #[error("Invalid workspace transition for '{workspace}': {from:?} -> {to:?}")]
    InvalidTransition {
        workspace: String,
        from: crate::WorkspaceState,
        to: crate::WorkspaceState,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),
}

impl SyncError {
    /// Whether the coordinator retries this error automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout { .. })
    }

    /// Whether the error comes from a bad or unresolvable configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateType(_)
                | Self::UnknownType { .. }
                | Self::Instantiation { .. }
                | Self::Configuration(_)
        )
    }

    /// Short machine-readable code, used in progress events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateType(_) => "DUPLICATE_TYPE",
            Self::UnknownType { .. } => "UNKNOWN_TYPE",
            Self::Instantiation { .. } => "INSTANTIATION",
            Self::Configuration(_) => "CONFIGURATION",
            Self::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            Self::Mount { .. } => "MOUNT",
            Self::Refresh { .. } => "REFRESH",
            Self::Authentication(_) => "AUTHENTICATION",
            Self::Connectivity(_) => "CONNECTIVITY",
            Self::Conflict(_) => "CONFLICT",
            Self::PartialTransfer { .. } => "PARTIAL_TRANSFER",
            Self::Timeout { .. } => "TIMEOUT",
            Self::SyncBusy { .. } => "SYNC_BUSY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotMounted { .. } => "NOT_MOUNTED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Cancelled => "CANCELLED",
            Self::Io(_) => "IO",
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
