use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::TargetDescriptor;
use crate::error::SyncError;

/// The mounted content of a workspace handed to a publisher.
///
/// Taken while the site lock is held, so the content does not change while
/// the publisher reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub site_key: String,
    pub workspace_key: String,
    /// Local directory holding the content to publish
    pub root: PathBuf,
    pub revision: Option<String>,
}

/// Result of a successful publish run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub files_changed: u64,
    pub bytes_transferred: u64,
    pub warnings: Vec<String>,
}

/// Transfers workspace content to one destination.
///
/// `publish` must be safe to call again after a failure: either an idempotent
/// overwrite or a transactional transfer. When `cancel` fires the publisher
/// stops at its next safe checkpoint and returns `SyncError::Cancelled`,
/// leaving the destination as it was before the run.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Type identifier this publisher was registered under.
    fn target_type(&self) -> &str;

    /// Run one synchronization against `destination`.
    ///
    /// # Errors
    /// - `SyncError::Authentication`: bad credentials, not retried
    /// - `SyncError::Connectivity`: remote unavailable, retried by the coordinator
    /// - `SyncError::Conflict`: destination changed by another actor
    /// - `SyncError::PartialTransfer`: itemized per-file failures
    async fn publish(
        &self,
        snapshot: &WorkspaceSnapshot,
        destination: &TargetDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome, SyncError>;
}
