use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A workspace discovered by a source, before it is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    /// Unique within the site
    pub key: String,
    /// Opaque backend locator (filesystem path, repository ref, object prefix, ...)
    pub location_handle: String,
}

/// Content made available by a successful mount or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountedContent {
    /// Local directory holding the workspace content
    pub root: PathBuf,
    /// Backend revision of the content, when the backend has one
    pub revision: Option<String>,
}

/// Backend that enumerates, mounts and refreshes the workspaces of one site.
///
/// Implementations cover local folders, version-controlled working copies,
/// object stores and so on. The core only relies on this contract:
/// - `list_workspaces` is pure discovery and all-or-nothing
/// - `mount_workspace` is idempotent
/// - `update` either applies completely or leaves the mounted content untouched
#[async_trait]
pub trait WorkspaceSource: Send + Sync {
    /// Type identifier this source was registered under.
    fn source_type(&self) -> &str;

    /// Enumerate the workspaces visible under this source's configuration.
    ///
    /// Every call enumerates again from scratch.
    ///
    /// # Errors
    /// `SyncError::SourceUnavailable` if the backend cannot be reached or read.
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceDescriptor>, SyncError>;

    /// Prepare a workspace's content for read/write access.
    ///
    /// # Errors
    /// `SyncError::Mount` carrying the backend cause.
    async fn mount_workspace(&self, workspace_key: &str) -> Result<MountedContent, SyncError>;

    /// Refresh mounted content to the latest backend state.
    ///
    /// # Errors
    /// `SyncError::Refresh`; the previously mounted content must be left intact.
    async fn update(&self, workspace_key: &str) -> Result<MountedContent, SyncError>;

    /// Release whatever the mount acquired (locks, checkouts).
    async fn unmount_workspace(&self, _workspace_key: &str) -> Result<(), SyncError> {
        Ok(())
    }
}
