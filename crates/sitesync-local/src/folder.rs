use std::path::PathBuf;

use async_trait::async_trait;
use sitesync_core::{
    MountedContent, SourceDescriptor, SyncError, WorkspaceDescriptor, WorkspaceSource,
};
use tokio::fs;
use tracing::{debug, instrument};

use crate::tree;

/// Key of the single workspace a folder source exposes.
pub const FOLDER_WORKSPACE: &str = "source";

/// Local folder source.
///
/// The configured directory is the content: it exposes exactly one workspace,
/// `source`, mounted in place. Nothing is copied, so mounting and refreshing
/// only check the directory and compute a content revision.
#[derive(Debug, Clone)]
pub struct FolderSource {
    root: PathBuf,
}

impl FolderSource {
    pub const TYPE: &'static str = "folder";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_descriptor(descriptor: &SourceDescriptor) -> Result<Self, SyncError> {
        if descriptor.location.trim().is_empty() {
            return Err(SyncError::Configuration(
                "folder source requires a location".to_string(),
            ));
        }
        Ok(Self::new(tree::local_path(&descriptor.location)))
    }

    async fn check_root(&self) -> Result<(), SyncError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SyncError::SourceUnavailable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(SyncError::SourceUnavailable(format!(
                "Cannot read {}: {}",
                self.root.display(),
                e
            ))),
        }
    }

    async fn content(&self, key: &str) -> Result<MountedContent, SyncError> {
        if key != FOLDER_WORKSPACE {
            return Err(SyncError::NotFound(format!(
                "workspace '{}' in folder {}",
                key,
                self.root.display()
            )));
        }
        self.check_root().await?;

        let listing = tree::scan(&self.root, &[]).await.map_err(|e| {
            SyncError::Io(format!("Failed to scan {}: {}", self.root.display(), e))
        })?;
        debug!(
            "Folder {} holds {} file(s)",
            self.root.display(),
            listing.len()
        );

        Ok(MountedContent {
            root: self.root.clone(),
            revision: Some(tree::digest(&listing)),
        })
    }
}

#[async_trait]
impl WorkspaceSource for FolderSource {
    fn source_type(&self) -> &str {
        Self::TYPE
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceDescriptor>, SyncError> {
        self.check_root().await?;
        Ok(vec![WorkspaceDescriptor {
            key: FOLDER_WORKSPACE.to_string(),
            location_handle: self.root.display().to_string(),
        }])
    }

    #[instrument(skip(self), level = "debug")]
    async fn mount_workspace(&self, key: &str) -> Result<MountedContent, SyncError> {
        self.content(key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn update(&self, key: &str) -> Result<MountedContent, SyncError> {
        self.content(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_single_source_workspace() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "hello").await.unwrap();
        let source = FolderSource::new(dir.path());

        let listed = source.list_workspaces().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "source");

        let content = source.mount_workspace("source").await.unwrap();
        assert_eq!(content.root, dir.path());
        assert!(content.revision.is_some());
    }

    #[tokio::test]
    async fn test_revision_follows_edits() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "v1").await.unwrap();
        let source = FolderSource::new(dir.path());

        let first = source.mount_workspace("source").await.unwrap();
        fs::write(dir.path().join("a.md"), "v2").await.unwrap();
        let second = source.update("source").await.unwrap();
        assert_ne!(first.revision, second.revision);
    }

    #[tokio::test]
    async fn test_missing_folder_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let source = FolderSource::new(dir.path().join("missing"));

        let err = source.list_workspaces().await.unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unknown_workspace() {
        let dir = TempDir::new().unwrap();
        let source = FolderSource::new(dir.path());
        let err = source.mount_workspace("drafts").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_from_descriptor() {
        let ok = FolderSource::from_descriptor(&SourceDescriptor::new("folder", "file:///srv/docs"))
            .unwrap();
        assert_eq!(ok.root, PathBuf::from("/srv/docs"));

        let err = FolderSource::from_descriptor(&SourceDescriptor::new("folder", " ")).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_conformance() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("css")).await.unwrap();
        fs::write(dir.path().join("css/site.css"), "body{}").await.unwrap();

        let mounted = sitesync_core::conformance::check_source(&FolderSource::new(dir.path())).await;
        assert_eq!(mounted.len(), 1);
    }
}
