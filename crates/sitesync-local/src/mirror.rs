use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sitesync_core::{
    MountedContent, SourceDescriptor, SyncError, WorkspaceDescriptor, WorkspaceSource,
};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::tree;

/// Workspace key used when no branches are configured.
pub const DEFAULT_BRANCH: &str = "main";

/// Mirror source: working copies of an upstream directory.
///
/// Each workspace is a branch. With a `branches` option every listed name is
/// a subdirectory of the upstream; without it the whole upstream is the
/// single branch `main`. Working copies live below `workdir`:
/// ```text
/// {workdir}/
/// ├── main/              # committed working copy
/// ├── .main.staging/     # refresh in progress
/// └── .main.previous/    # old copy during the swap
/// ```
/// A refresh copies the upstream into the staging directory and swaps it in
/// only once the copy is complete, so a failed refresh leaves the working
/// copy untouched.
#[derive(Debug, Clone)]
pub struct MirrorSource {
    upstream: PathBuf,
    workdir: PathBuf,
    branches: Vec<String>,
}

impl MirrorSource {
    pub const TYPE: &'static str = "mirror";

    pub fn new(upstream: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            upstream: upstream.into(),
            workdir: workdir.into(),
            branches: Vec::new(),
        }
    }

    pub fn with_branches(mut self, branches: Vec<String>) -> Self {
        self.branches = branches;
        self
    }

    /// Build from a descriptor.
    ///
    /// Options: `workdir` (defaults to a directory under the system temp dir
    /// derived from the location) and `branches` (array of names).
    pub fn from_descriptor(descriptor: &SourceDescriptor) -> Result<Self, SyncError> {
        if descriptor.location.trim().is_empty() {
            return Err(SyncError::Configuration(
                "mirror source requires a location".to_string(),
            ));
        }
        let upstream = tree::local_path(&descriptor.location);

        let workdir = match descriptor.option_str("workdir") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let id = hex::encode(Sha256::digest(descriptor.location.as_bytes()));
                std::env::temp_dir().join("sitesync-mirror").join(&id[..16])
            }
        };

        let branches = match descriptor.options.get("branches") {
            None => Vec::new(),
            Some(value) => {
                let names = value.as_array().ok_or_else(|| {
                    SyncError::Configuration("mirror option 'branches' must be an array".into())
                })?;
                names
                    .iter()
                    .map(|name| {
                        name.as_str()
                            .filter(|n| is_valid_branch(n))
                            .map(str::to_string)
                            .ok_or_else(|| {
                                SyncError::Configuration(format!(
                                    "invalid mirror branch name: {}",
                                    name
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(Self::new(upstream, workdir).with_branches(branches))
    }

    /// Directory holding the committed working copy of `key`.
    pub fn working_copy(&self, key: &str) -> PathBuf {
        self.workdir.join(key)
    }

    fn branch_keys(&self) -> Vec<String> {
        if self.branches.is_empty() {
            vec![DEFAULT_BRANCH.to_string()]
        } else {
            self.branches.clone()
        }
    }

    fn upstream_of(&self, key: &str) -> Result<PathBuf, SyncError> {
        if self.branches.is_empty() && key == DEFAULT_BRANCH {
            return Ok(self.upstream.clone());
        }
        if self.branches.iter().any(|b| b == key) {
            return Ok(self.upstream.join(key));
        }
        Err(SyncError::NotFound(format!(
            "branch '{}' of mirror {}",
            key,
            self.upstream.display()
        )))
    }

    async fn check_dir(path: &Path) -> Result<(), SyncError> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SyncError::SourceUnavailable(format!(
                "{} is not a directory",
                path.display()
            ))),
            Err(e) => Err(SyncError::SourceUnavailable(format!(
                "Cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn committed(&self, key: &str) -> Result<MountedContent, SyncError> {
        let root = self.working_copy(key);
        let listing = tree::scan(&root, &[])
            .await
            .map_err(|e| SyncError::Io(format!("Failed to scan {}: {}", root.display(), e)))?;
        Ok(MountedContent {
            root,
            revision: Some(tree::digest(&listing)),
        })
    }

    /// Copy the upstream into staging, then swap it in.
    async fn checkout(&self, key: &str) -> Result<MountedContent, SyncError> {
        let upstream = self.upstream_of(key)?;
        Self::check_dir(&upstream).await?;

        let target = self.working_copy(key);
        let (staged, aside) = match (tree::sibling(&target, "staging"), tree::sibling(&target, "previous")) {
            (Some(staged), Some(aside)) => (staged, aside),
            _ => {
                return Err(SyncError::Configuration(format!(
                    "invalid working copy path {}",
                    target.display()
                )))
            }
        };

        fs::create_dir_all(&self.workdir).await.map_err(|e| {
            SyncError::Io(format!(
                "Failed to create workdir {}: {}",
                self.workdir.display(),
                e
            ))
        })?;
        tree::remove_dir_if_exists(&staged).await?;

        let copied = match tree::copy_tree(&upstream, &staged).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // Working copy was never touched
                if let Err(cleanup) = tree::remove_dir_if_exists(&staged).await {
                    warn!("Failed to remove {}: {}", staged.display(), cleanup);
                }
                return Err(SyncError::Io(format!(
                    "Failed to copy {}: {}",
                    upstream.display(),
                    e
                )));
            }
        };

        tree::swap_in(&staged, &target, &aside).await.map_err(|e| {
            SyncError::Io(format!(
                "Failed to swap in working copy {}: {}",
                target.display(),
                e
            ))
        })?;

        debug!(
            "Checked out {} ({} bytes) into {}",
            upstream.display(),
            copied,
            target.display()
        );
        self.committed(key).await
    }
}

fn is_valid_branch(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
}

#[async_trait]
impl WorkspaceSource for MirrorSource {
    fn source_type(&self) -> &str {
        Self::TYPE
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceDescriptor>, SyncError> {
        Self::check_dir(&self.upstream).await?;

        let mut descriptors = Vec::new();
        for key in self.branch_keys() {
            let upstream = self.upstream_of(&key)?;
            Self::check_dir(&upstream).await?;
            descriptors.push(WorkspaceDescriptor {
                key,
                location_handle: upstream.display().to_string(),
            });
        }
        Ok(descriptors)
    }

    /// Reuses an existing working copy; otherwise checks one out.
    #[instrument(skip(self), level = "debug")]
    async fn mount_workspace(&self, key: &str) -> Result<MountedContent, SyncError> {
        self.upstream_of(key)?;
        let working_copy = self.working_copy(key);
        let exists = fs::try_exists(&working_copy).await.map_err(|e| {
            SyncError::Io(format!("Failed to check {}: {}", working_copy.display(), e))
        })?;
        if exists {
            info!("Reusing working copy of {} in {}", key, self.workdir.display());
            return self.committed(key).await;
        }
        self.checkout(key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn update(&self, key: &str) -> Result<MountedContent, SyncError> {
        self.checkout(key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn unmount_workspace(&self, key: &str) -> Result<(), SyncError> {
        let target = self.working_copy(key);
        tree::remove_dir_if_exists(&target).await.map_err(|e| {
            SyncError::Io(format!(
                "Failed to remove working copy {}: {}",
                target.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        upstream: PathBuf,
        workdir: PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream");
        let workdir = dir.path().join("work");
        fs::create_dir_all(upstream.join("main")).await.unwrap();
        fs::create_dir_all(upstream.join("next")).await.unwrap();
        fs::write(upstream.join("main/index.html"), "v1").await.unwrap();
        fs::write(upstream.join("next/index.html"), "v2-preview").await.unwrap();
        Fixture {
            _dir: dir,
            upstream,
            workdir,
        }
    }

    #[tokio::test]
    async fn test_branches_are_workspaces() {
        let fx = fixture().await;
        let source = MirrorSource::new(&fx.upstream, &fx.workdir)
            .with_branches(vec!["main".into(), "next".into()]);

        let keys: Vec<String> = source
            .list_workspaces()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["main", "next"]);

        let content = source.mount_workspace("next").await.unwrap();
        assert_eq!(content.root, fx.workdir.join("next"));
        assert_eq!(
            fs::read_to_string(content.root.join("index.html")).await.unwrap(),
            "v2-preview"
        );
    }

    #[tokio::test]
    async fn test_update_swaps_in_new_content() {
        let fx = fixture().await;
        let source = MirrorSource::new(fx.upstream.join("main"), &fx.workdir);

        let first = source.mount_workspace("main").await.unwrap();
        fs::write(fx.upstream.join("main/index.html"), "v3").await.unwrap();
        fs::write(fx.upstream.join("main/new.html"), "new").await.unwrap();

        let second = source.update("main").await.unwrap();
        assert_ne!(first.revision, second.revision);
        assert_eq!(
            fs::read_to_string(second.root.join("index.html")).await.unwrap(),
            "v3"
        );
        assert!(second.root.join("new.html").exists());
        assert!(!fx.workdir.join(".main.staging").exists());
    }

    #[tokio::test]
    async fn test_failed_update_keeps_working_copy() {
        let fx = fixture().await;
        let source = MirrorSource::new(fx.upstream.join("main"), &fx.workdir);
        let mounted = source.mount_workspace("main").await.unwrap();

        fs::remove_dir_all(fx.upstream.join("main")).await.unwrap();
        let err = source.update("main").await.unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable(_)));

        assert_eq!(
            fs::read_to_string(mounted.root.join("index.html")).await.unwrap(),
            "v1"
        );
        let after = source.committed("main").await.unwrap();
        assert_eq!(after.revision, mounted.revision);
    }

    #[tokio::test]
    async fn test_unmount_removes_working_copy() {
        let fx = fixture().await;
        let source = MirrorSource::new(fx.upstream.join("main"), &fx.workdir);
        let mounted = source.mount_workspace("main").await.unwrap();
        assert!(mounted.root.exists());

        source.unmount_workspace("main").await.unwrap();
        assert!(!mounted.root.exists());
    }

    #[test]
    fn test_from_descriptor_options() {
        let descriptor = SourceDescriptor::new("mirror", "/srv/upstream")
            .with_option("workdir", "/var/cache/sitesync")
            .with_option("branches", serde_json::json!(["main", "next"]));
        let source = MirrorSource::from_descriptor(&descriptor).unwrap();
        assert_eq!(source.working_copy("next"), PathBuf::from("/var/cache/sitesync/next"));
        assert_eq!(source.branch_keys(), vec!["main", "next"]);

        let bad = SourceDescriptor::new("mirror", "/srv/upstream")
            .with_option("branches", serde_json::json!(["../escape"]));
        assert!(matches!(
            MirrorSource::from_descriptor(&bad),
            Err(SyncError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_workdir_fails_mount() {
        let fx = fixture().await;
        fs::write(&fx.workdir, "not a directory").await.unwrap();
        let source = MirrorSource::new(fx.upstream.join("main"), &fx.workdir);

        let err = source.mount_workspace("main").await.unwrap_err();
        assert!(matches!(err, SyncError::Io(ref msg) if msg.starts_with("Failed to check")));
        assert_eq!(
            fs::read_to_string(&fx.workdir).await.unwrap(),
            "not a directory"
        );
    }

    #[tokio::test]
    async fn test_conformance() {
        let fx = fixture().await;
        let source = MirrorSource::new(&fx.upstream, &fx.workdir)
            .with_branches(vec!["main".into(), "next".into()]);
        let mounted = sitesync_core::conformance::check_source(&source).await;
        assert_eq!(mounted.len(), 2);
    }
}
