use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use sitesync_core::{
    CancellationToken, PublishOutcome, Publisher, SyncError, TargetDescriptor, WorkspaceSnapshot,
};
use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::tree::{self, Listing};

/// Name of the deployment manifest written into the destination.
pub const MANIFEST_FILE: &str = ".sitesync-manifest.json";

/// Local directory deployment target.
///
/// A publish stages the full snapshot next to the destination and swaps it
/// in, so the destination only ever shows a complete deployment. The
/// destination carries a manifest of what was deployed; when its files no
/// longer match the manifest (someone edited the live directory) the publish
/// fails with `Conflict` unless the target sets the `force` option.
///
/// Publishing content identical to the destination changes nothing.
#[derive(Debug, Clone, Default)]
pub struct FolderPublisher;

impl FolderPublisher {
    pub const TYPE: &'static str = "folder";

    pub fn new() -> Self {
        Self
    }

    pub fn from_descriptor(target: &TargetDescriptor) -> Result<Self, SyncError> {
        if target.destination.trim().is_empty() {
            return Err(SyncError::Configuration(
                "folder publisher requires a destination".to_string(),
            ));
        }
        Ok(Self::new())
    }
}

/// Paths the publisher works with for one destination.
struct Layout {
    destination: PathBuf,
    staging: PathBuf,
    previous: PathBuf,
    lock: PathBuf,
}

impl Layout {
    fn for_target(target: &TargetDescriptor) -> Result<Self, SyncError> {
        let destination = tree::local_path(&target.destination);
        let invalid = || {
            SyncError::Configuration(format!(
                "invalid publish destination {}",
                destination.display()
            ))
        };
        Ok(Self {
            staging: tree::sibling(&destination, "staging").ok_or_else(invalid)?,
            previous: tree::sibling(&destination, "previous").ok_or_else(invalid)?,
            lock: tree::sibling(&destination, "lock").ok_or_else(invalid)?,
            destination,
        })
    }
}

/// Exclusive advisory lock on a destination, held for a whole publish.
struct DestinationLock {
    file: File,
}

impl DestinationLock {
    fn acquire(path: &Path) -> Result<Self, SyncError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                SyncError::Io(format!("Failed to open lock file {}: {}", path.display(), e))
            })?;

        file.try_lock_exclusive().map_err(|_| {
            SyncError::Conflict(format!(
                "{} is locked by another publisher",
                path.display()
            ))
        })?;
        Ok(Self { file })
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release destination lock: {}", e);
        }
    }
}

fn io_error(context: &str, path: &Path, e: std::io::Error) -> SyncError {
    SyncError::Io(format!("{} {}: {}", context, path.display(), e))
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

async fn read_manifest(destination: &Path) -> Result<Option<BTreeMap<String, String>>, SyncError> {
    let path = destination.join(MANIFEST_FILE);
    match fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            SyncError::Conflict(format!("unreadable manifest {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("Failed to read", &path, e)),
    }
}

fn hashes(listing: &Listing) -> BTreeMap<String, String> {
    listing
        .iter()
        .map(|(path, entry)| (path.clone(), entry.hash.clone()))
        .collect()
}

/// Files of `live` that differ from what `manifest` says was deployed.
fn drifted(live: &Listing, manifest: &BTreeMap<String, String>) -> Vec<String> {
    let mut paths: Vec<String> = live
        .iter()
        .filter(|(path, entry)| manifest.get(*path) != Some(&entry.hash))
        .map(|(path, _)| path.clone())
        .collect();
    paths.extend(
        manifest
            .keys()
            .filter(|path| !live.contains_key(*path))
            .cloned(),
    );
    paths.sort();
    paths
}

#[async_trait]
impl Publisher for FolderPublisher {
    fn target_type(&self) -> &str {
        Self::TYPE
    }

    #[instrument(skip(self, snapshot, destination, cancel), fields(site = %snapshot.site_key, dest = %destination.destination), level = "debug")]
    async fn publish(
        &self,
        snapshot: &WorkspaceSnapshot,
        destination: &TargetDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome, SyncError> {
        checkpoint(cancel)?;
        let layout = Layout::for_target(destination)?;
        let force = destination.option_bool("force");

        if let Some(parent) = layout.destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("Failed to create", parent, e))?;
        }
        let _lock = DestinationLock::acquire(&layout.lock)?;

        let source = tree::scan(&snapshot.root, &[])
            .await
            .map_err(|e| io_error("Failed to scan snapshot", &snapshot.root, e))?;

        let exists = fs::try_exists(&layout.destination)
            .await
            .map_err(|e| io_error("Failed to check", &layout.destination, e))?;
        let live = if exists {
            tree::scan(&layout.destination, &[MANIFEST_FILE])
                .await
                .map_err(|e| io_error("Failed to scan destination", &layout.destination, e))?
        } else {
            Listing::new()
        };

        let mut warnings = Vec::new();
        let manifest = if exists {
            read_manifest(&layout.destination).await?
        } else {
            None
        };
        let drift = match &manifest {
            Some(manifest) => drifted(&live, manifest),
            // An unmanaged directory counts as drifted when it has content
            None => live.keys().cloned().collect(),
        };
        if !drift.is_empty() {
            if !force {
                return Err(SyncError::Conflict(format!(
                    "{} changed outside of sitesync ({} file(s), e.g. {})",
                    layout.destination.display(),
                    drift.len(),
                    drift[0]
                )));
            }
            warnings.push(format!(
                "Overwrote {} externally modified file(s) in {}",
                drift.len(),
                layout.destination.display()
            ));
        }

        let changed: Vec<&String> = source
            .iter()
            .filter(|(path, entry)| live.get(*path).map(|l| &l.hash) != Some(&entry.hash))
            .map(|(path, _)| path)
            .collect();
        let removed = live.keys().filter(|path| !source.contains_key(*path)).count();
        let files_changed = (changed.len() + removed) as u64;
        let bytes_transferred: u64 = changed.iter().map(|path| source[*path].size).sum();

        // Drifted destinations are redeployed so the manifest matches again
        if files_changed == 0 && manifest.is_some() && drift.is_empty() {
            debug!("{} is up to date", layout.destination.display());
            return Ok(PublishOutcome {
                files_changed: 0,
                bytes_transferred: 0,
                warnings,
            });
        }

        checkpoint(cancel)?;
        tree::remove_dir_if_exists(&layout.staging)
            .await
            .map_err(|e| io_error("Failed to clear", &layout.staging, e))?;
        let staged = async {
            tree::copy_tree(&snapshot.root, &layout.staging).await?;
            let manifest = serde_json::to_vec_pretty(&hashes(&source))
                .map_err(std::io::Error::other)?;
            fs::write(layout.staging.join(MANIFEST_FILE), manifest).await
        }
        .await;

        let staged = staged
            .map_err(|e| io_error("Failed to stage", &layout.staging, e))
            .and_then(|()| checkpoint(cancel));
        if let Err(e) = staged {
            // Destination was never touched
            if let Err(cleanup) = tree::remove_dir_if_exists(&layout.staging).await {
                warn!("Failed to remove {}: {}", layout.staging.display(), cleanup);
            }
            return Err(e);
        }

        tree::swap_in(&layout.staging, &layout.destination, &layout.previous)
            .await
            .map_err(|e| io_error("Failed to swap in", &layout.destination, e))?;

        debug!(
            "Deployed {} to {}: {} changed, {} removed",
            snapshot.workspace_key,
            layout.destination.display(),
            changed.len(),
            removed
        );

        Ok(PublishOutcome {
            files_changed,
            bytes_transferred,
            warnings,
        })
    }
}
