//! Directory tree helpers shared by the local backends.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

/// Size and content hash of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub size: u64,
    pub hash: String,
}

/// Files of a tree keyed by `/`-separated relative path.
pub type Listing = BTreeMap<String, FileEntry>;

/// Turn a configured location into a local path. Accepts `file://` URIs.
pub fn local_path(location: &str) -> PathBuf {
    PathBuf::from(location.strip_prefix("file://").unwrap_or(location))
}

fn relative_key(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Hash every regular file below `root`. Paths listed in `skip` are ignored.
pub async fn scan(root: &Path, skip: &[&str]) -> io::Result<Listing> {
    let mut listing = Listing::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(rel_dir) = pending.pop() {
        let mut entries = fs::read_dir(root.join(&rel_dir)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let rel = rel_dir.join(entry.file_name());
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push(rel);
            } else if file_type.is_file() {
                let key = relative_key(&rel);
                if skip.contains(&key.as_str()) {
                    continue;
                }
                let data = fs::read(entry.path()).await?;
                listing.insert(
                    key,
                    FileEntry {
                        size: data.len() as u64,
                        hash: hex::encode(Sha256::digest(&data)),
                    },
                );
            } else {
                debug!("Skipping non-regular file {}", rel.display());
            }
        }
    }

    Ok(listing)
}

/// Short digest identifying the content of a listing.
pub fn digest(listing: &Listing) -> String {
    let mut hasher = Sha256::new();
    for (path, entry) in listing {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(entry.hash.as_bytes());
        hasher.update(b"\n");
    }
    let mut full = hex::encode(hasher.finalize());
    full.truncate(16);
    full
}

/// Copy the tree at `from` into `to` (created if missing). Returns the bytes copied.
pub async fn copy_tree(from: &Path, to: &Path) -> io::Result<u64> {
    let mut copied = 0u64;
    let mut pending = vec![PathBuf::new()];
    fs::create_dir_all(to).await?;

    while let Some(rel_dir) = pending.pop() {
        let mut entries = fs::read_dir(from.join(&rel_dir)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let rel = rel_dir.join(entry.file_name());
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                fs::create_dir_all(to.join(&rel)).await?;
                pending.push(rel);
            } else if file_type.is_file() {
                copied += fs::copy(entry.path(), to.join(&rel)).await?;
            }
        }
    }

    Ok(copied)
}

pub async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sibling path of `path` named `.<name>.<suffix>`.
pub fn sibling(path: &Path, suffix: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy();
    Some(path.with_file_name(format!(".{}.{}", name, suffix)))
}

/// Replace `target` with the fully prepared `staged` directory.
///
/// The previous `target` is moved aside first and restored if the swap
/// fails, so `target` is either the old tree or the new one.
pub async fn swap_in(staged: &Path, target: &Path, aside: &Path) -> io::Result<()> {
    remove_dir_if_exists(aside).await?;

    let had_target = fs::try_exists(target).await?;
    if had_target {
        fs::rename(target, aside).await?;
    }

    if let Err(e) = fs::rename(staged, target).await {
        if had_target {
            if let Err(restore) = fs::rename(aside, target).await {
                warn!(
                    "Failed to restore {} after a failed swap: {}",
                    target.display(),
                    restore
                );
            }
        }
        return Err(e);
    }

    if had_target {
        if let Err(e) = remove_dir_if_exists(aside).await {
            warn!("Failed to remove {}: {}", aside.display(), e);
        }
    }
    Ok(())
}
