use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sitesync_core::{SiteConfigProvider, SiteConfiguration, SyncError};
use tokio::fs;
use tracing::{debug, instrument};

/// Site configurations read from a JSON file holding an array of sites.
///
/// The file is read on every call, so edits are picked up without a restart.
/// It is never written.
#[derive(Debug, Clone)]
pub struct JsonFileConfigProvider {
    path: PathBuf,
}

impl JsonFileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<SiteConfiguration>, SyncError> {
        let bytes = fs::read(&self.path).await.map_err(|e| {
            SyncError::Configuration(format!("Cannot read {}: {}", self.path.display(), e))
        })?;
        let sites: Vec<SiteConfiguration> = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::Configuration(format!("Invalid site file {}: {}", self.path.display(), e))
        })?;

        let mut keys = HashSet::new();
        for site in &sites {
            site.validate()?;
            if !keys.insert(site.key.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "site '{}' is defined twice in {}",
                    site.key,
                    self.path.display()
                )));
            }
        }

        debug!("Loaded {} site(s) from {}", sites.len(), self.path.display());
        Ok(sites)
    }
}

#[async_trait]
impl SiteConfigProvider for JsonFileConfigProvider {
    #[instrument(skip(self), level = "debug")]
    async fn site(&self, key: &str) -> Result<Option<SiteConfiguration>, SyncError> {
        Ok(self.load().await?.into_iter().find(|s| s.key == key))
    }

    #[instrument(skip(self), level = "debug")]
    async fn sites(&self) -> Result<Vec<SiteConfiguration>, SyncError> {
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn provider_with(json: &str) -> (JsonFileConfigProvider, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sites.json");
        fs::write(&path, json).await.unwrap();
        (JsonFileConfigProvider::new(path), dir)
    }

    #[tokio::test]
    async fn test_lookup_sites() {
        let (provider, _dir) = provider_with(
            r#"[
                { "key": "docs", "source": { "type": "folder", "path": "/srv/docs" },
                  "publish": [ { "type": "folder", "destination": "/var/www/docs" } ] },
                { "key": "blog", "source": { "type": "mirror", "uri": "/srv/blog" } }
            ]"#,
        )
        .await;

        assert_eq!(provider.sites().await.unwrap().len(), 2);
        let docs = provider.site("docs").await.unwrap().unwrap();
        assert_eq!(docs.publish.len(), 1);
        assert!(provider.site("wiki").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_site_keys_rejected() {
        let (provider, _dir) = provider_with(
            r#"[
                { "key": "docs", "source": { "type": "folder", "path": "/a" } },
                { "key": "docs", "source": { "type": "folder", "path": "/b" } }
            ]"#,
        )
        .await;
        assert!(matches!(
            provider.sites().await,
            Err(SyncError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_or_invalid_file() {
        let provider = JsonFileConfigProvider::new("/nonexistent/sites.json");
        assert!(matches!(
            provider.sites().await,
            Err(SyncError::Configuration(_))
        ));

        let (provider, _dir) = provider_with("{ not json").await;
        assert!(matches!(
            provider.site("docs").await,
            Err(SyncError::Configuration(_))
        ));
    }
}
