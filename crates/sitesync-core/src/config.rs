use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Backend-specific parameters carried verbatim from the site configuration.
pub type Options = BTreeMap<String, serde_json::Value>;

/// Credentials for a source or publish target.
///
/// `Debug` never prints the secret.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Describes where a site's content comes from.
///
/// `path` and `uri` are accepted as aliases of `location` so both local and
/// remote sources read naturally in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Type identifier resolved through the provider registry
    #[serde(rename = "type")]
    pub source_type: String,
    /// Backend-specific locator (filesystem path, repository URL, bucket, ...)
    #[serde(alias = "path", alias = "uri")]
    pub location: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub options: Options,
}

impl SourceDescriptor {
    pub fn new(source_type: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            location: location.into(),
            credentials: None,
            options: Options::new(),
        }
    }

    /// Add a backend-specific option.
    pub fn with_option(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Read a string option.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

/// Describes one publish destination of a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Name of the target within the site (defaults to the type identifier)
    #[serde(default)]
    pub key: Option<String>,
    /// Type identifier resolved through the publisher registry
    #[serde(rename = "type")]
    pub target_type: String,
    /// Backend-specific destination (directory, host, remote URL, ...)
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Workspace to publish; the first mounted workspace of the site when unset
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub options: Options,
}

impl TargetDescriptor {
    pub fn new(target_type: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            key: None,
            target_type: target_type.into(),
            destination: destination.into(),
            credentials: None,
            workspace: None,
            options: Options::new(),
        }
    }

    /// Add a backend-specific option.
    pub fn with_option(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Returns the key used to identify this target: `key` if set, else the type.
    pub fn effective_key(&self) -> &str {
        self.key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.target_type)
    }

    /// Read a boolean option, `false` when absent.
    pub fn option_bool(&self, key: &str) -> bool {
        self.options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// A configured content project: one source and its publish targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfiguration {
    pub key: String,
    pub source: SourceDescriptor,
    #[serde(default)]
    pub publish: Vec<TargetDescriptor>,
}

impl SiteConfiguration {
    pub fn new(key: impl Into<String>, source: SourceDescriptor) -> Self {
        Self {
            key: key.into(),
            source,
            publish: Vec::new(),
        }
    }

    /// Find a publish target by its effective key.
    pub fn target(&self, key: &str) -> Option<&TargetDescriptor> {
        self.publish.iter().find(|t| t.effective_key() == key)
    }

    /// Reject descriptors that can never resolve.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.key.trim().is_empty() {
            return Err(SyncError::Configuration("site key is empty".to_string()));
        }
        if self.source.source_type.trim().is_empty() {
            return Err(SyncError::Configuration(format!(
                "site '{}' has a source without a type",
                self.key
            )));
        }
        if let Some(target) = self.publish.iter().find(|t| t.target_type.trim().is_empty()) {
            return Err(SyncError::Configuration(format!(
                "site '{}' has a publish target without a type (key {:?})",
                self.key, target.key
            )));
        }
        Ok(())
    }
}

/// Supplies site configurations. Implementations are read-only.
#[async_trait]
pub trait SiteConfigProvider: Send + Sync {
    /// Look up one site by key.
    async fn site(&self, key: &str) -> Result<Option<SiteConfiguration>, SyncError>;

    /// All configured sites.
    async fn sites(&self) -> Result<Vec<SiteConfiguration>, SyncError>;
}
