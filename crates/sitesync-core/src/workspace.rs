use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::source::{MountedContent, WorkspaceDescriptor};

/// Lifecycle state of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Unmounted,
    Mounting,
    Mounted,
    Refreshing,
    Failed,
}

impl WorkspaceState {
    /// Whether `self -> next` is allowed.
    ///
    /// Unmounted -> Mounting -> {Mounted, Failed}; Mounted -> Refreshing ->
    /// {Mounted, Failed}; a Failed workspace may be mounted again.
    pub fn can_transition_to(self, next: WorkspaceState) -> bool {
        use WorkspaceState::*;
        matches!(
            (self, next),
            (Unmounted, Mounting)
                | (Mounting, Mounted)
                | (Mounting, Failed)
                | (Mounted, Refreshing)
                | (Refreshing, Mounted)
                | (Refreshing, Failed)
                | (Failed, Mounting)
        )
    }

    /// Mounting and Refreshing: content may be about to change.
    pub fn is_transitional(self) -> bool {
        matches!(self, WorkspaceState::Mounting | WorkspaceState::Refreshing)
    }
}

/// One mountable unit of content of a site.
///
/// `content` always holds the last committed mount; while a refresh is in
/// flight it still points at the previous content and `state` says so.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub site_key: String,
    pub key: String,
    pub location_handle: String,
    pub state: WorkspaceState,
    pub content: Option<MountedContent>,
    pub last_error: Option<SyncError>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    fn discovered(site_key: &str, descriptor: WorkspaceDescriptor) -> Self {
        Self {
            site_key: site_key.to_string(),
            key: descriptor.key,
            location_handle: descriptor.location_handle,
            state: WorkspaceState::Unmounted,
            content: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.state == WorkspaceState::Mounted
    }

    /// Local directory of the committed content, if any.
    pub fn content_root(&self) -> Option<&Path> {
        self.content.as_ref().map(|c| c.root.as_path())
    }
}

/// Process-wide catalog of workspaces keyed by site.
///
/// Anyone holding the registry can read it. Writes go through a
/// [`RegistryWriter`], which only the source handle owning a site gets.
#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    /// site_key -> workspaces in listing order
    sites: DashMap<String, Vec<Workspace>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self {
            sites: DashMap::new(),
        }
    }

    /// Get one workspace.
    ///
    /// # Errors
    /// `SyncError::NotFound` if the site or workspace is unknown.
    pub fn get(&self, site_key: &str, workspace_key: &str) -> Result<Workspace, SyncError> {
        self.sites
            .get(site_key)
            .and_then(|list| list.iter().find(|w| w.key == workspace_key).cloned())
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "workspace '{}' of site '{}'",
                    workspace_key, site_key
                ))
            })
    }

    /// All workspaces of a site in listing order, `None` for an unknown site.
    pub fn list(&self, site_key: &str) -> Option<Vec<Workspace>> {
        self.sites.get(site_key).map(|list| list.clone())
    }

    /// Keys of all sites with a catalog entry, sorted.
    pub fn sites(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sites.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// First mounted workspace of a site.
    pub fn first_mounted(&self, site_key: &str) -> Option<Workspace> {
        self.sites
            .get(site_key)
            .and_then(|list| list.iter().find(|w| w.is_mounted()).cloned())
    }

    pub(crate) fn writer(self: &Arc<Self>, site_key: &str) -> RegistryWriter {
        RegistryWriter {
            registry: self.clone(),
            site_key: site_key.to_string(),
        }
    }
}

/// Write access to one site's catalog entry.
pub(crate) struct RegistryWriter {
    registry: Arc<WorkspaceRegistry>,
    site_key: String,
}

impl RegistryWriter {
    pub(crate) fn current(&self, workspace_key: &str) -> Result<Workspace, SyncError> {
        self.registry.get(&self.site_key, workspace_key)
    }

    /// Replace the site's catalog with a fresh listing.
    ///
    /// Workspaces whose key and location are unchanged keep their state.
    pub(crate) fn replace_all(&self, descriptors: Vec<WorkspaceDescriptor>) -> Vec<Workspace> {
        let previous = self
            .registry
            .sites
            .get(&self.site_key)
            .map(|list| list.clone())
            .unwrap_or_default();

        let workspaces: Vec<Workspace> = descriptors
            .into_iter()
            .map(|descriptor| {
                previous
                    .iter()
                    .find(|w| {
                        w.key == descriptor.key && w.location_handle == descriptor.location_handle
                    })
                    .cloned()
                    .unwrap_or_else(|| Workspace::discovered(&self.site_key, descriptor))
            })
            .collect();

        self.registry
            .sites
            .insert(self.site_key.clone(), workspaces.clone());
        workspaces
    }

    /// Move a workspace to `next`.
    ///
    /// `content` replaces the committed content when given; `None` keeps it.
    /// The error is recorded on the workspace (and cleared by a success).
    pub(crate) fn transition(
        &self,
        workspace_key: &str,
        next: WorkspaceState,
        content: Option<MountedContent>,
        error: Option<SyncError>,
    ) -> Result<Workspace, SyncError> {
        let mut list = self.registry.sites.get_mut(&self.site_key).ok_or_else(|| {
            SyncError::NotFound(format!("site '{}'", self.site_key))
        })?;

        let workspace = list
            .iter_mut()
            .find(|w| w.key == workspace_key)
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "workspace '{}' of site '{}'",
                    workspace_key, self.site_key
                ))
            })?;

        if !workspace.state.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                workspace: workspace_key.to_string(),
                from: workspace.state,
                to: next,
            });
        }

        workspace.state = next;
        if let Some(content) = content {
            workspace.content = Some(content);
        }
        match next {
            WorkspaceState::Failed => workspace.last_error = error,
            WorkspaceState::Mounted => workspace.last_error = None,
            _ => {}
        }
        workspace.updated_at = Utc::now();

        Ok(workspace.clone())
    }

    /// Drop the site's catalog entry.
    pub(crate) fn remove_site(&self) -> Option<Vec<Workspace>> {
        self.registry
            .sites
            .remove(&self.site_key)
            .map(|(_, list)| list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::PathBuf;

    fn descriptor(key: &str, handle: &str) -> WorkspaceDescriptor {
        WorkspaceDescriptor {
            key: key.to_string(),
            location_handle: handle.to_string(),
        }
    }

    fn content(root: &str) -> MountedContent {
        MountedContent {
            root: PathBuf::from(root),
            revision: None,
        }
    }

    #[rstest]
    #[case(WorkspaceState::Unmounted, WorkspaceState::Mounting, true)]
    #[case(WorkspaceState::Mounting, WorkspaceState::Mounted, true)]
    #[case(WorkspaceState::Mounting, WorkspaceState::Failed, true)]
    #[case(WorkspaceState::Mounted, WorkspaceState::Refreshing, true)]
    #[case(WorkspaceState::Refreshing, WorkspaceState::Mounted, true)]
    #[case(WorkspaceState::Refreshing, WorkspaceState::Failed, true)]
    #[case(WorkspaceState::Failed, WorkspaceState::Mounting, true)]
    #[case(WorkspaceState::Unmounted, WorkspaceState::Mounted, false)]
    #[case(WorkspaceState::Mounted, WorkspaceState::Mounting, false)]
    #[case(WorkspaceState::Refreshing, WorkspaceState::Unmounted, false)]
    #[case(WorkspaceState::Failed, WorkspaceState::Mounted, false)]
    #[case(WorkspaceState::Mounted, WorkspaceState::Mounted, false)]
    fn test_transition_rules(
        #[case] from: WorkspaceState,
        #[case] to: WorkspaceState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = WorkspaceRegistry::new();
        let err = registry.get("docs", "source").unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(registry.list("docs").is_none());
    }

    #[test]
    fn test_writer_lifecycle() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let writer = registry.writer("docs");

        let listed = writer.replace_all(vec![descriptor("source", "/srv/docs")]);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, WorkspaceState::Unmounted);

        writer
            .transition("source", WorkspaceState::Mounting, None, None)
            .unwrap();
        let mounted = writer
            .transition(
                "source",
                WorkspaceState::Mounted,
                Some(content("/srv/docs")),
                None,
            )
            .unwrap();
        assert!(mounted.is_mounted());

        // Refreshing keeps the committed content visible
        writer
            .transition("source", WorkspaceState::Refreshing, None, None)
            .unwrap();
        let during = registry.get("docs", "source").unwrap();
        assert_eq!(during.state, WorkspaceState::Refreshing);
        assert_eq!(during.content_root(), Some(Path::new("/srv/docs")));

        let failed = writer
            .transition(
                "source",
                WorkspaceState::Failed,
                None,
                Some(SyncError::Refresh {
                    workspace: "source".into(),
                    cause: "network".into(),
                }),
            )
            .unwrap();
        assert!(failed.last_error.is_some());
        assert_eq!(failed.content_root(), Some(Path::new("/srv/docs")));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let writer = registry.writer("docs");
        writer.replace_all(vec![descriptor("source", "/srv/docs")]);

        let err = writer
            .transition("source", WorkspaceState::Mounted, None, None)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
        assert_eq!(
            registry.get("docs", "source").unwrap().state,
            WorkspaceState::Unmounted
        );
    }

    #[test]
    fn test_relisting_keeps_unchanged_workspaces() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let writer = registry.writer("docs");
        writer.replace_all(vec![descriptor("source", "/a"), descriptor("draft", "/b")]);
        writer
            .transition("source", WorkspaceState::Mounting, None, None)
            .unwrap();

        let relisted = writer.replace_all(vec![descriptor("source", "/a"), descriptor("draft", "/c")]);
        assert_eq!(relisted[0].state, WorkspaceState::Mounting);
        assert_eq!(relisted[1].location_handle, "/c");
        assert_eq!(relisted[1].state, WorkspaceState::Unmounted);
    }

    #[test]
    fn test_remove_site() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let writer = registry.writer("docs");
        writer.replace_all(vec![descriptor("source", "/a")]);
        assert_eq!(registry.sites(), vec!["docs".to_string()]);

        writer.remove_site();
        assert!(registry.sites().is_empty());
    }
}
