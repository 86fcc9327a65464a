use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::deadline::with_deadline;
use crate::error::SyncError;
use crate::events::{EventLevel, EventSink, Phase};
use crate::lock::SiteLocks;
use crate::source::WorkspaceSource;
use crate::workspace::{RegistryWriter, Workspace, WorkspaceState};

/// Owner of one site's workspace source.
///
/// Drives the workspace state machine around the source's backend calls and
/// is the only writer of the site's entry in the `WorkspaceRegistry`. Every
/// operation runs under the site lock.
pub struct SourceHandle {
    site_key: String,
    source: Arc<dyn WorkspaceSource>,
    writer: RegistryWriter,
    locks: Arc<SiteLocks>,
    events: EventSink,
}

impl SourceHandle {
    pub(crate) fn new(
        site_key: &str,
        source: Arc<dyn WorkspaceSource>,
        writer: RegistryWriter,
        locks: Arc<SiteLocks>,
        events: EventSink,
    ) -> Self {
        Self {
            site_key: site_key.to_string(),
            source,
            writer,
            locks,
            events,
        }
    }

    pub fn site_key(&self) -> &str {
        &self.site_key
    }

    pub fn source_type(&self) -> &str {
        self.source.source_type()
    }

    /// List the source's workspaces and record them in the registry.
    #[instrument(skip(self), fields(site = %self.site_key), level = "debug")]
    pub async fn discover(&self) -> Result<Vec<Workspace>, SyncError> {
        let _guard = self.locks.acquire(&self.site_key).await;

        let descriptors = match self.source.list_workspaces().await {
            Ok(d) => d,
            Err(e) => {
                self.events.emit(
                    &self.site_key,
                    Phase::Discover,
                    EventLevel::Error,
                    format!("Listing workspaces failed: {}", e),
                );
                return Err(e);
            }
        };

        let mut seen = HashSet::new();
        if let Some(dup) = descriptors.iter().find(|d| !seen.insert(d.key.as_str())) {
            let err = SyncError::SourceUnavailable(format!(
                "source listed workspace '{}' more than once",
                dup.key
            ));
            self.events.emit(
                &self.site_key,
                Phase::Discover,
                EventLevel::Error,
                err.to_string(),
            );
            return Err(err);
        }

        let workspaces = self.writer.replace_all(descriptors);
        self.events.emit(
            &self.site_key,
            Phase::Discover,
            EventLevel::Info,
            format!(
                "Discovered {} workspace(s) from {} source",
                workspaces.len(),
                self.source.source_type()
            ),
        );
        Ok(workspaces)
    }

    /// Mount a workspace. A workspace that is already mounted is left alone.
    #[instrument(skip(self), fields(site = %self.site_key), level = "debug")]
    pub async fn mount(
        &self,
        workspace_key: &str,
        deadline: Option<Duration>,
    ) -> Result<Workspace, SyncError> {
        let _guard = self.locks.acquire(&self.site_key).await;

        let current = self.writer.current(workspace_key)?;
        if current.state == WorkspaceState::Mounted {
            return Ok(current);
        }

        self.writer
            .transition(workspace_key, WorkspaceState::Mounting, None, None)?;
        let mut pending = PendingTransition::new(&self.writer, workspace_key);
        self.events.emit(
            &self.site_key,
            Phase::Mount,
            EventLevel::Debug,
            format!("Mounting workspace {}", workspace_key),
        );

        let result = with_deadline(
            "mount",
            deadline,
            self.source.mount_workspace(workspace_key),
        )
        .await;
        pending.settle();

        match result {
            Ok(content) => {
                let workspace = self.writer.transition(
                    workspace_key,
                    WorkspaceState::Mounted,
                    Some(content),
                    None,
                )?;
                self.events.emit(
                    &self.site_key,
                    Phase::Mount,
                    EventLevel::Info,
                    format!("Mounted workspace {}", workspace_key),
                );
                Ok(workspace)
            }
            Err(e) => {
                let err = match e {
                    SyncError::Mount { .. } | SyncError::Timeout { .. } => e,
                    other => SyncError::Mount {
                        workspace: workspace_key.to_string(),
                        cause: other.to_string(),
                    },
                };
                self.writer.transition(
                    workspace_key,
                    WorkspaceState::Failed,
                    None,
                    Some(err.clone()),
                )?;
                self.events.emit(
                    &self.site_key,
                    Phase::Mount,
                    EventLevel::Error,
                    err.to_string(),
                );
                Err(err)
            }
        }
    }

    /// Refresh a mounted workspace.
    ///
    /// On failure the workspace becomes Failed but keeps its previous content.
    #[instrument(skip(self), fields(site = %self.site_key), level = "debug")]
    pub async fn update(
        &self,
        workspace_key: &str,
        deadline: Option<Duration>,
    ) -> Result<Workspace, SyncError> {
        let _guard = self.locks.acquire(&self.site_key).await;

        let current = self.writer.current(workspace_key)?;
        if current.state != WorkspaceState::Mounted {
            return Err(SyncError::NotMounted {
                site_key: self.site_key.clone(),
                workspace: workspace_key.to_string(),
            });
        }

        self.writer
            .transition(workspace_key, WorkspaceState::Refreshing, None, None)?;
        let mut pending = PendingTransition::new(&self.writer, workspace_key);
        self.events.emit(
            &self.site_key,
            Phase::Refresh,
            EventLevel::Debug,
            format!("Refreshing workspace {}", workspace_key),
        );

        let result = with_deadline("update", deadline, self.source.update(workspace_key)).await;
        pending.settle();

        match result {
            Ok(content) => {
                let workspace = self.writer.transition(
                    workspace_key,
                    WorkspaceState::Mounted,
                    Some(content),
                    None,
                )?;
                self.events.emit(
                    &self.site_key,
                    Phase::Refresh,
                    EventLevel::Info,
                    format!(
                        "Refreshed workspace {} (revision {})",
                        workspace_key,
                        workspace
                            .content
                            .as_ref()
                            .and_then(|c| c.revision.as_deref())
                            .unwrap_or("-")
                    ),
                );
                Ok(workspace)
            }
            Err(e) => {
                let err = match e {
                    SyncError::Refresh { .. } | SyncError::Timeout { .. } => e,
                    other => SyncError::Refresh {
                        workspace: workspace_key.to_string(),
                        cause: other.to_string(),
                    },
                };
                self.writer.transition(
                    workspace_key,
                    WorkspaceState::Failed,
                    None,
                    Some(err.clone()),
                )?;
                self.events.emit(
                    &self.site_key,
                    Phase::Refresh,
                    EventLevel::Error,
                    err.to_string(),
                );
                Err(err)
            }
        }
    }

    /// Release mounted workspaces and drop the site from the registry.
    ///
    /// Every workspace is released even if one fails; the first failure is
    /// returned.
    #[instrument(skip(self), fields(site = %self.site_key), level = "debug")]
    pub async fn close(&self) -> Result<(), SyncError> {
        let _guard = self.locks.acquire(&self.site_key).await;

        let mut first_error = None;
        let workspaces = self.writer.remove_site().unwrap_or_default();
        for workspace in workspaces.iter().filter(|w| w.content.is_some()) {
            if let Err(e) = self.source.unmount_workspace(&workspace.key).await {
                self.events.emit(
                    &self.site_key,
                    Phase::Unmount,
                    EventLevel::Warn,
                    format!("Failed to release workspace {}: {}", workspace.key, e),
                );
                first_error.get_or_insert(e);
            }
        }

        self.events.emit(
            &self.site_key,
            Phase::Unmount,
            EventLevel::Info,
            format!("Closed site ({} workspace(s))", workspaces.len()),
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Fails a Mounting or Refreshing workspace with `Cancelled` if the
/// operation is dropped before the backend call returns.
struct PendingTransition<'a> {
    writer: &'a RegistryWriter,
    workspace_key: &'a str,
    settled: bool,
}

impl<'a> PendingTransition<'a> {
    fn new(writer: &'a RegistryWriter, workspace_key: &'a str) -> Self {
        Self {
            writer,
            workspace_key,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for PendingTransition<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.writer.transition(
            self.workspace_key,
            WorkspaceState::Failed,
            None,
            Some(SyncError::Cancelled),
        ) {
            warn!(
                "Failed to settle abandoned transition of {}: {}",
                self.workspace_key, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MountedContent, WorkspaceDescriptor};
    use crate::workspace::WorkspaceRegistry;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory source with switchable failures.
    #[derive(Default)]
    struct ScriptedSource {
        fail_update: AtomicBool,
        fail_mount: AtomicBool,
        slow_mount: AtomicBool,
        slow_update: AtomicBool,
        mounts: AtomicU32,
        revision: AtomicU32,
    }

    #[async_trait]
    impl WorkspaceSource for ScriptedSource {
        fn source_type(&self) -> &str {
            "scripted"
        }

        async fn list_workspaces(&self) -> Result<Vec<WorkspaceDescriptor>, SyncError> {
            Ok(vec![WorkspaceDescriptor {
                key: "source".to_string(),
                location_handle: "mem://source".to_string(),
            }])
        }

        async fn mount_workspace(&self, _key: &str) -> Result<MountedContent, SyncError> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            if self.slow_mount.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail_mount.load(Ordering::SeqCst) {
                return Err(SyncError::Io("disk gone".to_string()));
            }
            Ok(MountedContent {
                root: PathBuf::from("/mem/source"),
                revision: Some("r0".to_string()),
            })
        }

        async fn update(&self, key: &str) -> Result<MountedContent, SyncError> {
            if self.slow_update.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail_update.load(Ordering::SeqCst) {
                return Err(SyncError::Refresh {
                    workspace: key.to_string(),
                    cause: "upstream unreachable".to_string(),
                });
            }
            let rev = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MountedContent {
                root: PathBuf::from("/mem/source"),
                revision: Some(format!("r{}", rev)),
            })
        }
    }

    fn handle(source: Arc<ScriptedSource>) -> (SourceHandle, Arc<WorkspaceRegistry>) {
        let registry = Arc::new(WorkspaceRegistry::new());
        let handle = SourceHandle::new(
            "docs",
            source,
            registry.writer("docs"),
            Arc::new(SiteLocks::new()),
            EventSink::disabled(),
        );
        (handle, registry)
    }

    #[tokio::test]
    async fn test_discover_then_mount() {
        let source = Arc::new(ScriptedSource::default());
        let (handle, registry) = handle(source.clone());

        let listed = handle.discover().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, WorkspaceState::Unmounted);

        let mounted = handle.mount("source", None).await.unwrap();
        assert!(mounted.is_mounted());
        assert_eq!(registry.get("docs", "source").unwrap().state, WorkspaceState::Mounted);

        // Mounting again is a no-op
        handle.mount("source", None).await.unwrap();
        assert_eq!(source.mounts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mount_failure_wraps_cause() {
        let source = Arc::new(ScriptedSource::default());
        source.fail_mount.store(true, Ordering::SeqCst);
        let (handle, registry) = handle(source.clone());
        handle.discover().await.unwrap();

        let err = handle.mount("source", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Mount { ref cause, .. } if cause.contains("disk gone")));

        let workspace = registry.get("docs", "source").unwrap();
        assert_eq!(workspace.state, WorkspaceState::Failed);
        assert!(workspace.last_error.is_some());

        // A failed workspace can be mounted again
        source.fail_mount.store(false, Ordering::SeqCst);
        let mounted = handle.mount("source", None).await.unwrap();
        assert!(mounted.is_mounted());
        assert!(mounted.last_error.is_none());
    }

    #[tokio::test]
    async fn test_mount_deadline() {
        let source = Arc::new(ScriptedSource::default());
        source.slow_mount.store(true, Ordering::SeqCst);
        let (handle, registry) = handle(source);
        handle.discover().await.unwrap();

        let err = handle
            .mount("source", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
        assert_eq!(registry.get("docs", "source").unwrap().state, WorkspaceState::Failed);
    }

    #[tokio::test]
    async fn test_dropped_mount_fails_workspace() {
        let source = Arc::new(ScriptedSource::default());
        source.slow_mount.store(true, Ordering::SeqCst);
        let (handle, registry) = handle(source.clone());
        handle.discover().await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), handle.mount("source", None)).await;
        assert!(abandoned.is_err());

        let workspace = registry.get("docs", "source").unwrap();
        assert_eq!(workspace.state, WorkspaceState::Failed);
        assert!(matches!(workspace.last_error, Some(SyncError::Cancelled)));

        source.slow_mount.store(false, Ordering::SeqCst);
        let mounted = handle.mount("source", None).await.unwrap();
        assert!(mounted.is_mounted());
    }

    #[tokio::test]
    async fn test_dropped_update_keeps_content() {
        let source = Arc::new(ScriptedSource::default());
        let (handle, registry) = handle(source.clone());
        handle.discover().await.unwrap();
        let mounted = handle.mount("source", None).await.unwrap();

        source.slow_update.store(true, Ordering::SeqCst);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), handle.update("source", None)).await;
        assert!(abandoned.is_err());

        let workspace = registry.get("docs", "source").unwrap();
        assert_eq!(workspace.state, WorkspaceState::Failed);
        assert_eq!(workspace.content, mounted.content);

        // Failed -> Mounting is allowed, so the workspace can be remounted
        let remounted = handle.mount("source", None).await.unwrap();
        assert!(remounted.is_mounted());
    }

    #[tokio::test]
    async fn test_failed_update_keeps_content() {
        let source = Arc::new(ScriptedSource::default());
        let (handle, registry) = handle(source.clone());
        handle.discover().await.unwrap();
        handle.mount("source", None).await.unwrap();

        let refreshed = handle.update("source", None).await.unwrap();
        assert_eq!(
            refreshed.content.as_ref().unwrap().revision.as_deref(),
            Some("r1")
        );

        source.fail_update.store(true, Ordering::SeqCst);
        let err = handle.update("source", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Refresh { .. }));

        let workspace = registry.get("docs", "source").unwrap();
        assert_eq!(workspace.state, WorkspaceState::Failed);
        assert_eq!(workspace.content, refreshed.content);
    }

    #[tokio::test]
    async fn test_update_requires_mount() {
        let source = Arc::new(ScriptedSource::default());
        let (handle, _registry) = handle(source);
        handle.discover().await.unwrap();

        let err = handle.update("source", None).await.unwrap_err();
        assert!(matches!(err, SyncError::NotMounted { .. }));
    }

    #[tokio::test]
    async fn test_close_removes_site() {
        let source = Arc::new(ScriptedSource::default());
        let (handle, registry) = handle(source);
        handle.discover().await.unwrap();
        handle.mount("source", None).await.unwrap();

        handle.close().await.unwrap();
        assert!(registry.list("docs").is_none());
    }
}
