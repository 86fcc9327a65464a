use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{SiteConfiguration, SourceDescriptor, TargetDescriptor};
use crate::coordinator::{PublishHandle, PublishJob, RetryPolicy, SiteSyncState, SyncCoordinator};
use crate::error::SyncError;
use crate::events::EventSink;
use crate::handle::SourceHandle;
use crate::lock::SiteLocks;
use crate::publish::Publisher;
use crate::registry::{ProviderRegistry, PublisherRegistry};
use crate::source::WorkspaceSource;
use crate::workspace::{Workspace, WorkspaceRegistry};

struct OpenSite {
    config: SiteConfiguration,
    handle: Arc<SourceHandle>,
}

/// Entry point tying registries, workspaces and publishing together.
///
/// Open a site to discover its workspaces, mount and refresh them, then
/// request publish runs against the site's targets.
pub struct SyncEngine {
    providers: Arc<ProviderRegistry>,
    publishers: Arc<PublisherRegistry>,
    workspaces: Arc<WorkspaceRegistry>,
    locks: Arc<SiteLocks>,
    events: EventSink,
    coordinator: SyncCoordinator,
    sites: DashMap<String, OpenSite>,
}

impl SyncEngine {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        publishers: Arc<PublisherRegistry>,
        events: EventSink,
        policy: RetryPolicy,
    ) -> Self {
        let workspaces = Arc::new(WorkspaceRegistry::new());
        let locks = Arc::new(SiteLocks::new());
        let coordinator =
            SyncCoordinator::new(workspaces.clone(), locks.clone(), events.clone(), policy);

        Self {
            providers,
            publishers,
            workspaces,
            locks,
            events,
            coordinator,
            sites: DashMap::new(),
        }
    }

    /// Change how many finished publish jobs are retained.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.coordinator = self.coordinator.with_history_limit(limit);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    /// Read-only view of all discovered workspaces.
    pub fn workspaces(&self) -> &Arc<WorkspaceRegistry> {
        &self.workspaces
    }

    pub fn resolve_source(
        &self,
        descriptor: &SourceDescriptor,
    ) -> Result<Arc<dyn WorkspaceSource>, SyncError> {
        self.providers.resolve(&descriptor.source_type, descriptor)
    }

    pub fn resolve_publisher(
        &self,
        target: &TargetDescriptor,
    ) -> Result<Arc<dyn Publisher>, SyncError> {
        self.publishers.resolve(&target.target_type, target)
    }

    /// Open a site: resolve its source and discover its workspaces.
    ///
    /// Opening an already open site with the same configuration lists its
    /// workspaces again.
    ///
    /// # Errors
    /// `Configuration` for an invalid configuration or a conflicting one for an
    /// open site, `UnknownType`/`Instantiation` from source resolution and any
    /// listing error of the source. A site that failed to open is not kept.
    #[instrument(skip(self, config), fields(site = %config.key), level = "debug")]
    pub async fn open_site(&self, config: SiteConfiguration) -> Result<Vec<Workspace>, SyncError> {
        config.validate()?;
        let site_key = config.key.clone();

        let existing = self
            .sites
            .get(&site_key)
            .map(|open| (open.config == config, open.handle.clone()));
        if let Some((same_config, handle)) = existing {
            if !same_config {
                return Err(SyncError::Configuration(format!(
                    "site '{}' is already open with a different configuration",
                    site_key
                )));
            }
            return handle.discover().await;
        }

        let source = self.resolve_source(&config.source)?;
        let handle = Arc::new(SourceHandle::new(
            &site_key,
            source,
            self.workspaces.writer(&site_key),
            self.locks.clone(),
            self.events.clone(),
        ));
        match self.sites.entry(site_key.clone()) {
            Entry::Occupied(_) => {
                return Err(SyncError::Configuration(format!(
                    "site '{}' is being opened concurrently",
                    site_key
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(OpenSite {
                    config,
                    handle: handle.clone(),
                });
            }
        }

        match handle.discover().await {
            Ok(workspaces) => {
                info!(
                    "Opened site {} ({} workspace(s), source {})",
                    site_key,
                    workspaces.len(),
                    handle.source_type()
                );
                Ok(workspaces)
            }
            Err(e) => {
                self.sites
                    .remove_if(&site_key, |_, open| Arc::ptr_eq(&open.handle, &handle));
                Err(e)
            }
        }
    }

    /// Close a site and release its workspaces.
    #[instrument(skip(self), level = "debug")]
    pub async fn close_site(&self, site_key: &str) -> Result<(), SyncError> {
        let (_, open) = self
            .sites
            .remove(site_key)
            .ok_or_else(|| SyncError::NotFound(format!("site '{}'", site_key)))?;
        open.handle.close().await
    }

    /// Close every open site; errors are logged.
    pub async fn close_all(&self) {
        for site_key in self.open_sites() {
            if let Err(e) = self.close_site(&site_key).await {
                warn!("Failed to close site {}: {}", site_key, e);
            }
        }
    }

    /// Keys of all open sites, sorted.
    pub fn open_sites(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sites.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Configuration an open site was opened with.
    pub fn site_config(&self, site_key: &str) -> Option<SiteConfiguration> {
        self.sites.get(site_key).map(|open| open.config.clone())
    }

    pub async fn mount_workspace(
        &self,
        site_key: &str,
        workspace_key: &str,
        deadline: Option<Duration>,
    ) -> Result<Workspace, SyncError> {
        self.handle(site_key)?.mount(workspace_key, deadline).await
    }

    pub async fn update_workspace(
        &self,
        site_key: &str,
        workspace_key: &str,
        deadline: Option<Duration>,
    ) -> Result<Workspace, SyncError> {
        self.handle(site_key)?.update(workspace_key, deadline).await
    }

    pub fn get_workspace(&self, site_key: &str, workspace_key: &str) -> Result<Workspace, SyncError> {
        self.workspaces.get(site_key, workspace_key)
    }

    /// Workspaces of a site in listing order.
    pub fn list_workspaces(&self, site_key: &str) -> Result<Vec<Workspace>, SyncError> {
        self.workspaces
            .list(site_key)
            .ok_or_else(|| SyncError::NotFound(format!("site '{}'", site_key)))
    }

    /// Request a publish run of an open site to `target`.
    ///
    /// The publisher is resolved first: an unknown target type fails with
    /// `UnknownType` and creates no job.
    pub fn request_publish(
        &self,
        site_key: &str,
        target: &TargetDescriptor,
    ) -> Result<PublishHandle, SyncError> {
        self.request_publish_with_deadline(site_key, target, None)
    }

    /// Like [`request_publish`](Self::request_publish), with a deadline for
    /// each attempt.
    pub fn request_publish_with_deadline(
        &self,
        site_key: &str,
        target: &TargetDescriptor,
        deadline: Option<Duration>,
    ) -> Result<PublishHandle, SyncError> {
        if !self.sites.contains_key(site_key) {
            return Err(SyncError::NotFound(format!("site '{}'", site_key)));
        }
        let publisher = self.resolve_publisher(target)?;
        self.coordinator
            .request_publish(site_key, publisher, target.clone(), deadline)
    }

    /// Publish to one of the site's configured targets by key.
    pub fn publish_target(&self, site_key: &str, target_key: &str) -> Result<PublishHandle, SyncError> {
        let target = self
            .site_config(site_key)
            .ok_or_else(|| SyncError::NotFound(format!("site '{}'", site_key)))?
            .target(target_key)
            .cloned()
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "publish target '{}' of site '{}'",
                    target_key, site_key
                ))
            })?;
        self.request_publish(site_key, &target)
    }

    pub fn cancel_job(&self, job_id: Uuid) -> Result<(), SyncError> {
        self.coordinator.cancel(job_id)
    }

    pub fn job(&self, job_id: Uuid) -> Option<PublishJob> {
        self.coordinator.job(job_id)
    }

    pub fn site_state(&self, site_key: &str) -> SiteSyncState {
        self.coordinator.site_state(site_key)
    }

    /// Finished publish jobs, oldest first.
    pub fn history(&self) -> Vec<PublishJob> {
        self.coordinator.history()
    }

    fn handle(&self, site_key: &str) -> Result<Arc<SourceHandle>, SyncError> {
        self.sites
            .get(site_key)
            .map(|open| open.handle.clone())
            .ok_or_else(|| SyncError::NotFound(format!("site '{}'", site_key)))
    }
}
