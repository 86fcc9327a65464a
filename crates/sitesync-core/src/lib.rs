//! Core traits and types for sitesync.
//!
//! This crate defines the contracts shared between the engine and its backends:
//! - `WorkspaceSource`: discovering, mounting and refreshing workspaces
//! - `Publisher`: transferring a mounted workspace to a destination
//! - `TypeRegistry`: resolving backends by type identifier
//! - `WorkspaceRegistry`: committed workspace state per site
//! - `SyncCoordinator`: serialized, retrying publish runs per site
//! - `SyncEngine`: the facade tying them together

mod config;
mod coordinator;
mod deadline;
mod engine;
mod error;
mod events;
mod handle;
mod lock;
mod publish;
mod registry;
mod source;
mod workspace;

#[cfg(any(test, feature = "conformance"))]
pub mod conformance;

pub use config::{
    Credentials, Options, SiteConfigProvider, SiteConfiguration, SourceDescriptor,
    TargetDescriptor,
};
pub use coordinator::{
    AttemptRecord, JobStatus, PublishHandle, PublishJob, RetryPolicy, SiteSyncState,
    SyncCoordinator, DEFAULT_HISTORY_LIMIT,
};
pub use deadline::with_deadline;
pub use engine::SyncEngine;
pub use error::{SyncError, TransferFailure};
pub use events::{EventLevel, EventSink, Phase, ProgressEvent};
pub use handle::SourceHandle;
pub use lock::{SiteGuard, SiteLocks};
pub use publish::{PublishOutcome, Publisher, WorkspaceSnapshot};
pub use registry::{
    Factory, ProviderRegistry, PublisherFactory, PublisherRegistry, SourceFactory, TypeRegistry,
};
pub use source::{MountedContent, WorkspaceDescriptor, WorkspaceSource};
pub use workspace::{Workspace, WorkspaceRegistry, WorkspaceState};

// Re-exported so backends and callers share the same token type
pub use tokio_util::sync::CancellationToken;
