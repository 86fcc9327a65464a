use std::sync::Arc;

use sitesync_core::{
    ProviderRegistry, Publisher, PublisherRegistry, SourceDescriptor, SyncError,
    TargetDescriptor, WorkspaceSource,
};

use crate::folder::FolderSource;
use crate::mirror::MirrorSource;
use crate::publisher::FolderPublisher;

/// Register the local sources and publishers.
/// Shared between the `sitesync` binary and tests.
pub fn register_builtins(
    providers: &mut ProviderRegistry,
    publishers: &mut PublisherRegistry,
) -> Result<(), SyncError> {
    providers.register_fn(FolderSource::TYPE, |d: &SourceDescriptor| {
        let source: Arc<dyn WorkspaceSource> = Arc::new(FolderSource::from_descriptor(d)?);
        Ok(source)
    })?;
    providers.register_fn(MirrorSource::TYPE, |d: &SourceDescriptor| {
        let source: Arc<dyn WorkspaceSource> = Arc::new(MirrorSource::from_descriptor(d)?);
        Ok(source)
    })?;
    publishers.register_fn(FolderPublisher::TYPE, |t: &TargetDescriptor| {
        let publisher: Arc<dyn Publisher> = Arc::new(FolderPublisher::from_descriptor(t)?);
        Ok(publisher)
    })?;
    Ok(())
}

/// Fresh registries holding only the built-in types.
pub fn builtin_registries() -> Result<(ProviderRegistry, PublisherRegistry), SyncError> {
    let mut providers = ProviderRegistry::new();
    let mut publishers = PublisherRegistry::new();
    register_builtins(&mut providers, &mut publishers)?;
    Ok((providers, publishers))
}
