//! Contract checks every backend is expected to pass.
//!
//! Backend crates call these from their own tests with a backend instance
//! pointing at a throwaway location. Failures panic with a message naming the
//! broken rule.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

use crate::config::TargetDescriptor;
use crate::error::SyncError;
use crate::publish::{PublishOutcome, Publisher, WorkspaceSnapshot};
use crate::source::{MountedContent, WorkspaceSource};

/// Listing, mounting, refreshing and releasing every workspace of `source`.
///
/// Returns the mounted content of each workspace in listing order.
pub async fn check_source(source: &dyn WorkspaceSource) -> Vec<MountedContent> {
    let listed = source
        .list_workspaces()
        .await
        .unwrap_or_else(|e| panic!("{}: listing failed: {}", source.source_type(), e));

    let mut seen = HashSet::new();
    for descriptor in &listed {
        assert!(
            seen.insert(descriptor.key.clone()),
            "{}: workspace key '{}' listed twice",
            source.source_type(),
            descriptor.key
        );
    }

    let again = source
        .list_workspaces()
        .await
        .unwrap_or_else(|e| panic!("{}: second listing failed: {}", source.source_type(), e));
    assert_eq!(listed, again, "{}: listing is not stable", source.source_type());

    let mut mounted = Vec::with_capacity(listed.len());
    for descriptor in &listed {
        let content = source
            .mount_workspace(&descriptor.key)
            .await
            .unwrap_or_else(|e| panic!("{}: mount of '{}' failed: {}", source.source_type(), descriptor.key, e));
        assert!(
            content.root.is_dir(),
            "{}: mounted root {} is not a directory",
            source.source_type(),
            content.root.display()
        );

        let refreshed = source
            .update(&descriptor.key)
            .await
            .unwrap_or_else(|e| panic!("{}: update of '{}' failed: {}", source.source_type(), descriptor.key, e));
        assert!(
            refreshed.root.is_dir(),
            "{}: refreshed root {} is not a directory",
            source.source_type(),
            refreshed.root.display()
        );

        mounted.push(refreshed);
    }

    let unknown = source.mount_workspace("no-such-workspace").await;
    assert!(
        unknown.is_err(),
        "{}: mounting an unknown workspace must fail",
        source.source_type()
    );

    for descriptor in &listed {
        source
            .unmount_workspace(&descriptor.key)
            .await
            .unwrap_or_else(|e| panic!("{}: unmount of '{}' failed: {}", source.source_type(), descriptor.key, e));
    }

    mounted
}

/// Publishing `snapshot` twice converges, and a cancelled token stops the run.
///
/// Returns the outcome of the first publish.
pub async fn check_publisher(
    publisher: &dyn Publisher,
    snapshot: &WorkspaceSnapshot,
    destination: &TargetDescriptor,
) -> PublishOutcome {
    let first = publisher
        .publish(snapshot, destination, &CancellationToken::new())
        .await
        .unwrap_or_else(|e| panic!("{}: publish failed: {}", publisher.target_type(), e));

    let second = publisher
        .publish(snapshot, destination, &CancellationToken::new())
        .await
        .unwrap_or_else(|e| panic!("{}: repeated publish failed: {}", publisher.target_type(), e));
    assert_eq!(
        second.files_changed, 0,
        "{}: publishing unchanged content again must change nothing",
        publisher.target_type()
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let cancelled = publisher.publish(snapshot, destination, &cancel).await;
    assert!(
        matches!(cancelled, Err(SyncError::Cancelled)),
        "{}: publish with a cancelled token returned {:?}",
        publisher.target_type(),
        cancelled
    );

    first
}
