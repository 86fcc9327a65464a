use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Per-site advisory locks.
///
/// The coordinator holds a site's lock while it reads workspace content and
/// runs a publish attempt; the source handle holds it while mounting or
/// refreshing. Locks of different sites are independent.
#[derive(Debug, Default)]
pub struct SiteLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held site lock, released on drop.
#[derive(Debug)]
pub struct SiteGuard {
    site_key: String,
    _guard: OwnedMutexGuard<()>,
}

impl SiteGuard {
    pub fn site_key(&self) -> &str {
        &self.site_key
    }
}

impl SiteLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, site_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(site_key.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Wait for the site's lock.
    pub async fn acquire(&self, site_key: &str) -> SiteGuard {
        let lock = self.lock_for(site_key);
        let guard = lock.lock_owned().await;
        debug!("Acquired site lock for {}", site_key);
        SiteGuard {
            site_key: site_key.to_string(),
            _guard: guard,
        }
    }

    /// Take the site's lock only if it is free.
    pub fn try_acquire(&self, site_key: &str) -> Option<SiteGuard> {
        let lock = self.lock_for(site_key);
        lock.try_lock_owned().ok().map(|guard| SiteGuard {
            site_key: site_key.to_string(),
            _guard: guard,
        })
    }
}
