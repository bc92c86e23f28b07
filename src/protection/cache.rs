//! Read-mostly view of community configuration
//!
//! Snapshots are immutable and replaced wholesale, so the event path only
//! clones an `Arc` and never waits on the store unless the community is cold.

use crate::protection::{
    Category, CommunitySettings, ConfigStore, ProtectionError, ProtectionModule, ProtectionResult,
    TrustList,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything the immunity filter needs to know about one community
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunitySnapshot {
    pub settings: CommunitySettings,
    pub modules: HashMap<Category, ProtectionModule>,
    pub trust: TrustList,
}

impl CommunitySnapshot {
    /// Snapshot for a community that never enabled protection
    #[must_use]
    pub fn disabled(community_id: u64) -> Self {
        Self {
            settings: CommunitySettings::new(community_id, 0),
            modules: HashMap::new(),
            trust: TrustList::default(),
        }
    }

    #[must_use]
    pub fn community_id(&self) -> u64 {
        self.settings.community_id
    }

    #[must_use]
    pub fn module(&self, category: Category) -> Option<&ProtectionModule> {
        self.modules.get(&category)
    }

    /// Check if events of this category are currently counted
    #[must_use]
    pub fn is_tracking(&self, category: Category) -> bool {
        self.settings.enabled && self.module(category).is_some_and(|module| module.toggled)
    }

    /// Categories tracked in `previous` that this snapshot no longer tracks
    #[must_use]
    pub fn untracked_since(&self, previous: &Self) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|category| previous.is_tracking(*category) && !self.is_tracking(*category))
            .collect()
    }

    /// Read a fresh snapshot from the store
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if any of the reads fail.
    pub async fn fetch(store: &dyn ConfigStore, community_id: u64) -> ProtectionResult<Self> {
        let unavailable = |e: ProtectionError| ProtectionError::StoreUnavailable(e.to_string());

        let Some(settings) = store.get_community(community_id).await.map_err(unavailable)? else {
            return Ok(Self::disabled(community_id));
        };

        let modules = store
            .get_modules(community_id)
            .await
            .map_err(unavailable)?
            .into_iter()
            .map(|module| (module.category, module))
            .collect();

        let trust = store
            .get_trust_list(community_id)
            .await
            .map_err(unavailable)?;

        Ok(Self {
            settings,
            modules,
            trust,
        })
    }
}

/// Cache of community snapshots
#[derive(Clone, Default)]
pub struct ConfigCache {
    snapshots: Arc<DashMap<u64, Arc<CommunitySnapshot>>>,
}

impl ConfigCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached snapshot without touching the store
    #[must_use]
    pub fn get(&self, community_id: u64) -> Option<Arc<CommunitySnapshot>> {
        self.snapshots
            .get(&community_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Get the cached snapshot, reading it from the store on a miss
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Timeout` if the store cannot answer in time.
    pub async fn load(
        &self,
        store: &dyn ConfigStore,
        community_id: u64,
        timeout: Duration,
    ) -> ProtectionResult<Arc<CommunitySnapshot>> {
        if let Some(snapshot) = self.get(community_id) {
            return Ok(snapshot);
        }

        let (_, snapshot) = self.refresh(store, community_id, timeout).await?;
        Ok(snapshot)
    }

    /// Re-read a community from the store, returning the replaced and new snapshots
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Timeout`; the cached snapshot is left untouched.
    pub async fn refresh(
        &self,
        store: &dyn ConfigStore,
        community_id: u64,
        timeout: Duration,
    ) -> ProtectionResult<(Option<Arc<CommunitySnapshot>>, Arc<CommunitySnapshot>)> {
        let snapshot = tokio::time::timeout(timeout, CommunitySnapshot::fetch(store, community_id))
            .await
            .map_err(|_| ProtectionError::Timeout(timeout))??;

        let snapshot = Arc::new(snapshot);
        let previous = self.snapshots.insert(community_id, Arc::clone(&snapshot));
        debug!(community_id, enabled = snapshot.settings.enabled, "Configuration snapshot refreshed");

        Ok((previous, snapshot))
    }

    /// Re-read every cached community
    ///
    /// Returns, per community, the categories that stopped being tracked. A
    /// community that cannot be read keeps its previous snapshot.
    pub async fn refresh_all(
        &self,
        store: &dyn ConfigStore,
        timeout: Duration,
    ) -> Vec<(u64, Vec<Category>)> {
        let mut untracked = Vec::new();
        for community_id in self.community_ids() {
            match self.refresh(store, community_id, timeout).await {
                Ok((Some(previous), current)) => {
                    untracked.push((community_id, current.untracked_since(&previous)));
                }
                Ok((None, _)) => {}
                Err(e) => {
                    warn!(community_id, error = %e, "Failed to refresh configuration snapshot");
                }
            }
        }
        untracked
    }

    /// Drop a community so the next read goes to the store
    pub fn invalidate(&self, community_id: u64) -> Option<Arc<CommunitySnapshot>> {
        self.snapshots.remove(&community_id).map(|(_, snapshot)| snapshot)
    }

    /// Communities currently cached
    #[must_use]
    pub fn community_ids(&self) -> Vec<u64> {
        self.snapshots.iter().map(|entry| *entry.key()).collect()
    }
}
