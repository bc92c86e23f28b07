//! Configuration store
//!
//! Pure data access for community settings, protection modules, trust lists and
//! the punishment log. No policy decisions live here.

use crate::protection::{Category, ProtectionError, ProtectionModule, ProtectionResult, Punishment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Punishment log entries kept per community; older entries are dropped first
pub const MAX_LOG_ENTRIES: usize = 250;

const COMMUNITIES_FILE: &str = "communities.yaml";
const MODULES_FILE: &str = "modules.yaml";
const TRUST_FILE: &str = "trust.yaml";
const PUNISHMENTS_FILE: &str = "punishments.yaml";

/// Community-wide protection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunitySettings {
    pub community_id: u64,
    /// Master switch for the whole engine in this community
    pub enabled: bool,
    /// Owner of the community, implicitly immune
    pub owner_id: u64,
    /// Channel receiving punishment notifications
    #[serde(default)]
    pub log_channel_id: Option<u64>,
}

impl CommunitySettings {
    #[must_use]
    pub fn new(community_id: u64, owner_id: u64) -> Self {
        Self {
            community_id,
            enabled: false,
            owner_id,
            log_channel_id: None,
        }
    }
}

/// Trusted actors of a community; the two sets never overlap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustList {
    /// May reconfigure the engine, immune
    pub admins: HashSet<u64>,
    /// Immune only
    pub whitelisted: HashSet<u64>,
}

impl TrustList {
    #[must_use]
    pub fn is_admin(&self, actor_id: u64) -> bool {
        self.admins.contains(&actor_id)
    }

    #[must_use]
    pub fn is_whitelisted(&self, actor_id: u64) -> bool {
        self.whitelisted.contains(&actor_id)
    }
}

/// Audit record of one punishment attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentLogEntry {
    pub id: String,
    pub community_id: u64,
    pub actor_id: u64,
    pub category: Category,
    pub punishment: Punishment,
    pub timestamp: DateTime<Utc>,
    /// Whether the platform accepted the punishment
    pub success: bool,
    /// Failure description when `success` is false
    #[serde(default)]
    pub error: Option<String>,
    /// Account removed alongside the actor, such as a freshly added bot
    #[serde(default)]
    pub target_id: Option<u64>,
    /// Whether `target_id` was removed
    #[serde(default)]
    pub target_removed: Option<bool>,
}

impl PunishmentLogEntry {
    /// Create a successful entry stamped now
    #[must_use]
    pub fn new(community_id: u64, actor_id: u64, category: Category, punishment: Punishment) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            community_id,
            actor_id,
            category,
            punishment,
            timestamp: Utc::now(),
            success: true,
            error: None,
            target_id: None,
            target_removed: None,
        }
    }

    /// Record the outcome of removing the target of the event
    #[must_use]
    pub fn with_target_removal(mut self, target_id: u64, removed: bool) -> Self {
        self.target_id = Some(target_id);
        self.target_removed = Some(removed);
        self
    }

    /// Mark the entry as failed
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Persistence boundary for engine configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_community(&self, community_id: u64) -> ProtectionResult<Option<CommunitySettings>>;

    async fn upsert_community(&self, settings: CommunitySettings) -> ProtectionResult<()>;

    /// Remove settings, modules and trust list of a community
    async fn delete_community(&self, community_id: u64) -> ProtectionResult<()>;

    async fn community_ids(&self) -> ProtectionResult<Vec<u64>>;

    async fn get_module(
        &self,
        community_id: u64,
        category: Category,
    ) -> ProtectionResult<Option<ProtectionModule>>;

    async fn get_modules(&self, community_id: u64) -> ProtectionResult<Vec<ProtectionModule>>;

    async fn upsert_module(&self, community_id: u64, module: ProtectionModule) -> ProtectionResult<()>;

    async fn get_trust_list(&self, community_id: u64) -> ProtectionResult<TrustList>;

    /// Returns false if the actor was already an admin
    async fn add_admin(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool>;

    /// Returns false if the actor was not an admin
    async fn remove_admin(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool>;

    /// Returns false if the actor was already whitelisted
    async fn add_whitelist(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool>;

    /// Returns false if the actor was not whitelisted
    async fn remove_whitelist(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool>;

    async fn append_punishment_log(&self, entry: PunishmentLogEntry) -> ProtectionResult<()>;

    /// Most recent entries last
    async fn punishment_log(&self, community_id: u64) -> ProtectionResult<Vec<PunishmentLogEntry>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredModule {
    community_id: u64,
    module: ProtectionModule,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTrustList {
    community_id: u64,
    trust: TrustList,
}

/// `ConfigStore` backed by in-memory maps, optionally mirrored to YAML files
#[derive(Clone)]
pub struct YamlConfigStore {
    communities: Arc<DashMap<u64, CommunitySettings>>,
    modules: Arc<DashMap<(u64, Category), ProtectionModule>>,
    trust: Arc<DashMap<u64, TrustList>>,
    punishments: Arc<DashMap<u64, Vec<PunishmentLogEntry>>>,
    /// Directory holding the YAML files, `None` for a purely in-memory store
    data_dir: Option<PathBuf>,
    /// Serializes file writes
    write_lock: Arc<Mutex<()>>,
}

impl Default for YamlConfigStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl YamlConfigStore {
    /// Create a store that never touches the filesystem
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            communities: Arc::new(DashMap::new()),
            modules: Arc::new(DashMap::new()),
            trust: Arc::new(DashMap::new()),
            punishments: Arc::new(DashMap::new()),
            data_dir: None,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Load the store from a data directory
    ///
    /// Missing or unreadable files start empty, so a fresh deployment works
    /// without any setup.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created.
    pub async fn load(data_dir: impl Into<PathBuf>) -> ProtectionResult<Self> {
        let data_dir = data_dir.into();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(&data_dir).await?;
        }

        let store = Self {
            data_dir: Some(data_dir.clone()),
            ..Self::in_memory()
        };

        for settings in read_yaml::<CommunitySettings>(&data_dir.join(COMMUNITIES_FILE)).await {
            store.communities.insert(settings.community_id, settings);
        }

        for stored in read_yaml::<StoredModule>(&data_dir.join(MODULES_FILE)).await {
            store
                .modules
                .insert((stored.community_id, stored.module.category), stored.module);
        }

        for stored in read_yaml::<StoredTrustList>(&data_dir.join(TRUST_FILE)).await {
            store.trust.insert(stored.community_id, stored.trust);
        }

        for entry in read_yaml::<PunishmentLogEntry>(&data_dir.join(PUNISHMENTS_FILE)).await {
            store.punishments.entry(entry.community_id).or_default().push(entry);
        }

        info!(
            communities = store.communities.len(),
            modules = store.modules.len(),
            data_dir = %data_dir.display(),
            "Configuration store loaded"
        );

        Ok(store)
    }

    async fn save_communities(&self) -> ProtectionResult<()> {
        self.persist(COMMUNITIES_FILE, || {
            self.communities
                .iter()
                .map(|entry| entry.value().clone())
                .collect::<Vec<_>>()
        })
        .await
    }

    async fn save_modules(&self) -> ProtectionResult<()> {
        self.persist(MODULES_FILE, || {
            self.modules
                .iter()
                .map(|entry| StoredModule {
                    community_id: entry.key().0,
                    module: entry.value().clone(),
                })
                .collect::<Vec<_>>()
        })
        .await
    }

    async fn save_trust(&self) -> ProtectionResult<()> {
        self.persist(TRUST_FILE, || {
            self.trust
                .iter()
                .map(|entry| StoredTrustList {
                    community_id: *entry.key(),
                    trust: entry.value().clone(),
                })
                .collect::<Vec<_>>()
        })
        .await
    }

    async fn save_punishments(&self) -> ProtectionResult<()> {
        self.persist(PUNISHMENTS_FILE, || {
            self.punishments
                .iter()
                .flat_map(|entry| entry.value().clone())
                .collect::<Vec<_>>()
        })
        .await
    }

    /// Write a file from a snapshot taken under the write lock, so the last
    /// write to land always carries the newest state
    async fn persist<T, F>(&self, file: &str, snapshot: F) -> ProtectionResult<()>
    where
        T: Serialize,
        F: FnOnce() -> Vec<T> + Send,
    {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;
        let yaml = serde_yaml::to_string(&snapshot())?;
        tokio::fs::write(dir.join(file), yaml).await?;
        Ok(())
    }

    /// Apply a change to a trust list and persist it
    async fn update_trust(
        &self,
        community_id: u64,
        change: impl FnOnce(&mut TrustList) -> bool + Send,
    ) -> ProtectionResult<bool> {
        let changed = {
            let mut trust = self.trust.entry(community_id).or_default();
            change(&mut *trust)
        };
        if changed {
            self.save_trust().await?;
        }
        Ok(changed)
    }
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };

    match serde_yaml::from_str::<Vec<T>>(&content) {
        Ok(items) => items,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable data file");
            Vec::new()
        }
    }
}

#[async_trait]
impl ConfigStore for YamlConfigStore {
    async fn get_community(&self, community_id: u64) -> ProtectionResult<Option<CommunitySettings>> {
        Ok(self
            .communities
            .get(&community_id)
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_community(&self, settings: CommunitySettings) -> ProtectionResult<()> {
        self.communities.insert(settings.community_id, settings);
        self.save_communities().await
    }

    async fn delete_community(&self, community_id: u64) -> ProtectionResult<()> {
        self.communities.remove(&community_id);
        self.modules.retain(|(id, _), _| *id != community_id);
        self.trust.remove(&community_id);

        self.save_communities().await?;
        self.save_modules().await?;
        self.save_trust().await
    }

    async fn community_ids(&self) -> ProtectionResult<Vec<u64>> {
        Ok(self.communities.iter().map(|entry| *entry.key()).collect())
    }

    async fn get_module(
        &self,
        community_id: u64,
        category: Category,
    ) -> ProtectionResult<Option<ProtectionModule>> {
        Ok(self
            .modules
            .get(&(community_id, category))
            .map(|entry| entry.value().clone()))
    }

    async fn get_modules(&self, community_id: u64) -> ProtectionResult<Vec<ProtectionModule>> {
        Ok(Category::ALL
            .into_iter()
            .filter_map(|category| {
                self.modules
                    .get(&(community_id, category))
                    .map(|entry| entry.value().clone())
            })
            .collect())
    }

    async fn upsert_module(&self, community_id: u64, module: ProtectionModule) -> ProtectionResult<()> {
        if module.threshold == 0 {
            return Err(ProtectionError::InvalidThreshold(module.threshold));
        }
        self.modules.insert((community_id, module.category), module);
        self.save_modules().await
    }

    async fn get_trust_list(&self, community_id: u64) -> ProtectionResult<TrustList> {
        Ok(self
            .trust
            .get(&community_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn add_admin(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        self.update_trust(community_id, |trust| {
            trust.whitelisted.remove(&actor_id);
            trust.admins.insert(actor_id)
        })
        .await
    }

    async fn remove_admin(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        self.update_trust(community_id, |trust| trust.admins.remove(&actor_id))
            .await
    }

    async fn add_whitelist(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        self.update_trust(community_id, |trust| {
            trust.admins.remove(&actor_id);
            trust.whitelisted.insert(actor_id)
        })
        .await
    }

    async fn remove_whitelist(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        self.update_trust(community_id, |trust| trust.whitelisted.remove(&actor_id))
            .await
    }

    async fn append_punishment_log(&self, entry: PunishmentLogEntry) -> ProtectionResult<()> {
        {
            let mut log = self.punishments.entry(entry.community_id).or_default();
            log.push(entry);
            if log.len() > MAX_LOG_ENTRIES {
                let excess = log.len() - MAX_LOG_ENTRIES;
                log.drain(..excess);
            }
        }
        self.save_punishments().await
    }

    async fn punishment_log(&self, community_id: u64) -> ProtectionResult<Vec<PunishmentLogEntry>> {
        Ok(self
            .punishments
            .get(&community_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}
