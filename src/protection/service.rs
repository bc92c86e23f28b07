//! Protection service
//!
//! Runs the event pipeline (classify, screen, count, punish) and owns the
//! configuration surface used by the command layer.
//!
//! Events are routed to one lane task per community. A lane handles its events
//! in arrival order while lanes of different communities run in parallel.
//! Punishments are spawned off the lane so a slow platform call never holds up
//! the counting of later events.

use crate::config::Settings;
use crate::logging;
use crate::protection::{
    Category, ClassifiedEvent, CommunitySettings, CommunitySnapshot, ConfigCache, ConfigStore,
    CounterOutcome, DropReason, ModerationPlatform, ProtectionError, ProtectionModule,
    ProtectionResult, Punishment, PunishmentDispatcher, PunishmentLogEntry, PunishmentRequest,
    RateWindowCounter, RawEvent, TrustList, classify, immunity,
};
use crate::{ERROR_TARGET, EVENT_TARGET};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Requests understood by the cache refresh task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRefreshRequest {
    /// Re-read every cached community
    RefreshAll,
    /// Re-read a single community
    Invalidate { community_id: u64 },
    /// Stop the task
    Shutdown,
}

/// The protection engine
#[derive(Clone)]
pub struct ProtectionService {
    store: Arc<dyn ConfigStore>,
    cache: ConfigCache,
    counter: RateWindowCounter,
    dispatcher: PunishmentDispatcher,
    settings: Arc<Settings>,
    /// Identity of the engine on the platform, zero until known
    engine_id: Arc<AtomicU64>,
    /// Per-community event lanes
    lanes: Arc<DashMap<u64, UnboundedSender<RawEvent>>>,
    refresh_tx: Sender<CacheRefreshRequest>,
    /// Taken once by `start_refresh_task`
    refresh_rx: Arc<Mutex<Option<Receiver<CacheRefreshRequest>>>>,
}

impl ProtectionService {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        platform: Arc<dyn ModerationPlatform>,
        settings: Settings,
    ) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::channel(100);
        let dispatcher = PunishmentDispatcher::new(
            platform,
            Arc::clone(&store),
            settings.moderation_timeout(),
            settings.engine_name.clone(),
        );

        Self {
            store,
            cache: ConfigCache::new(),
            counter: RateWindowCounter::new(settings.window()),
            dispatcher,
            settings: Arc::new(settings),
            engine_id: Arc::new(AtomicU64::new(0)),
            lanes: Arc::new(DashMap::new()),
            refresh_tx,
            refresh_rx: Arc::new(Mutex::new(Some(refresh_rx))),
        }
    }

    #[must_use]
    pub fn counter(&self) -> &RateWindowCounter {
        &self.counter
    }

    #[must_use]
    pub fn cache(&self) -> &ConfigCache {
        &self.cache
    }

    /// Record the engine's own identity so its actions are never counted
    pub fn set_engine_id(&self, engine_id: u64) {
        self.engine_id.store(engine_id, Ordering::Relaxed);
    }

    #[must_use]
    pub fn engine_id(&self) -> Option<u64> {
        match self.engine_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    // ---- Event pipeline ----

    /// Queue an event on its community's lane
    pub fn submit(&self, raw: RawEvent) {
        let community_id = raw.community_id;
        let Err(mpsc::error::SendError(raw)) = self.lane(community_id).send(raw) else {
            return;
        };

        // The lane task is gone; start a fresh one
        warn!(target: EVENT_TARGET, guild_id = community_id, "Event lane closed, restarting");
        self.lanes.remove(&community_id);
        if self.lane(community_id).send(raw).is_err() {
            error!(target: ERROR_TARGET, guild_id = community_id, "Failed to queue event");
        }
    }

    fn lane(&self, community_id: u64) -> UnboundedSender<RawEvent> {
        self.lanes
            .entry(community_id)
            .or_insert_with(|| self.spawn_lane(community_id))
            .clone()
    }

    fn spawn_lane(&self, community_id: u64) -> UnboundedSender<RawEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RawEvent>();
        let service = self.clone();

        tokio::spawn(async move {
            debug!(target: EVENT_TARGET, guild_id = community_id, "Event lane started");
            while let Some(raw) = rx.recv().await {
                if let Some(request) = service.evaluate(&raw).await {
                    let service = service.clone();
                    tokio::spawn(async move {
                        service.punish(&request).await;
                    });
                }
            }
            debug!(target: EVENT_TARGET, guild_id = community_id, "Event lane stopped");
        });

        tx
    }

    /// Run one event through the whole pipeline, punishing inline
    ///
    /// Returns the log entry if the event triggered a punishment.
    pub async fn process_event(&self, raw: RawEvent) -> Option<PunishmentLogEntry> {
        let request = self.evaluate(&raw).await?;
        Some(self.punish(&request).await)
    }

    /// Classify, screen and count an event
    ///
    /// Returns the punishment to apply when the actor crossed the threshold.
    pub async fn evaluate(&self, raw: &RawEvent) -> Option<PunishmentRequest> {
        let event = match classify(raw, self.engine_id()) {
            Ok(event) => event,
            Err(reason) => {
                logging::log_event_dropped(raw, reason);
                return None;
            }
        };

        let snapshot = match self
            .cache
            .load(&*self.store, event.community_id, self.settings.store_timeout())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(target: EVENT_TARGET, guild_id = event.community_id, error = %e, "Failed to read configuration");
                logging::log_event_dropped(raw, DropReason::StoreUnavailable);
                return None;
            }
        };

        self.screen_and_count(raw, &event, &snapshot)
    }

    /// Screen an event against a snapshot and count it
    fn screen_and_count(
        &self,
        raw: &RawEvent,
        event: &ClassifiedEvent,
        snapshot: &Arc<CommunitySnapshot>,
    ) -> Option<PunishmentRequest> {
        let module = match immunity::screen(event, snapshot) {
            Ok(module) => module,
            Err(reason) => {
                if matches!(reason, DropReason::ProtectionDisabled | DropReason::ModuleDisabled) {
                    self.heal_stale_record(event);
                }
                logging::log_event_dropped(raw, reason);
                return None;
            }
        };

        match self.counter.record(event, module.threshold, event.occurred_at) {
            CounterOutcome::Counted { count } => {
                self.drop_if_untracked(event, snapshot);
                debug!(
                    target: EVENT_TARGET,
                    guild_id = event.community_id,
                    user_id = event.actor_id,
                    category = %event.category,
                    count,
                    threshold = module.threshold,
                    "Action counted"
                );
                None
            }
            CounterOutcome::ThresholdReached { count } => {
                info!(
                    target: EVENT_TARGET,
                    guild_id = event.community_id,
                    user_id = event.actor_id,
                    category = %event.category,
                    count,
                    punishment = %module.punishment,
                    "Threshold reached"
                );
                // Bot accounts are always banned
                let punishment = if event.actor_is_bot {
                    Punishment::Ban
                } else {
                    module.punishment
                };
                Some(PunishmentRequest {
                    community_id: event.community_id,
                    actor_id: event.actor_id,
                    target_id: event.target_id,
                    category: event.category,
                    punishment,
                    log_channel_id: snapshot.settings.log_channel_id,
                })
            }
        }
    }

    /// Apply a punishment; never fails
    pub async fn punish(&self, request: &PunishmentRequest) -> PunishmentLogEntry {
        let entry = self.dispatcher.dispatch(request).await;
        if entry.success && entry.punishment.removes_member() {
            self.counter.clear_actor(entry.community_id, entry.actor_id);
        }
        entry
    }

    /// Drop a record counted against a snapshot that has since been replaced
    /// by one that no longer tracks its category
    ///
    /// Configuration changes swap the snapshot before clearing records, so
    /// either that clear or this check removes the record.
    fn drop_if_untracked(&self, event: &ClassifiedEvent, counted_against: &Arc<CommunitySnapshot>) {
        let Some(current) = self.cache.get(event.community_id) else {
            return;
        };
        if Arc::ptr_eq(&current, counted_against) || current.is_tracking(event.category) {
            return;
        }
        self.counter
            .clear_record(event.community_id, event.actor_id, event.category);
        debug!(
            target: EVENT_TARGET,
            guild_id = event.community_id,
            category = %event.category,
            "Dropped record counted against a stale snapshot"
        );
    }

    /// A record must not outlive its module; clear it if one slipped through
    fn heal_stale_record(&self, event: &ClassifiedEvent) {
        let stale = self
            .counter
            .get(event.community_id, event.actor_id, event.category)
            .is_some();
        debug_assert!(!stale, "action record kept for disabled {} protection", event.category);
        if stale {
            warn!(
                target: ERROR_TARGET,
                guild_id = event.community_id,
                category = %event.category,
                "Clearing action records of a disabled module"
            );
            self.counter.clear_category(event.community_id, event.category);
        }
    }

    // ---- Cache refresh ----

    /// Start the background refresh task
    ///
    /// Returns `None` if the task was already started.
    pub fn start_refresh_task(&self) -> Option<JoinHandle<()>> {
        let rx = self
            .refresh_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let service = self.clone();
        Some(tokio::spawn(async move {
            service.refresh_task(rx).await;
        }))
    }

    /// Ask the refresh task to do something
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh task has stopped.
    pub async fn request_refresh(&self, request: CacheRefreshRequest) -> ProtectionResult<()> {
        self.refresh_tx.send(request).await.map_err(|e| {
            ProtectionError::Other(format!("Failed to send refresh request: {e}"))
        })
    }

    /// Stop the refresh task and every event lane
    pub async fn shutdown(&self) {
        if let Err(e) = self.request_refresh(CacheRefreshRequest::Shutdown).await {
            debug!(error = %e, "Refresh task already stopped");
        }
        self.lanes.clear();
    }

    async fn refresh_task(&self, mut rx: Receiver<CacheRefreshRequest>) {
        let period = self.settings.cache_refresh_interval();
        info!("Starting configuration refresh task with {period:?} interval");

        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                Some(request) = rx.recv() => {
                    match request {
                        CacheRefreshRequest::RefreshAll => {
                            debug!("Received request to refresh all communities");
                            self.refresh_all().await;
                        }
                        CacheRefreshRequest::Invalidate { community_id } => {
                            debug!("Received request to refresh community {community_id}");
                            self.reload(community_id).await;
                        }
                        CacheRefreshRequest::Shutdown => {
                            info!("Received shutdown request for refresh task");
                            break;
                        }
                    }
                },

                _ = interval.tick() => {
                    debug!("Performing periodic configuration refresh");
                    self.refresh_all().await;
                }
            }
        }

        info!("Configuration refresh task shut down");
    }

    /// Re-read every cached community, drop records of modules that were
    /// switched off and forget records whose window has passed
    pub async fn refresh_all(&self) {
        let untracked = self
            .cache
            .refresh_all(&*self.store, self.settings.store_timeout())
            .await;
        for (community_id, categories) in untracked {
            self.clear_categories(community_id, &categories);
        }

        let pruned = self.counter.prune_expired(Utc::now());
        if pruned > 0 {
            debug!(pruned, "Pruned expired action records");
        }
    }

    /// Re-read one community after its configuration changed
    async fn reload(&self, community_id: u64) {
        match self
            .cache
            .refresh(&*self.store, community_id, self.settings.store_timeout())
            .await
        {
            Ok((Some(previous), current)) => {
                self.clear_categories(community_id, &current.untracked_since(&previous));
            }
            Ok((None, _)) => {}
            Err(e) => {
                warn!(guild_id = community_id, error = %e, "Failed to reload configuration");
                self.cache.invalidate(community_id);
            }
        }
    }

    fn clear_categories(&self, community_id: u64, categories: &[Category]) {
        for category in categories {
            let cleared = self.counter.clear_category(community_id, *category);
            if cleared > 0 {
                debug!(guild_id = community_id, category = %category, cleared, "Cleared action records");
            }
        }
    }

    // ---- Configuration surface ----

    /// Enable protection, creating default modules the first time
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn enable(&self, community_id: u64, owner_id: u64) -> ProtectionResult<CommunitySettings> {
        let mut settings = self
            .store
            .get_community(community_id)
            .await?
            .unwrap_or_else(|| CommunitySettings::new(community_id, owner_id));
        settings.enabled = true;
        settings.owner_id = owner_id;
        self.store.upsert_community(settings.clone()).await?;

        let existing = self.store.get_modules(community_id).await?;
        for module in ProtectionModule::defaults() {
            if !existing.iter().any(|m| m.category == module.category) {
                self.store.upsert_module(community_id, module).await?;
            }
        }

        info!(guild_id = community_id, owner_id, "Protection enabled");
        self.reload(community_id).await;
        Ok(settings)
    }

    /// Disable protection and forget every action record of the community
    ///
    /// # Errors
    ///
    /// Returns `NotEnabled` if the community was never set up.
    pub async fn disable(&self, community_id: u64) -> ProtectionResult<()> {
        let mut settings = self.community(community_id).await?;
        settings.enabled = false;
        self.store.upsert_community(settings).await?;

        // Lanes must see the new snapshot before the records go
        self.reload(community_id).await;
        self.counter.clear_community(community_id);
        info!(guild_id = community_id, "Protection disabled");
        Ok(())
    }

    /// Delete all configuration of a community
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn reset(&self, community_id: u64) -> ProtectionResult<()> {
        self.store.delete_community(community_id).await?;
        self.counter.clear_community(community_id);
        self.cache.invalidate(community_id);
        info!(guild_id = community_id, "Protection configuration reset");
        Ok(())
    }

    /// Record a new community owner
    ///
    /// # Errors
    ///
    /// Returns `NotEnabled` if the community was never set up.
    pub async fn set_owner(&self, community_id: u64, owner_id: u64) -> ProtectionResult<()> {
        let mut settings = self.community(community_id).await?;
        if settings.owner_id == owner_id {
            return Ok(());
        }
        settings.owner_id = owner_id;
        self.store.upsert_community(settings).await?;

        info!(guild_id = community_id, owner_id, "Community owner updated");
        self.reload(community_id).await;
        Ok(())
    }

    /// Set or clear the channel receiving punishment notifications
    ///
    /// # Errors
    ///
    /// Returns `NotEnabled` if the community was never set up.
    pub async fn set_log_channel(&self, community_id: u64, channel_id: Option<u64>) -> ProtectionResult<()> {
        let mut settings = self.community(community_id).await?;
        settings.log_channel_id = channel_id;
        self.store.upsert_community(settings).await?;
        self.reload(community_id).await;
        Ok(())
    }

    /// Switch a module on or off; switching off drops its action records
    ///
    /// # Errors
    ///
    /// Returns `NotEnabled` if the community was never set up.
    pub async fn set_module_toggle(
        &self,
        community_id: u64,
        category: Category,
        toggled: bool,
    ) -> ProtectionResult<ProtectionModule> {
        let mut module = self.module(community_id, category).await?;
        module.toggled = toggled;
        self.store.upsert_module(community_id, module.clone()).await?;

        self.reload(community_id).await;
        if !toggled {
            self.clear_categories(community_id, &[category]);
        }
        Ok(module)
    }

    /// Change how many actions per window trigger the punishment
    ///
    /// # Errors
    ///
    /// Returns `InvalidThreshold` for zero and `NotEnabled` if the community was
    /// never set up.
    pub async fn set_threshold(
        &self,
        community_id: u64,
        category: Category,
        threshold: u32,
    ) -> ProtectionResult<ProtectionModule> {
        if threshold == 0 {
            return Err(ProtectionError::InvalidThreshold(threshold));
        }
        let mut module = self.module(community_id, category).await?;
        module.threshold = threshold;
        self.store.upsert_module(community_id, module.clone()).await?;
        self.reload(community_id).await;
        Ok(module)
    }

    /// Change the punishment of a module
    ///
    /// # Errors
    ///
    /// Returns `NotEnabled` if the community was never set up.
    pub async fn set_punishment(
        &self,
        community_id: u64,
        category: Category,
        punishment: Punishment,
    ) -> ProtectionResult<ProtectionModule> {
        let mut module = self.module(community_id, category).await?;
        module.punishment = punishment;
        self.store.upsert_module(community_id, module.clone()).await?;
        self.reload(community_id).await;
        Ok(module)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn add_admin(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        let changed = self.store.add_admin(community_id, actor_id).await?;
        self.reload(community_id).await;
        Ok(changed)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn remove_admin(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        let changed = self.store.remove_admin(community_id, actor_id).await?;
        self.reload(community_id).await;
        Ok(changed)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn add_whitelist(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        let changed = self.store.add_whitelist(community_id, actor_id).await?;
        self.reload(community_id).await;
        Ok(changed)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn remove_whitelist(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        let changed = self.store.remove_whitelist(community_id, actor_id).await?;
        self.reload(community_id).await;
        Ok(changed)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn settings(&self, community_id: u64) -> ProtectionResult<Option<CommunitySettings>> {
        self.store.get_community(community_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn modules(&self, community_id: u64) -> ProtectionResult<Vec<ProtectionModule>> {
        self.store.get_modules(community_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn trust_list(&self, community_id: u64) -> ProtectionResult<TrustList> {
        self.store.get_trust_list(community_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn punishment_log(&self, community_id: u64) -> ProtectionResult<Vec<PunishmentLogEntry>> {
        self.store.punishment_log(community_id).await
    }

    /// Check if an actor may reconfigure the engine (owner or admin)
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn can_configure(&self, community_id: u64, actor_id: u64) -> ProtectionResult<bool> {
        let Some(settings) = self.store.get_community(community_id).await? else {
            return Ok(false);
        };
        if settings.owner_id == actor_id {
            return Ok(true);
        }
        Ok(self.store.get_trust_list(community_id).await?.is_admin(actor_id))
    }

    async fn community(&self, community_id: u64) -> ProtectionResult<CommunitySettings> {
        self.store
            .get_community(community_id)
            .await?
            .ok_or(ProtectionError::NotEnabled(community_id))
    }

    async fn module(&self, community_id: u64, category: Category) -> ProtectionResult<ProtectionModule> {
        self.community(community_id).await?;
        Ok(self
            .store
            .get_module(community_id, category)
            .await?
            .unwrap_or_else(|| ProtectionModule::new(category)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::{
        MockConfigStore, MockModerationPlatform, RawEventKind, YamlConfigStore,
    };
    use serenity::all::Permissions;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    const GUILD: u64 = 67890;
    const OTHER_GUILD: u64 = 13579;
    const OWNER: u64 = 1;
    const ACTOR: u64 = 12345;
    const ENGINE: u64 = 999;

    fn service(platform: MockModerationPlatform) -> ProtectionService {
        let store = Arc::new(YamlConfigStore::in_memory());
        ProtectionService::new(store, Arc::new(platform), Settings::default())
    }

    async fn protect(
        service: &ProtectionService,
        community_id: u64,
        category: Category,
        threshold: u32,
        punishment: Punishment,
    ) {
        service.enable(community_id, OWNER).await.unwrap();
        service.set_threshold(community_id, category, threshold).await.unwrap();
        service.set_punishment(community_id, category, punishment).await.unwrap();
        service.set_module_toggle(community_id, category, true).await.unwrap();
    }

    fn channel_delete(community_id: u64, actor_id: u64, offset_secs: i64) -> RawEvent {
        let start = Utc::now();
        RawEvent::new(community_id, RawEventKind::ChannelDelete, Some(actor_id))
            .at(start + ChronoDuration::seconds(offset_secs))
    }

    #[tokio::test]
    async fn test_channel_burst_kicks_once() {
        let mut platform = MockModerationPlatform::new();
        platform
            .expect_kick()
            .withf(|community_id, actor_id, _| *community_id == GUILD && *actor_id == ACTOR)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = service(platform);
        protect(&service, GUILD, Category::ChannelChange, 3, Punishment::Kick).await;

        let start = Utc::now();
        let at = |secs| {
            RawEvent::new(GUILD, RawEventKind::ChannelDelete, Some(ACTOR))
                .at(start + ChronoDuration::seconds(secs))
        };

        assert!(service.process_event(at(0)).await.is_none());
        assert!(service.process_event(at(5)).await.is_none());
        let entry = service.process_event(at(10)).await.unwrap();
        assert_eq!(entry.category, Category::ChannelChange);
        assert_eq!(entry.punishment, Punishment::Kick);
        assert!(entry.success);

        // The fourth event starts a new window
        assert!(service.process_event(at(12)).await.is_none());
        assert_eq!(
            service
                .counter()
                .get(GUILD, ACTOR, Category::ChannelChange)
                .unwrap()
                .count,
            1
        );

        let log = service.punishment_log(GUILD).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].actor_id, ACTOR);
    }

    #[tokio::test]
    async fn test_spaced_actions_never_fire() {
        let mut platform = MockModerationPlatform::new();
        platform.expect_ban().never();

        let service = service(platform);
        protect(&service, GUILD, Category::ChannelChange, 2, Punishment::Ban).await;

        for burst in 0..5 {
            let raw = channel_delete(GUILD, ACTOR, burst * 61);
            assert!(service.process_event(raw).await.is_none());
        }
        assert_eq!(
            service
                .counter()
                .get(GUILD, ACTOR, Category::ChannelChange)
                .unwrap()
                .count,
            1
        );
    }

    #[tokio::test]
    async fn test_immune_actors_are_never_counted() {
        let mut platform = MockModerationPlatform::new();
        platform.expect_ban().never();

        let service = service(platform);
        service.set_engine_id(ENGINE);
        protect(&service, GUILD, Category::ChannelChange, 1, Punishment::Ban).await;
        service.add_admin(GUILD, 2).await.unwrap();
        service.add_whitelist(GUILD, 3).await.unwrap();

        for actor in [OWNER, 2, 3, ENGINE] {
            for _ in 0..5 {
                assert!(service.process_event(channel_delete(GUILD, actor, 0)).await.is_none());
            }
        }
        assert!(service.counter().is_empty(GUILD));
    }

    #[tokio::test]
    async fn test_disabled_module_is_ignored() {
        let mut platform = MockModerationPlatform::new();
        platform.expect_ban().never();

        let service = service(platform);
        protect(&service, GUILD, Category::ChannelChange, 3, Punishment::Ban).await;
        service
            .set_module_toggle(GUILD, Category::Kick, false)
            .await
            .unwrap();

        let kick = RawEvent::new(GUILD, RawEventKind::MemberKick, Some(ACTOR));
        for _ in 0..5 {
            assert!(service.process_event(kick.clone()).await.is_none());
        }
        assert!(service.counter().get(GUILD, ACTOR, Category::Kick).is_none());
    }

    #[tokio::test]
    async fn test_disabling_module_clears_records() {
        let service = service(MockModerationPlatform::new());
        protect(&service, GUILD, Category::ChannelChange, 3, Punishment::Ban).await;

        service.process_event(channel_delete(GUILD, ACTOR, 0)).await;
        assert!(service.counter().get(GUILD, ACTOR, Category::ChannelChange).is_some());

        service
            .set_module_toggle(GUILD, Category::ChannelChange, false)
            .await
            .unwrap();
        assert!(service.counter().is_empty(GUILD));

        // Switching it back on starts from scratch
        service
            .set_module_toggle(GUILD, Category::ChannelChange, true)
            .await
            .unwrap();
        service.process_event(channel_delete(GUILD, ACTOR, 1)).await;
        assert_eq!(
            service
                .counter()
                .get(GUILD, ACTOR, Category::ChannelChange)
                .unwrap()
                .count,
            1
        );
    }

    #[tokio::test]
    async fn test_communities_are_independent() {
        let mut platform = MockModerationPlatform::new();
        platform
            .expect_ban()
            .withf(|community_id, _, _| *community_id == OTHER_GUILD)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = service(platform);
        protect(&service, GUILD, Category::ChannelChange, 3, Punishment::Ban).await;
        protect(&service, OTHER_GUILD, Category::ChannelChange, 2, Punishment::Ban).await;

        service.process_event(channel_delete(GUILD, ACTOR, 0)).await;
        service.process_event(channel_delete(OTHER_GUILD, ACTOR, 0)).await;
        assert!(service.process_event(channel_delete(OTHER_GUILD, ACTOR, 1)).await.is_some());

        assert_eq!(
            service
                .counter()
                .get(GUILD, ACTOR, Category::ChannelChange)
                .unwrap()
                .count,
            1
        );
    }

    #[tokio::test]
    async fn test_failed_punishment_does_not_stop_pipeline() {
        let mut platform = MockModerationPlatform::new();
        platform
            .expect_ban()
            .withf(|_, actor_id, _| *actor_id == ACTOR)
            .returning(|_, _, _| Err(ProtectionError::Other("Missing Permissions".to_string())));
        platform
            .expect_ban()
            .withf(|_, actor_id, _| *actor_id == 2)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = service(platform);
        protect(&service, GUILD, Category::RoleChange, 1, Punishment::Ban).await;

        let role_delete = |actor| RawEvent::new(GUILD, RawEventKind::RoleDelete, Some(actor));
        let failed = service.process_event(role_delete(ACTOR)).await.unwrap();
        assert!(!failed.success);
        let banned = service.process_event(role_delete(2)).await.unwrap();
        assert!(banned.success);

        let log = service.punishment_log(GUILD).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(!log[0].success);
        assert!(log[1].success);
    }

    #[tokio::test]
    async fn test_removal_clears_other_records() {
        let mut platform = MockModerationPlatform::new();
        platform
            .expect_ban()
            .withf(|_, user_id, _| *user_id == 77)
            .times(1)
            .returning(|_, _, _| Ok(()));
        platform
            .expect_ban()
            .withf(|_, user_id, _| *user_id == ACTOR)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = service(platform);
        protect(&service, GUILD, Category::ChannelChange, 5, Punishment::Ban).await;
        protect(&service, GUILD, Category::BotAdd, 1, Punishment::Ban).await;

        service.process_event(channel_delete(GUILD, ACTOR, 0)).await;
        assert_eq!(service.counter().len(GUILD), 1);

        let bot_add = RawEvent::new(GUILD, RawEventKind::BotAdd, Some(ACTOR)).with_target(77);
        let entry = service.process_event(bot_add).await.unwrap();
        assert!(entry.success);
        assert_eq!(entry.target_removed, Some(true));
        assert!(service.counter().is_empty(GUILD));
    }

    #[tokio::test]
    async fn test_bot_actor_is_always_banned() {
        let mut platform = MockModerationPlatform::new();
        platform.expect_direct_message().never();
        platform
            .expect_ban()
            .withf(|_, user_id, _| *user_id == ACTOR)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = service(platform);
        protect(&service, GUILD, Category::WebhookChange, 1, Punishment::Warn).await;

        let raw = RawEvent::new(GUILD, RawEventKind::WebhookCreate, Some(ACTOR)).by_bot(true);
        let entry = service.process_event(raw).await.unwrap();
        assert_eq!(entry.punishment, Punishment::Ban);
        assert!(entry.success);
    }

    #[tokio::test]
    async fn test_unbans_are_not_counted() {
        let mut platform = MockModerationPlatform::new();
        platform.expect_ban().never();

        let service = service(platform);
        protect(&service, GUILD, Category::Ban, 3, Punishment::Ban).await;

        for _ in 0..3 {
            let unban = RawEvent::new(GUILD, RawEventKind::MemberUnban, Some(ACTOR));
            assert!(service.process_event(unban).await.is_none());
        }
        assert!(service.counter().is_empty(GUILD));
    }

    #[tokio::test]
    async fn test_dangerous_role_edit_is_punished() {
        let mut platform = MockModerationPlatform::new();
        platform.expect_kick().times(1).returning(|_, _, _| Ok(()));

        let service = service(platform);
        protect(&service, GUILD, Category::PermissionChange, 1, Punishment::Kick).await;

        let cosmetic = RawEvent::new(
            GUILD,
            RawEventKind::RolePermissionUpdate {
                permissions: Permissions::SEND_MESSAGES,
            },
            Some(ACTOR),
        );
        assert!(service.process_event(cosmetic).await.is_none());

        let escalation = RawEvent::new(
            GUILD,
            RawEventKind::RolePermissionUpdate {
                permissions: Permissions::ADMINISTRATOR,
            },
            Some(ACTOR),
        );
        let entry = service.process_event(escalation).await.unwrap();
        assert_eq!(entry.category, Category::PermissionChange);
    }

    #[tokio::test]
    #[cfg_attr(
        debug_assertions,
        should_panic(expected = "action record kept for disabled")
    )]
    async fn test_stale_record_of_disabled_module_is_cleared() {
        let store = Arc::new(YamlConfigStore::in_memory());
        let service = ProtectionService::new(
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            Arc::new(MockModerationPlatform::new()),
            Settings::default(),
        );
        protect(&service, GUILD, Category::ChannelChange, 5, Punishment::Ban).await;
        service.process_event(channel_delete(GUILD, ACTOR, 0)).await;
        assert_eq!(service.counter().len(GUILD), 1);

        // Switched off in the store and evicted without the usual clearing
        let mut module = store.get_module(GUILD, Category::ChannelChange).await.unwrap().unwrap();
        module.toggled = false;
        store.upsert_module(GUILD, module).await.unwrap();
        service.cache().invalidate(GUILD);

        assert!(service.process_event(channel_delete(GUILD, ACTOR, 1)).await.is_none());
        assert!(service.counter().is_empty(GUILD));
    }

    #[tokio::test]
    async fn test_record_against_replaced_snapshot_is_dropped() {
        let service = service(MockModerationPlatform::new());
        protect(&service, GUILD, Category::ChannelChange, 5, Punishment::Ban).await;

        // An event whose lane loaded the snapshot just before the switch-off
        let raw = channel_delete(GUILD, ACTOR, 0);
        let event = classify(&raw, None).unwrap();
        let stale = service.cache().get(GUILD).unwrap();

        service
            .set_module_toggle(GUILD, Category::ChannelChange, false)
            .await
            .unwrap();
        let current = service.cache().get(GUILD).unwrap();
        assert!(!current.is_tracking(Category::ChannelChange));

        assert!(service.screen_and_count(&raw, &event, &stale).is_none());
        assert!(service.counter().is_empty(GUILD));

        // Later events are screened out without finding a stale record
        assert!(service.process_event(channel_delete(GUILD, ACTOR, 1)).await.is_none());
    }

    #[tokio::test]
    async fn test_disable_swaps_snapshot_before_clearing() {
        let service = service(MockModerationPlatform::new());
        protect(&service, GUILD, Category::ChannelChange, 5, Punishment::Ban).await;

        let raw = channel_delete(GUILD, ACTOR, 0);
        let event = classify(&raw, None).unwrap();
        let stale = service.cache().get(GUILD).unwrap();

        service.disable(GUILD).await.unwrap();
        assert!(!service.cache().get(GUILD).unwrap().settings.enabled);

        assert!(service.screen_and_count(&raw, &event, &stale).is_none());
        assert!(service.counter().is_empty(GUILD));
        assert!(service.process_event(channel_delete(GUILD, ACTOR, 1)).await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_prunes_expired_records() {
        let service = service(MockModerationPlatform::new());
        protect(&service, GUILD, Category::ChannelChange, 5, Punishment::Ban).await;

        service.process_event(channel_delete(GUILD, ACTOR, -120)).await;
        service.process_event(channel_delete(GUILD, 2, 0)).await;
        assert_eq!(service.counter().len(GUILD), 2);

        service.refresh_all().await;
        assert!(service.counter().get(GUILD, ACTOR, Category::ChannelChange).is_none());
        assert!(service.counter().get(GUILD, 2, Category::ChannelChange).is_some());
    }

    #[tokio::test]
    async fn test_store_outage_drops_event() {
        let mut store = MockConfigStore::new();
        store
            .expect_get_community()
            .returning(|_| Err(ProtectionError::Persistence("connection refused".to_string())));
        let mut platform = MockModerationPlatform::new();
        platform.expect_ban().never();

        let service = ProtectionService::new(Arc::new(store), Arc::new(platform), Settings::default());
        assert!(service.process_event(channel_delete(GUILD, ACTOR, 0)).await.is_none());
        assert!(service.counter().is_empty(GUILD));
    }

    #[tokio::test]
    async fn test_unknown_community_is_unprotected() {
        let service = service(MockModerationPlatform::new());
        let raw = RawEvent::new(GUILD, RawEventKind::BotAdd, Some(ACTOR));
        assert!(service.process_event(raw).await.is_none());
        assert!(service.counter().is_empty(GUILD));
    }

    #[tokio::test]
    async fn test_disable_and_reset() {
        let service = service(MockModerationPlatform::new());
        protect(&service, GUILD, Category::ChannelChange, 3, Punishment::Ban).await;
        service.process_event(channel_delete(GUILD, ACTOR, 0)).await;

        service.disable(GUILD).await.unwrap();
        assert!(service.counter().is_empty(GUILD));
        assert!(!service.settings(GUILD).await.unwrap().unwrap().enabled);
        assert!(service.process_event(channel_delete(GUILD, ACTOR, 1)).await.is_none());

        service.reset(GUILD).await.unwrap();
        assert!(service.settings(GUILD).await.unwrap().is_none());
        assert!(service.modules(GUILD).await.unwrap().is_empty());
        assert!(matches!(
            service.disable(GUILD).await,
            Err(ProtectionError::NotEnabled(GUILD))
        ));
    }

    #[tokio::test]
    async fn test_configuration_surface() {
        let service = service(MockModerationPlatform::new());
        assert!(matches!(
            service.set_threshold(GUILD, Category::Ban, 3).await,
            Err(ProtectionError::NotEnabled(GUILD))
        ));

        let settings = service.enable(GUILD, OWNER).await.unwrap();
        assert!(settings.enabled);
        let modules = service.modules(GUILD).await.unwrap();
        assert_eq!(modules.len(), Category::ALL.len());
        assert!(modules.iter().all(|m| !m.toggled && m.threshold == 1));

        assert!(matches!(
            service.set_threshold(GUILD, Category::Ban, 0).await,
            Err(ProtectionError::InvalidThreshold(0))
        ));

        // Re-enabling keeps customised modules
        service.set_threshold(GUILD, Category::Ban, 4).await.unwrap();
        service.enable(GUILD, OWNER).await.unwrap();
        let ban = service
            .modules(GUILD)
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.category == Category::Ban)
            .unwrap();
        assert_eq!(ban.threshold, 4);

        service.set_log_channel(GUILD, Some(555)).await.unwrap();
        assert_eq!(
            service.settings(GUILD).await.unwrap().unwrap().log_channel_id,
            Some(555)
        );

        assert!(service.can_configure(GUILD, OWNER).await.unwrap());
        assert!(!service.can_configure(GUILD, 2).await.unwrap());
        service.add_admin(GUILD, 2).await.unwrap();
        assert!(service.can_configure(GUILD, 2).await.unwrap());

        // Whitelisting an admin demotes them
        service.add_whitelist(GUILD, 2).await.unwrap();
        let trust = service.trust_list(GUILD).await.unwrap();
        assert!(!trust.is_admin(2));
        assert!(trust.is_whitelisted(2));
        assert!(!service.can_configure(GUILD, 2).await.unwrap());

        service.set_owner(GUILD, 8).await.unwrap();
        assert!(service.can_configure(GUILD, 8).await.unwrap());
        assert!(!service.can_configure(GUILD, OWNER).await.unwrap());
        assert!(!service.can_configure(OTHER_GUILD, OWNER).await.unwrap());
    }

    #[tokio::test]
    async fn test_trust_changes_apply_immediately() {
        let mut platform = MockModerationPlatform::new();
        platform.expect_kick().times(1).returning(|_, _, _| Ok(()));

        let service = service(platform);
        protect(&service, GUILD, Category::Kick, 1, Punishment::Kick).await;
        service.add_whitelist(GUILD, ACTOR).await.unwrap();

        let kick = RawEvent::new(GUILD, RawEventKind::MemberKick, Some(ACTOR));
        assert!(service.process_event(kick.clone()).await.is_none());

        service.remove_whitelist(GUILD, ACTOR).await.unwrap();
        assert!(service.process_event(kick).await.is_some());
    }

    async fn wait_for_log(service: &ProtectionService, community_id: u64, len: usize) -> Vec<PunishmentLogEntry> {
        for _ in 0..200 {
            let log = service.punishment_log(community_id).await.unwrap();
            if log.len() >= len {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        service.punishment_log(community_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_submitted_events_are_punished() {
        let mut platform = MockModerationPlatform::new();
        platform.expect_ban().times(2).returning(|_, _, _| Ok(()));

        let service = service(platform);
        protect(&service, GUILD, Category::WebhookChange, 2, Punishment::Ban).await;
        protect(&service, OTHER_GUILD, Category::WebhookChange, 2, Punishment::Ban).await;

        for community_id in [GUILD, OTHER_GUILD] {
            for _ in 0..2 {
                service.submit(RawEvent::new(community_id, RawEventKind::WebhookCreate, Some(ACTOR)));
            }
        }

        assert_eq!(wait_for_log(&service, GUILD, 1).await.len(), 1);
        assert_eq!(wait_for_log(&service, OTHER_GUILD, 1).await.len(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_drops_records_of_untracked_modules() {
        let store = Arc::new(YamlConfigStore::in_memory());
        let service = ProtectionService::new(
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            Arc::new(MockModerationPlatform::new()),
            Settings::default(),
        );
        let task = service.start_refresh_task().unwrap();
        assert!(service.start_refresh_task().is_none());

        protect(&service, GUILD, Category::ChannelChange, 3, Punishment::Ban).await;
        service.process_event(channel_delete(GUILD, ACTOR, 0)).await;
        assert_eq!(service.counter().len(GUILD), 1);

        // Changed behind the service's back, only a refresh notices
        let mut module = store.get_module(GUILD, Category::ChannelChange).await.unwrap().unwrap();
        module.toggled = false;
        store.upsert_module(GUILD, module).await.unwrap();
        assert_eq!(service.counter().len(GUILD), 1);

        service
            .request_refresh(CacheRefreshRequest::RefreshAll)
            .await
            .unwrap();
        for _ in 0..200 {
            if service.counter().is_empty(GUILD) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.counter().is_empty(GUILD));

        service.shutdown().await;
        task.await.unwrap();
    }
}
