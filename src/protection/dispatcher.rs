//! Punishment dispatcher
//!
//! Runs the configured punishment against an actor. Every failure is caught
//! here: the caller always gets a log entry back, never an error.

use crate::logging;
use crate::protection::{
    Category, ConfigStore, DANGEROUS_PERMISSIONS, ModerationPlatform, ProtectionError,
    ProtectionResult, Punishment, PunishmentLogEntry,
};
use crate::ERROR_TARGET;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// A punishment that has been decided but not yet applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentRequest {
    pub community_id: u64,
    pub actor_id: u64,
    /// What the triggering event was done to
    pub target_id: Option<u64>,
    pub category: Category,
    pub punishment: Punishment,
    /// Where to post the outcome, if anywhere
    pub log_channel_id: Option<u64>,
}

/// Applies punishments and records their outcome
#[derive(Clone)]
pub struct PunishmentDispatcher {
    platform: Arc<dyn ModerationPlatform>,
    store: Arc<dyn ConfigStore>,
    /// Upper bound for each platform call
    timeout: Duration,
    engine_name: String,
}

impl PunishmentDispatcher {
    pub fn new(
        platform: Arc<dyn ModerationPlatform>,
        store: Arc<dyn ConfigStore>,
        timeout: Duration,
        engine_name: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            store,
            timeout,
            engine_name: engine_name.into(),
        }
    }

    /// Audit log reason attached to moderation calls
    #[must_use]
    pub fn reason(&self, category: Category) -> String {
        format!(
            "{} Anti-Nuke: Protection {category} (Anti-{category})",
            self.engine_name
        )
    }

    /// Audit log reason for removing what the actor brought in
    #[must_use]
    pub fn cleanup_reason(&self, category: Category) -> String {
        format!("{} Anti-Nuke: Cleanup (Anti-{category})", self.engine_name)
    }

    /// Apply a punishment, record it and notify the log channel
    ///
    /// Exactly one log entry is written per call, whatever the outcome. A bot
    /// added by the actor is banned first and recorded in the same entry.
    pub async fn dispatch(&self, request: &PunishmentRequest) -> PunishmentLogEntry {
        let mut entry = PunishmentLogEntry::new(
            request.community_id,
            request.actor_id,
            request.category,
            request.punishment,
        );

        if let Some(bot_id) = added_bot(request) {
            let removed = self.remove_added_bot(request, bot_id).await;
            entry = entry.with_target_removal(bot_id, removed);
        }

        let entry = match self.execute(request).await {
            Ok(()) => entry,
            Err(e) => entry.failed(e.to_string()),
        };
        logging::log_punishment(&entry);

        if let Err(e) = self.store.append_punishment_log(entry.clone()).await {
            error!(
                target: ERROR_TARGET,
                guild_id = entry.community_id,
                user_id = entry.actor_id,
                error = %e,
                "Failed to write punishment log"
            );
        }

        if let Some(channel_id) = request.log_channel_id {
            self.notify(channel_id, &entry).await;
        }

        entry
    }

    async fn execute(&self, request: &PunishmentRequest) -> ProtectionResult<()> {
        let community_id = request.community_id;
        let actor_id = request.actor_id;
        let reason = self.reason(request.category);

        match request.punishment {
            Punishment::Ban => {
                self.bounded(self.platform.ban(community_id, actor_id, &reason))
                    .await
            }
            Punishment::Kick => {
                self.bounded(self.platform.kick(community_id, actor_id, &reason))
                    .await
            }
            Punishment::Warn => {
                let text = self.warning_text(request);
                self.bounded(self.platform.direct_message(actor_id, &text))
                    .await
            }
            Punishment::StripRoles => self.strip_roles(request, &reason).await,
        }
    }

    async fn remove_added_bot(&self, request: &PunishmentRequest, bot_id: u64) -> bool {
        let reason = self.cleanup_reason(request.category);
        match self
            .bounded(self.platform.ban(request.community_id, bot_id, &reason))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    guild_id = request.community_id,
                    user_id = bot_id,
                    error = %e,
                    "Failed to ban added bot"
                );
                false
            }
        }
    }

    async fn strip_roles(&self, request: &PunishmentRequest, reason: &str) -> ProtectionResult<()> {
        let roles = self
            .bounded(self.platform.member_roles(request.community_id, request.actor_id))
            .await?;

        let dangerous: Vec<u64> = roles
            .iter()
            .filter(|role| role.permissions.intersects(DANGEROUS_PERMISSIONS))
            .map(|role| role.role_id)
            .collect();

        if dangerous.is_empty() {
            debug!(
                guild_id = request.community_id,
                user_id = request.actor_id,
                "No dangerous roles to strip"
            );
            return Ok(());
        }

        self.bounded(self.platform.remove_roles(
            request.community_id,
            request.actor_id,
            &dangerous,
            reason,
        ))
        .await
    }

    async fn notify(&self, channel_id: u64, entry: &PunishmentLogEntry) {
        let text = self.notification_text(entry);
        if let Err(e) = self.bounded(self.platform.notify(channel_id, &text)).await {
            warn!(
                guild_id = entry.community_id,
                channel_id,
                error = %e,
                "Failed to send punishment notification"
            );
        }
    }

    /// Fail the call once the timeout elapses; it is never retried
    async fn bounded<T>(
        &self,
        call: impl Future<Output = ProtectionResult<T>>,
    ) -> ProtectionResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ProtectionError::Timeout(self.timeout))?
    }

    fn warning_text(&self, request: &PunishmentRequest) -> String {
        format!(
            "You have been warned by {} Anti-Nuke for triggering the {} protection in server {}. \
             Further actions may result in removal.",
            self.engine_name, request.category, request.community_id
        )
    }

    fn notification_text(&self, entry: &PunishmentLogEntry) -> String {
        let outcome = match &entry.error {
            None => "applied".to_string(),
            Some(error) => format!("failed: {error}"),
        };
        let mut text = format!(
            "**{} Anti-Nuke** | <@{}> triggered **{}** protection\nPunishment: {} ({outcome})",
            self.engine_name, entry.actor_id, entry.category, entry.punishment
        );
        if let (Some(target_id), Some(removed)) = (entry.target_id, entry.target_removed) {
            let state = if removed { "banned" } else { "could not be banned" };
            text.push_str(&format!("\nAdded bot <@{target_id}> {state}"));
        }
        text
    }
}

/// The bot a `BotAdd` event brought into the community, if known
fn added_bot(request: &PunishmentRequest) -> Option<u64> {
    match request.category {
        Category::BotAdd => request
            .target_id
            .filter(|target_id| *target_id != request.actor_id),
        _ => None,
    }
}
