//! Outbound calls to the chat platform
//!
//! The dispatcher only talks to `ModerationPlatform`, so punishments can be
//! exercised without a gateway connection.

use crate::protection::{ProtectionError, ProtectionResult};
use async_trait::async_trait;
use serenity::all::{ChannelId, EditMember, GuildId, Http, Permissions, RoleId, UserId};
use std::sync::Arc;
use tracing::debug;

/// A role held by a member together with the permissions it grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleGrant {
    pub role_id: u64,
    pub permissions: Permissions,
}

/// Moderation primitives provided by the platform client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModerationPlatform: Send + Sync {
    async fn ban(&self, community_id: u64, actor_id: u64, reason: &str) -> ProtectionResult<()>;

    async fn kick(&self, community_id: u64, actor_id: u64, reason: &str) -> ProtectionResult<()>;

    async fn direct_message(&self, actor_id: u64, text: &str) -> ProtectionResult<()>;

    /// Roles the actor currently holds in the community
    async fn member_roles(&self, community_id: u64, actor_id: u64) -> ProtectionResult<Vec<RoleGrant>>;

    /// Remove several roles from the actor in one call
    async fn remove_roles(
        &self,
        community_id: u64,
        actor_id: u64,
        role_ids: &[u64],
        reason: &str,
    ) -> ProtectionResult<()>;

    /// Post a message to a channel
    async fn notify(&self, channel_id: u64, text: &str) -> ProtectionResult<()>;
}

/// `ModerationPlatform` backed by the Discord REST API
#[derive(Clone)]
pub struct SerenityPlatform {
    http: Arc<Http>,
}

impl SerenityPlatform {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ModerationPlatform for SerenityPlatform {
    async fn ban(&self, community_id: u64, actor_id: u64, reason: &str) -> ProtectionResult<()> {
        GuildId::new(community_id)
            .ban_with_reason(&*self.http, UserId::new(actor_id), 0, reason)
            .await?;
        Ok(())
    }

    async fn kick(&self, community_id: u64, actor_id: u64, reason: &str) -> ProtectionResult<()> {
        GuildId::new(community_id)
            .kick_with_reason(&*self.http, UserId::new(actor_id), reason)
            .await?;
        Ok(())
    }

    async fn direct_message(&self, actor_id: u64, text: &str) -> ProtectionResult<()> {
        let channel = UserId::new(actor_id).create_dm_channel(&*self.http).await?;
        channel.say(&*self.http, text).await?;
        Ok(())
    }

    async fn member_roles(&self, community_id: u64, actor_id: u64) -> ProtectionResult<Vec<RoleGrant>> {
        let guild_id = GuildId::new(community_id);
        let member = guild_id
            .member(&*self.http, UserId::new(actor_id))
            .await
            .map_err(|e| {
                debug!(community_id, actor_id, error = %e, "Failed to fetch member");
                ProtectionError::MemberNotFound {
                    community_id,
                    actor_id,
                }
            })?;
        let roles = guild_id.roles(&*self.http).await?;

        Ok(member
            .roles
            .iter()
            .filter_map(|role_id| roles.get(role_id))
            .map(|role| RoleGrant {
                role_id: role.id.get(),
                permissions: role.permissions,
            })
            .collect())
    }

    async fn remove_roles(
        &self,
        community_id: u64,
        actor_id: u64,
        role_ids: &[u64],
        reason: &str,
    ) -> ProtectionResult<()> {
        let guild_id = GuildId::new(community_id);
        let user_id = UserId::new(actor_id);
        let member = guild_id.member(&*self.http, user_id).await?;

        let remaining: Vec<RoleId> = member
            .roles
            .iter()
            .copied()
            .filter(|role_id| !role_ids.contains(&role_id.get()))
            .collect();

        guild_id
            .edit_member(
                &*self.http,
                user_id,
                EditMember::new().roles(remaining).audit_log_reason(reason),
            )
            .await?;
        Ok(())
    }

    async fn notify(&self, channel_id: u64, text: &str) -> ProtectionResult<()> {
        ChannelId::new(channel_id).say(&*self.http, text).await?;
        Ok(())
    }
}
