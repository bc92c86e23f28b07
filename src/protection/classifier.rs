//! Event classification
//!
//! Normalizes raw gateway events into the categories tracked by the engine.
//! Everything here is pure: no network, no storage.

use crate::protection::Category;
use chrono::{DateTime, Utc};
use serenity::all::Permissions;

/// Permissions that make a role grant or a role held by an attacker dangerous
pub const DANGEROUS_PERMISSIONS: Permissions = Permissions::from_bits_truncate(
    Permissions::ADMINISTRATOR.bits()
        | Permissions::MANAGE_ROLES.bits()
        | Permissions::MANAGE_CHANNELS.bits()
        | Permissions::MANAGE_WEBHOOKS.bits()
        | Permissions::BAN_MEMBERS.bits()
        | Permissions::KICK_MEMBERS.bits()
        | Permissions::MUTE_MEMBERS.bits()
        | Permissions::MANAGE_MESSAGES.bits()
        | Permissions::MANAGE_GUILD.bits()
        | Permissions::MENTION_EVERYONE.bits()
        | Permissions::MANAGE_GUILD_EXPRESSIONS.bits()
        | Permissions::MODERATE_MEMBERS.bits(),
);

/// Kind of administrative event observed on the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    ChannelCreate,
    ChannelDelete,
    ChannelUpdate,
    RoleCreate,
    RoleDelete,
    /// A role was edited without touching its permissions
    RoleUpdate,
    /// A role's permissions were edited; `permissions` is the new set
    RolePermissionUpdate { permissions: Permissions },
    MemberBan,
    MemberUnban,
    MemberKick,
    BotAdd,
    /// Roles were added to a member; `granted` is the union of their permissions
    MemberRoleGrant { granted: Permissions },
    WebhookCreate,
    WebhookUpdate,
    WebhookDelete,
    GuildVanityUpdate,
    /// Anything the engine does not track
    Other,
}

/// An administrative event as delivered by the platform client
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Community the event happened in
    pub community_id: u64,
    /// What happened
    pub kind: RawEventKind,
    /// Who did it, if the platform could tell
    pub actor_id: Option<u64>,
    /// Whether the actor is a bot account
    pub actor_is_bot: bool,
    /// What it was done to (member, role, channel...)
    pub target_id: Option<u64>,
    /// When it happened
    pub occurred_at: DateTime<Utc>,
}

impl RawEvent {
    /// Create an event that happened just now
    #[must_use]
    pub fn new(community_id: u64, kind: RawEventKind, actor_id: Option<u64>) -> Self {
        Self {
            community_id,
            kind,
            actor_id,
            actor_is_bot: false,
            target_id: None,
            occurred_at: Utc::now(),
        }
    }

    /// Mark the actor as a bot account
    #[must_use]
    pub fn by_bot(mut self, actor_is_bot: bool) -> Self {
        self.actor_is_bot = actor_is_bot;
        self
    }

    /// Set the target of the event
    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<Option<u64>>) -> Self {
        self.target_id = target_id.into();
        self
    }

    /// Override the event timestamp
    #[must_use]
    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// An event attributed to an actor and mapped to a category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub community_id: u64,
    pub actor_id: u64,
    pub actor_is_bot: bool,
    pub target_id: Option<u64>,
    pub category: Category,
    pub occurred_at: DateTime<Utc>,
}

/// Why an event never reached the counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The platform did not report who acted
    UnresolvedActor,
    /// The engine itself performed the action
    SelfAction,
    /// The event kind is not tracked
    Untracked,
    /// Protection is disabled for the community
    ProtectionDisabled,
    /// The module for this category is missing or switched off
    ModuleDisabled,
    /// The actor owns the community
    Owner,
    /// The actor is an engine admin
    Admin,
    /// The actor is whitelisted
    Whitelisted,
    /// The configuration could not be read
    StoreUnavailable,
}

impl DropReason {
    /// Check if the drop was caused by a trusted actor
    #[must_use]
    pub fn is_immunity(self) -> bool {
        matches!(self, Self::Owner | Self::Admin | Self::Whitelisted)
    }
}

/// Map a raw event kind to a tracked category
#[must_use]
pub fn category_for(kind: RawEventKind) -> Option<Category> {
    match kind {
        RawEventKind::MemberBan => Some(Category::Ban),
        RawEventKind::MemberKick => Some(Category::Kick),
        RawEventKind::BotAdd => Some(Category::BotAdd),
        RawEventKind::RoleCreate | RawEventKind::RoleDelete => Some(Category::RoleChange),
        RawEventKind::GuildVanityUpdate => Some(Category::VanityChange),
        RawEventKind::WebhookCreate | RawEventKind::WebhookDelete => {
            Some(Category::WebhookChange)
        }
        RawEventKind::ChannelCreate | RawEventKind::ChannelDelete | RawEventKind::ChannelUpdate => {
            Some(Category::ChannelChange)
        }
        RawEventKind::MemberRoleGrant { granted } if granted.intersects(DANGEROUS_PERMISSIONS) => {
            Some(Category::PermissionChange)
        }
        RawEventKind::RolePermissionUpdate { permissions }
            if permissions.intersects(DANGEROUS_PERMISSIONS) =>
        {
            Some(Category::PermissionChange)
        }
        RawEventKind::MemberRoleGrant { .. }
        | RawEventKind::RolePermissionUpdate { .. }
        | RawEventKind::RoleUpdate
        | RawEventKind::MemberUnban
        | RawEventKind::WebhookUpdate
        | RawEventKind::Other => None,
    }
}

/// Classify a raw event, attributing it to an actor
///
/// # Errors
///
/// Returns the `DropReason` when the event cannot be attributed or is not tracked.
pub fn classify(raw: &RawEvent, engine_id: Option<u64>) -> Result<ClassifiedEvent, DropReason> {
    let actor_id = raw.actor_id.ok_or(DropReason::UnresolvedActor)?;
    if engine_id == Some(actor_id) {
        return Err(DropReason::SelfAction);
    }

    let category = category_for(raw.kind).ok_or(DropReason::Untracked)?;

    Ok(ClassifiedEvent {
        community_id: raw.community_id,
        actor_id,
        actor_is_bot: raw.actor_is_bot,
        target_id: raw.target_id,
        category,
        occurred_at: raw.occurred_at,
    })
}
