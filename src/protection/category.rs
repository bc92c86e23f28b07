//! Protection categories and punishments
//!
//! This module defines the kinds of sensitive actions the engine tracks and the
//! per-category module configuration that decides how they are punished.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Kind of sensitive administrative action
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Member bans and unbans
    #[display("Ban")]
    Ban,
    /// Member kicks
    #[display("Kick")]
    Kick,
    /// Bot accounts added to the community
    #[display("BotAdd")]
    BotAdd,
    /// Role creation and deletion
    #[display("RoleChange")]
    RoleChange,
    /// Vanity URL changes
    #[display("VanityChange")]
    VanityChange,
    /// Webhook creation and deletion
    #[display("WebhookChange")]
    WebhookChange,
    /// Channel creation, deletion and updates
    #[display("ChannelChange")]
    ChannelChange,
    /// Granting a role that carries a dangerous permission
    #[display("PermissionChange")]
    PermissionChange,
}

impl Category {
    /// Every category, in display order
    pub const ALL: [Self; 8] = [
        Self::Ban,
        Self::Kick,
        Self::BotAdd,
        Self::RoleChange,
        Self::VanityChange,
        Self::WebhookChange,
        Self::ChannelChange,
        Self::PermissionChange,
    ];
}

/// Punishment applied once an actor crosses a module threshold
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Punishment {
    /// Server ban
    #[default]
    #[display("Ban")]
    Ban,
    /// Server kick
    #[display("Kick")]
    Kick,
    /// Direct message warning, no moderation action
    #[display("Warn")]
    Warn,
    /// Remove every role granting a dangerous permission
    #[display("StripRoles")]
    StripRoles,
}

impl Punishment {
    /// Check if this punishment removes the actor from the community
    #[must_use]
    pub fn removes_member(self) -> bool {
        match self {
            Self::Ban | Self::Kick => true,
            Self::Warn | Self::StripRoles => false,
        }
    }
}

/// Per-category protection settings for one community
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionModule {
    /// Category this module guards
    pub category: Category,
    /// What happens when the threshold is reached
    pub punishment: Punishment,
    /// Number of actions inside one window that triggers the punishment
    pub threshold: u32,
    /// Whether the module is active
    pub toggled: bool,
}

impl ProtectionModule {
    /// Create a module with the default settings (ban on first action, disabled)
    #[must_use]
    pub fn new(category: Category) -> Self {
        Self {
            category,
            punishment: Punishment::default(),
            threshold: 1,
            toggled: false,
        }
    }

    /// Default modules for every category
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        Category::ALL.into_iter().map(Self::new).collect()
    }
}
