use crate::EVENT_TARGET;
use crate::protection::{
    ProtectionError, ProtectionService, RawEvent, RawEventKind, category_for,
};
use serenity::all::{
    Context, EventHandler, Guild, GuildId, PartialGuild, Permissions, Ready, RoleId, UserId,
};
use serenity::model::guild::audit_log::{
    Action, AuditLogEntry, Change, ChannelAction, MemberAction, RoleAction, WebhookAction,
};
use tracing::{debug, info, warn};

pub struct Handler {
    service: ProtectionService,
}

impl Handler {
    #[must_use]
    pub fn new(service: ProtectionService) -> Self {
        Self { service }
    }
}

/// Audit log action reduced to what the engine cares about
#[derive(Debug, Clone, PartialEq, Eq)]
enum AuditAction {
    Kind(RawEventKind),
    /// Roles were granted; their permissions still need resolving
    RoleGrant(Vec<RoleId>),
}

fn audit_action(action: &Action, changes: &[Change]) -> AuditAction {
    let kind = match action {
        Action::Channel(ChannelAction::Create) => RawEventKind::ChannelCreate,
        Action::Channel(ChannelAction::Delete) => RawEventKind::ChannelDelete,
        Action::Channel(ChannelAction::Update) => RawEventKind::ChannelUpdate,
        Action::Role(RoleAction::Create) => RawEventKind::RoleCreate,
        Action::Role(RoleAction::Delete) => RawEventKind::RoleDelete,
        Action::Role(RoleAction::Update) => changes
            .iter()
            .find_map(|change| match change {
                Change::Permissions { new: Some(permissions), .. } => {
                    Some(RawEventKind::RolePermissionUpdate {
                        permissions: *permissions,
                    })
                }
                _ => None,
            })
            .unwrap_or(RawEventKind::RoleUpdate),
        Action::Member(MemberAction::BanAdd) => RawEventKind::MemberBan,
        Action::Member(MemberAction::BanRemove) => RawEventKind::MemberUnban,
        Action::Member(MemberAction::Kick) => RawEventKind::MemberKick,
        Action::Member(MemberAction::BotAdd) => RawEventKind::BotAdd,
        Action::Member(MemberAction::RoleUpdate) => {
            let granted: Vec<RoleId> = changes
                .iter()
                .filter_map(|change| match change {
                    Change::RolesAdded { new: Some(roles), .. } => Some(roles),
                    _ => None,
                })
                .flatten()
                .map(|role| role.id)
                .collect();
            if granted.is_empty() {
                RawEventKind::Other
            } else {
                return AuditAction::RoleGrant(granted);
            }
        }
        Action::Webhook(WebhookAction::Create) => RawEventKind::WebhookCreate,
        Action::Webhook(WebhookAction::Update) => RawEventKind::WebhookUpdate,
        Action::Webhook(WebhookAction::Delete) => RawEventKind::WebhookDelete,
        Action::GuildUpdate
            if changes
                .iter()
                .any(|change| matches!(change, Change::VanityUrlCode { .. })) =>
        {
            RawEventKind::GuildVanityUpdate
        }
        _ => RawEventKind::Other,
    };
    AuditAction::Kind(kind)
}

/// Union of the permissions carried by the granted roles
async fn granted_permissions(ctx: &Context, guild_id: GuildId, role_ids: &[RoleId]) -> Permissions {
    let cached = ctx.cache.guild(guild_id).map(|guild| {
        role_ids
            .iter()
            .filter_map(|role_id| guild.roles.get(role_id))
            .fold(Permissions::empty(), |acc, role| acc | role.permissions)
    });
    if let Some(permissions) = cached {
        return permissions;
    }

    match guild_id.roles(&ctx.http).await {
        Ok(roles) => role_ids
            .iter()
            .filter_map(|role_id| roles.get(role_id))
            .fold(Permissions::empty(), |acc, role| acc | role.permissions),
        Err(e) => {
            warn!(target: EVENT_TARGET, guild_id = guild_id.get(), error = %e, "Failed to resolve granted roles");
            Permissions::empty()
        }
    }
}

/// Whether the acting account is a bot, from the cache first
async fn actor_is_bot(ctx: &Context, user_id: UserId) -> bool {
    let cached = ctx.cache.user(user_id).map(|user| user.bot);
    if let Some(bot) = cached {
        return bot;
    }

    match ctx.http.get_user(user_id).await {
        Ok(user) => user.bot,
        Err(e) => {
            debug!(target: EVENT_TARGET, user_id = user_id.get(), error = %e, "Failed to resolve actor");
            false
        }
    }
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        self.service.set_engine_id(ready.user.id.get());
        info!("Connected as {user_name}, shard {shard_id}");
    }

    async fn guild_audit_log_entry_create(&self, ctx: Context, entry: AuditLogEntry, guild_id: GuildId) {
        let changes = entry.changes.as_deref().unwrap_or_default();
        let kind = match audit_action(&entry.action, changes) {
            AuditAction::Kind(kind) => kind,
            AuditAction::RoleGrant(role_ids) => RawEventKind::MemberRoleGrant {
                granted: granted_permissions(&ctx, guild_id, &role_ids).await,
            },
        };

        // Only tracked events are worth a lookup
        let by_bot = category_for(kind).is_some() && actor_is_bot(&ctx, entry.user_id).await;
        let raw = RawEvent::new(guild_id.get(), kind, Some(entry.user_id.get()))
            .by_bot(by_bot)
            .with_target(entry.target_id.map(|id| id.get()));
        debug!(
            target: EVENT_TARGET,
            guild_id = raw.community_id,
            user_id = ?raw.actor_id,
            kind = ?raw.kind,
            "Audit log entry received"
        );
        self.service.submit(raw);
    }

    /// Keeps the implicit owner immunity in step with ownership transfers.
    async fn guild_update(&self, _ctx: Context, _old: Option<Guild>, new: PartialGuild) {
        match self.service.set_owner(new.id.get(), new.owner_id.get()).await {
            Ok(()) | Err(ProtectionError::NotEnabled(_)) => {}
            Err(e) => {
                warn!(target: EVENT_TARGET, guild_id = new.id.get(), error = %e, "Failed to update community owner");
            }
        }
    }
}
