use crate::protection::{DropReason, Punishment, PunishmentLogEntry, RawEvent};
use crate::{CONSOLE_TARGET, EVENT_TARGET, Error, PUNISHMENT_TARGET};
use std::path::Path;
use tracing::{debug, error, info, trace, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Punishment log file name
pub const PUNISHMENT_LOG_FILE: &str = "punishments";

/// Initialize the logging system with console and file outputs
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or the default
/// filter directive is invalid.
pub fn init() -> Result<(), Error> {
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let punishment_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, PUNISHMENT_LOG_FILE);

    // Human-readable console output
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // Structured JSON for the audit trail
    let punishment_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(punishment_file);

    // RUST_LOG wins; otherwise info, with serenity's heartbeat chatter muted
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info").add_directive("serenity=error".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(punishment_layer)
        .init();

    info!("Logging system initialized");
    Ok(())
}

/// Log the outcome of a punishment attempt
pub fn log_punishment(entry: &PunishmentLogEntry) {
    if entry.success {
        info!(
            target: PUNISHMENT_TARGET,
            id = %entry.id,
            guild_id = entry.community_id,
            user_id = entry.actor_id,
            category = %entry.category,
            punishment = %entry.punishment,
            event = "punished",
            "Punishment applied"
        );
        return;
    }

    let error = entry.error.as_deref().unwrap_or("unknown error");
    // An undeliverable warning is expected (closed DMs) and not worth an alert
    if entry.punishment == Punishment::Warn {
        info!(
            target: PUNISHMENT_TARGET,
            id = %entry.id,
            guild_id = entry.community_id,
            user_id = entry.actor_id,
            category = %entry.category,
            error = %error,
            event = "warn_undelivered",
            "Warning could not be delivered"
        );
    } else {
        error!(
            target: PUNISHMENT_TARGET,
            id = %entry.id,
            guild_id = entry.community_id,
            user_id = entry.actor_id,
            category = %entry.category,
            punishment = %entry.punishment,
            error = %error,
            event = "punish_failed",
            "Punishment failed"
        );
    }
}

/// Log an event that never reached the counter
pub fn log_event_dropped(raw: &RawEvent, reason: DropReason) {
    match reason {
        DropReason::StoreUnavailable => warn!(
            target: EVENT_TARGET,
            guild_id = raw.community_id,
            user_id = ?raw.actor_id,
            kind = ?raw.kind,
            "Configuration unavailable, event dropped"
        ),
        reason if reason.is_immunity() => trace!(
            target: EVENT_TARGET,
            guild_id = raw.community_id,
            user_id = ?raw.actor_id,
            reason = ?reason,
            "Immune actor"
        ),
        reason => debug!(
            target: EVENT_TARGET,
            guild_id = raw.community_id,
            user_id = ?raw.actor_id,
            kind = ?raw.kind,
            reason = ?reason,
            "Event dropped"
        ),
    }
}

pub fn log_console(message: String) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}
