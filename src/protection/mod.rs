//! Anti-nuke protection engine
//!
//! Watches administrative events, attributes them to an actor and punishes
//! actors who perform too many sensitive actions within one window.

mod cache;
mod category;
mod classifier;
mod counter;
mod dispatcher;
mod error;
pub mod immunity;
mod platform;
mod service;
mod store;

pub use cache::{CommunitySnapshot, ConfigCache};
pub use category::{Category, ProtectionModule, Punishment};
pub use classifier::{
    ClassifiedEvent, DANGEROUS_PERMISSIONS, DropReason, RawEvent, RawEventKind, category_for,
    classify,
};
pub use counter::{ActionRecord, CounterOutcome, RateWindowCounter, WINDOW_SECS};
pub use dispatcher::{PunishmentDispatcher, PunishmentRequest};
pub use error::{ProtectionError, ProtectionResult};
pub use immunity::screen;
pub use platform::{ModerationPlatform, RoleGrant, SerenityPlatform};
pub use service::{CacheRefreshRequest, ProtectionService};
pub use store::{
    CommunitySettings, ConfigStore, MAX_LOG_ENTRIES, PunishmentLogEntry, TrustList,
    YamlConfigStore,
};

#[cfg(test)]
pub use platform::MockModerationPlatform;
#[cfg(test)]
pub use store::MockConfigStore;
