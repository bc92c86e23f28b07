//! Immunity filter
//!
//! An ordered list of pure predicates run against the cached community snapshot.
//! The first predicate that objects decides why the event is dropped.

use crate::protection::{ClassifiedEvent, CommunitySnapshot, DropReason, ProtectionModule};

/// A single screening rule; `Some` drops the event
pub type Predicate = fn(&ClassifiedEvent, &CommunitySnapshot) -> Option<DropReason>;

/// Screening rules in evaluation order
pub const PIPELINE: &[Predicate] = &[
    protection_disabled,
    module_disabled,
    actor_is_owner,
    actor_is_admin,
    actor_is_whitelisted,
];

pub fn protection_disabled(_event: &ClassifiedEvent, snapshot: &CommunitySnapshot) -> Option<DropReason> {
    (!snapshot.settings.enabled).then_some(DropReason::ProtectionDisabled)
}

pub fn module_disabled(event: &ClassifiedEvent, snapshot: &CommunitySnapshot) -> Option<DropReason> {
    (!snapshot.is_tracking(event.category)).then_some(DropReason::ModuleDisabled)
}

pub fn actor_is_owner(event: &ClassifiedEvent, snapshot: &CommunitySnapshot) -> Option<DropReason> {
    (event.actor_id == snapshot.settings.owner_id).then_some(DropReason::Owner)
}

pub fn actor_is_admin(event: &ClassifiedEvent, snapshot: &CommunitySnapshot) -> Option<DropReason> {
    snapshot.trust.is_admin(event.actor_id).then_some(DropReason::Admin)
}

pub fn actor_is_whitelisted(event: &ClassifiedEvent, snapshot: &CommunitySnapshot) -> Option<DropReason> {
    snapshot
        .trust
        .is_whitelisted(event.actor_id)
        .then_some(DropReason::Whitelisted)
}

/// Run the screening pipeline, returning the module that will count the event
///
/// # Errors
///
/// Returns the `DropReason` of the first predicate that rejects the event.
pub fn screen<'a>(
    event: &ClassifiedEvent,
    snapshot: &'a CommunitySnapshot,
) -> Result<&'a ProtectionModule, DropReason> {
    if let Some(reason) = PIPELINE.iter().find_map(|predicate| predicate(event, snapshot)) {
        return Err(reason);
    }

    snapshot
        .module(event.category)
        .ok_or(DropReason::ModuleDisabled)
}
