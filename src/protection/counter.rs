//! Rate window counter
//!
//! Keeps a fixed decaying counter per `(community, actor, category)`. A record
//! that sits idle for longer than the window is reset rather than extended, so
//! bursts separated by more than the window never add up.
//!
//! State is partitioned by community: each community owns one mutex, and the
//! mutex only ever guards in-memory bookkeeping. It is never held across an
//! `.await`.

use crate::protection::{Category, ClassifiedEvent};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Length of the decay window in seconds
pub const WINDOW_SECS: i64 = 60;

/// Sensitive actions an actor performed in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRecord {
    /// Always at least one while the record exists
    pub count: u32,
    pub last_action_at: DateTime<Utc>,
}

impl ActionRecord {
    fn first(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            last_action_at: now,
        }
    }
}

/// Result of counting one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    /// Below the threshold, the record was kept
    Counted { count: u32 },
    /// The threshold was reached and the record was cleared
    ThresholdReached { count: u32 },
}

impl CounterOutcome {
    #[must_use]
    pub fn fired(self) -> bool {
        matches!(self, Self::ThresholdReached { .. })
    }
}

type Partition = HashMap<(u64, Category), ActionRecord>;

/// Per-community action counters
#[derive(Clone)]
pub struct RateWindowCounter {
    partitions: Arc<DashMap<u64, Arc<Mutex<Partition>>>>,
    window: Duration,
}

impl Default for RateWindowCounter {
    fn default() -> Self {
        Self::new(Duration::seconds(WINDOW_SECS))
    }
}

impl RateWindowCounter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            partitions: Arc::new(DashMap::new()),
            window,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    fn partition(&self, community_id: u64) -> Arc<Mutex<Partition>> {
        Arc::clone(
            self.partitions
                .entry(community_id)
                .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
                .value(),
        )
    }

    fn existing_partition(&self, community_id: u64) -> Option<Arc<Mutex<Partition>>> {
        self.partitions
            .get(&community_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Count one qualifying event against `threshold`
    ///
    /// The record is removed before the partition lock is released when the
    /// threshold is reached, so a concurrent event for the same actor starts a
    /// fresh window instead of firing a second time.
    pub fn record(&self, event: &ClassifiedEvent, threshold: u32, now: DateTime<Utc>) -> CounterOutcome {
        let partition = self.partition(event.community_id);
        let mut records = lock(&partition);
        let key = (event.actor_id, event.category);

        let count = match records.get_mut(&key) {
            Some(record) if now - record.last_action_at > self.window => {
                *record = ActionRecord::first(now);
                record.count
            }
            Some(record) => {
                record.count = record.count.saturating_add(1);
                record.last_action_at = now;
                record.count
            }
            None => {
                records.insert(key, ActionRecord::first(now));
                1
            }
        };

        if count >= threshold {
            records.remove(&key);
            CounterOutcome::ThresholdReached { count }
        } else {
            CounterOutcome::Counted { count }
        }
    }

    /// Current record for an actor, if any
    #[must_use]
    pub fn get(&self, community_id: u64, actor_id: u64, category: Category) -> Option<ActionRecord> {
        let partition = self.existing_partition(community_id)?;
        let records = lock(&partition);
        records.get(&(actor_id, category)).copied()
    }

    /// Drop one record, returning whether it existed
    pub fn clear_record(&self, community_id: u64, actor_id: u64, category: Category) -> bool {
        let Some(partition) = self.existing_partition(community_id) else {
            return false;
        };
        let removed = lock(&partition).remove(&(actor_id, category)).is_some();
        removed
    }

    /// Drop every record of a category, returning how many were removed
    pub fn clear_category(&self, community_id: u64, category: Category) -> usize {
        let Some(partition) = self.existing_partition(community_id) else {
            return 0;
        };
        let mut records = lock(&partition);
        let before = records.len();
        records.retain(|(_, record_category), _| *record_category != category);
        before - records.len()
    }

    /// Drop every record held by an actor
    pub fn clear_actor(&self, community_id: u64, actor_id: u64) -> usize {
        let Some(partition) = self.existing_partition(community_id) else {
            return 0;
        };
        let mut records = lock(&partition);
        let before = records.len();
        records.retain(|(record_actor, _), _| *record_actor != actor_id);
        before - records.len()
    }

    /// Drop the whole partition of a community
    pub fn clear_community(&self, community_id: u64) -> usize {
        let Some((_, partition)) = self.partitions.remove(&community_id) else {
            return 0;
        };
        let removed = lock(&partition).len();
        removed
    }

    /// Drop records whose window has passed, returning how many were removed
    ///
    /// Partitions are kept even when they empty out, since a concurrent
    /// `record` may already hold one.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let partitions: Vec<_> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        partitions
            .iter()
            .map(|partition| {
                let mut records = lock(partition);
                let before = records.len();
                records.retain(|_, record| now - record.last_action_at <= self.window);
                before - records.len()
            })
            .sum()
    }

    /// Number of live records in a community
    #[must_use]
    pub fn len(&self, community_id: u64) -> usize {
        let Some(partition) = self.existing_partition(community_id) else {
            return 0;
        };
        let len = lock(&partition).len();
        len
    }

    #[must_use]
    pub fn is_empty(&self, community_id: u64) -> bool {
        self.len(community_id) == 0
    }
}

// A panic while holding the lock cannot leave a record half-written, so the
// data is still usable.
fn lock(partition: &Mutex<Partition>) -> MutexGuard<'_, Partition> {
    partition.lock().unwrap_or_else(PoisonError::into_inner)
}
