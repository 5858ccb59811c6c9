//! Bounded per-channel event history.
//!
//! Each channel keeps a `VecDeque` ordered by append time. Appends evict from
//! the head: first everything older than the retention window, then the oldest
//! entries until the count cap holds. Queries take the channel's current
//! policy and re-apply both bounds, so an event that aged out since the last
//! append, or falls outside a policy tightened since then, is never returned.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::SharedClock;
use crate::event::Event;

/// Age and count bounds for one channel's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum event age.
    pub window: Duration,
    /// Maximum number of events kept.
    pub max_events: usize,
}

/// Parameters for [`RetentionStore::query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Only return events strictly newer than this instant.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of events returned (the most recent ones win).
    pub limit: usize,
}

/// Per-channel ring buffers of recent events.
pub struct RetentionStore {
    channels: DashMap<String, VecDeque<Arc<Event>>>,
    clock: SharedClock,
}

impl RetentionStore {
    /// Create an empty store.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            channels: DashMap::new(),
            clock,
        }
    }

    /// Append an event to its channel's history and evict.
    ///
    /// Returns the number of events evicted by this call.
    pub fn append(&self, policy: RetentionPolicy, event: Arc<Event>) -> usize {
        let now = self.clock.now();
        let mut entry = self
            .channels
            .entry(event.channel.clone())
            .or_insert_with(|| VecDeque::with_capacity(policy.max_events.min(1024)));
        let events = entry.value_mut();
        events.push_back(event);

        let cutoff = cutoff(now, policy.window);
        let mut evicted = 0;
        while events.front().is_some_and(|e| e.timestamp < cutoff) {
            let _ = events.pop_front();
            evicted += 1;
        }
        while events.len() > policy.max_events {
            let _ = events.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Events in chronological order, newer than `query.since` and inside
    /// `policy`, capped at the most recent `query.limit`.
    ///
    /// `policy` is the channel's policy at the time of the call; it may be
    /// tighter than the one the buffered events were appended under.
    pub fn query(
        &self,
        channel: &str,
        policy: RetentionPolicy,
        query: &HistoryQuery,
    ) -> Vec<Arc<Event>> {
        let Some(events) = self.channels.get(channel) else {
            return Vec::new();
        };
        let cutoff = cutoff(self.clock.now(), policy.window);
        let retained: Vec<Arc<Event>> = events
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .filter(|e| query.since.is_none_or(|since| e.timestamp > since))
            .cloned()
            .collect();
        let skip = retained
            .len()
            .saturating_sub(query.limit.min(policy.max_events));
        retained.into_iter().skip(skip).collect()
    }

    /// Number of events currently buffered for a channel (including any that
    /// have aged out but not yet been evicted by an append).
    pub fn buffered(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |events| events.len())
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
