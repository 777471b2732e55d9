//! Deduplicated presence membership for a single channel.
//!
//! The hub keeps one [`PresenceSet`] per conversation channel and clients can
//! mirror it by feeding every received `presence` event into [`PresenceSet::apply`].
//! Members remember when they were last seen so that clients which vanish
//! without a `leave` can be evicted once they go quiet for longer than the TTL.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::events::{PresenceAction, PresenceEvent};

#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    last_seen: HashMap<Uuid, DateTime<Utc>>,
}

impl PresenceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the client was not already a member.
    pub fn enter(&mut self, client_id: Uuid, at: DateTime<Utc>) -> bool {
        self.last_seen.insert(client_id, at).is_none()
    }

    /// Refreshes a member. A heartbeat from an unknown client counts as an enter.
    pub fn heartbeat(&mut self, client_id: Uuid, at: DateTime<Utc>) -> bool {
        self.enter(client_id, at)
    }

    /// Returns `true` when the client was a member.
    pub fn leave(&mut self, client_id: Uuid) -> bool {
        self.last_seen.remove(&client_id).is_some()
    }

    /// Applies a relayed presence event and reports whether membership changed.
    pub fn apply(&mut self, event: &PresenceEvent) -> bool {
        match event.action {
            PresenceAction::Enter => self.enter(event.client_id, event.timestamp.0),
            PresenceAction::Heartbeat => self.heartbeat(event.client_id, event.timestamp.0),
            PresenceAction::Leave => self.leave(event.client_id),
        }
    }

    #[must_use]
    pub fn contains(&self, client_id: Uuid) -> bool {
        self.last_seen.contains_key(&client_id)
    }

    /// Current members in a stable order.
    #[must_use]
    pub fn members(&self) -> Vec<Uuid> {
        let mut members: Vec<Uuid> = self.last_seen.keys().copied().collect();
        members.sort_unstable();
        members
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Drops members not seen within `ttl` of `now` and returns them.
    pub fn evict_idle(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<Uuid> {
        let mut evicted: Vec<Uuid> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.signed_duration_since(**seen) > ttl)
            .map(|(id, _)| *id)
            .collect();
        evicted.sort_unstable();

        for id in &evicted {
            self.last_seen.remove(id);
        }
        evicted
    }
}
