use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use shared::{
    models::Timestamp,
    realtime::{ChannelName, PresenceAction, PresenceEvent, PresenceSet, events},
};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Transport, TransportError};

/// Channels without subscribers, members or traffic for this long are dropped.
const IDLE_RETENTION: Duration = Duration::from_secs(600);

pub type SharedHub = Arc<ChannelHub>;

/// One frame on a channel. Sequenced events can be resumed with `Last-Event-ID`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubEvent {
    pub sequence: Option<u64>,
    pub event: String,
    pub data: String,
}

impl HubEvent {
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.sequence.map(|sequence| sequence.to_string())
    }
}

/// A live subscription: events to replay first, then the live feed.
#[derive(Debug)]
pub struct Subscription {
    pub backlog: Vec<HubEvent>,
    pub receiver: broadcast::Receiver<HubEvent>,
}

struct ChannelState {
    sender: broadcast::Sender<HubEvent>,
    history: VecDeque<HubEvent>,
    next_sequence: u64,
    presence: PresenceSet,
    last_activity: Instant,
}

impl ChannelState {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: VecDeque::new(),
            next_sequence: 0,
            presence: PresenceSet::new(),
            last_activity: Instant::now(),
        }
    }

    fn push(&mut self, event: &str, payload: &Value, history_limit: usize) {
        let frame = HubEvent {
            sequence: Some(self.next_sequence),
            event: event.to_string(),
            data: payload.to_string(),
        };
        self.next_sequence += 1;
        self.last_activity = Instant::now();

        self.history.push_back(frame.clone());
        while self.history.len() > history_limit {
            self.history.pop_front();
        }

        // No receivers is fine: the frame is still kept for replay.
        let _ = self.sender.send(frame);
    }

    fn push_presence(&mut self, action: PresenceAction, client_id: Uuid, history_limit: usize) {
        let payload = json!(PresenceEvent {
            action,
            client_id,
            timestamp: Timestamp::now(),
        });
        self.push(events::PRESENCE, &payload, history_limit);
    }

    /// Frames after `last_event_id`, or `None` when the cursor fell out of
    /// the retained window.
    fn backlog_after(&self, last_event_id: &str) -> Option<Vec<HubEvent>> {
        let last: u64 = last_event_id.trim().parse().ok()?;
        if last >= self.next_sequence {
            return None;
        }

        let oldest = self
            .history
            .front()
            .and_then(|frame| frame.sequence)
            .unwrap_or(self.next_sequence);
        if last.saturating_add(1) < oldest {
            return None;
        }

        Some(
            self.history
                .iter()
                .filter(|frame| frame.sequence.is_some_and(|sequence| sequence > last))
                .cloned()
                .collect(),
        )
    }

    fn is_idle(&self) -> bool {
        self.sender.receiver_count() == 0
            && self.presence.is_empty()
            && self.last_activity.elapsed() > IDLE_RETENTION
    }
}

/// In-process channel hub fanning events out to SSE subscribers.
pub struct ChannelHub {
    capacity: usize,
    history_limit: usize,
    presence_ttl: chrono::Duration,
    channels: Mutex<HashMap<ChannelName, ChannelState>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ChannelHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHub")
            .field("capacity", &self.capacity)
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}

impl ChannelHub {
    #[must_use]
    pub fn new(capacity: usize, history_limit: usize, presence_ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            history_limit,
            presence_ttl: chrono::Duration::from_std(presence_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Subscribes to `channel`, replaying what was missed after `last_event_id`.
    ///
    /// Fresh subscriptions start live. A cursor that can no longer be resumed
    /// yields a single `error` frame asking the client to reload.
    pub async fn subscribe(
        &self,
        channel: ChannelName,
        last_event_id: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let mut channels = self.channels.lock().await;
        let state = channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(self.capacity));

        let receiver = state.sender.subscribe();
        let backlog = match last_event_id {
            None => Vec::new(),
            Some(last) => state.backlog_after(last).unwrap_or_else(|| {
                debug!(%channel, cursor = last, "stale event cursor");
                vec![HubEvent {
                    sequence: None,
                    event: "error".to_string(),
                    data: json!({
                        "message": "Event history no longer available; please reload.",
                        "reason": "stale_cursor"
                    })
                    .to_string(),
                }]
            }),
        };

        metrics::gauge!("bazaar_realtime_channels").set(channels.len() as f64);
        Ok(Subscription { backlog, receiver })
    }

    /// Evicts presence members idle past the TTL as of `now`, publishing a
    /// `leave` for each, and drops idle channels. Returns the evicted count.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut channels = self.channels.lock().await;
        let mut evicted_total = 0;

        for (channel, state) in channels.iter_mut() {
            let evicted = state.presence.evict_idle(now, self.presence_ttl);
            for client_id in &evicted {
                debug!(%channel, %client_id, "evicting idle presence member");
                state.push_presence(PresenceAction::Leave, *client_id, self.history_limit);
            }
            evicted_total += evicted.len();
        }

        channels.retain(|_, state| !state.is_idle());
        metrics::gauge!("bazaar_realtime_channels").set(channels.len() as f64);
        if evicted_total > 0 {
            metrics::counter!("bazaar_presence_evictions_total").increment(evicted_total as u64);
        }
        evicted_total
    }

    /// Runs [`ChannelHub::sweep_at`] every `every` until the hub is dropped
    /// or shut down.
    pub fn spawn_presence_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let hub: Weak<Self> = Arc::downgrade(self);
        let cadence = every.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(hub) = hub.upgrade() else { break };
                if hub.closed.load(Ordering::Acquire) {
                    break;
                }
                hub.sweep_at(Utc::now()).await;
            }
        })
    }

    /// Closes every channel so open streams end and graceful shutdown can finish.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut channels = self.channels.lock().await;
        info!(channels = channels.len(), "closing realtime channels");
        channels.clear();
    }
}

#[async_trait]
impl Transport for ChannelHub {
    async fn publish(
        &self,
        channel: ChannelName,
        event: String,
        payload: Value,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(self.capacity))
            .push(&event, &payload, self.history_limit);

        metrics::counter!("bazaar_realtime_events_total", "event" => event).increment(1);
        Ok(())
    }

    async fn enter_presence(
        &self,
        channel: ChannelName,
        client_id: Uuid,
    ) -> Result<(), TransportError> {
        if !channel.is_conversation() {
            return Err(TransportError::NoPresence(channel));
        }
        self.ensure_open()?;
        let mut channels = self.channels.lock().await;
        let state = channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(self.capacity));

        if state.presence.enter(client_id, Utc::now()) {
            state.push_presence(PresenceAction::Enter, client_id, self.history_limit);
        }
        Ok(())
    }

    async fn heartbeat_presence(
        &self,
        channel: ChannelName,
        client_id: Uuid,
    ) -> Result<(), TransportError> {
        if !channel.is_conversation() {
            return Err(TransportError::NoPresence(channel));
        }
        self.ensure_open()?;
        let mut channels = self.channels.lock().await;
        let state = channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(self.capacity));

        // A heartbeat after eviction re-announces the member.
        if state.presence.heartbeat(client_id, Utc::now()) {
            state.push_presence(PresenceAction::Enter, client_id, self.history_limit);
        }
        Ok(())
    }

    async fn leave_presence(
        &self,
        channel: ChannelName,
        client_id: Uuid,
    ) -> Result<(), TransportError> {
        if !channel.is_conversation() {
            return Err(TransportError::NoPresence(channel));
        }
        self.ensure_open()?;
        let mut channels = self.channels.lock().await;
        if let Some(state) = channels.get_mut(&channel) {
            if state.presence.leave(client_id) {
                state.push_presence(PresenceAction::Leave, client_id, self.history_limit);
            }
        }
        Ok(())
    }

    async fn presence_members(&self, channel: ChannelName) -> Result<Vec<Uuid>, TransportError> {
        self.ensure_open()?;
        let channels = self.channels.lock().await;
        Ok(channels
            .get(&channel)
            .map(|state| state.presence.members())
            .unwrap_or_default())
    }
}
