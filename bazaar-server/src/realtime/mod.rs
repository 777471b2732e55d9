//! Pub/sub transport: named channels, presence and event fan-out.

pub mod hub;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use shared::realtime::ChannelName;
use thiserror::Error;
use uuid::Uuid;

pub use hub::{ChannelHub, HubEvent, SharedHub, Subscription};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode {event} payload: {source}")]
    Encode {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("transport is shut down")]
    Closed,
    #[error("presence is only tracked on conversation channels, not {0}")]
    NoPresence(ChannelName),
}

/// Delivery side channel. Nothing published here is durable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        channel: ChannelName,
        event: String,
        payload: Value,
    ) -> Result<(), TransportError>;

    async fn enter_presence(&self, channel: ChannelName, client_id: Uuid)
    -> Result<(), TransportError>;

    async fn heartbeat_presence(
        &self,
        channel: ChannelName,
        client_id: Uuid,
    ) -> Result<(), TransportError>;

    async fn leave_presence(&self, channel: ChannelName, client_id: Uuid)
    -> Result<(), TransportError>;

    async fn presence_members(&self, channel: ChannelName) -> Result<Vec<Uuid>, TransportError>;
}

/// Serializes `payload` and publishes it.
pub async fn publish_event<T: Serialize + Sync>(
    transport: &dyn Transport,
    channel: ChannelName,
    event: &'static str,
    payload: &T,
) -> Result<(), TransportError> {
    let value = serde_json::to_value(payload)
        .map_err(|source| TransportError::Encode { event, source })?;
    transport.publish(channel, event.to_string(), value).await
}

/// Best-effort variant of [`publish_event`]: failures are logged and counted,
/// never returned.
pub async fn publish_best_effort<T: Serialize + Sync>(
    transport: &dyn Transport,
    channel: ChannelName,
    event: &'static str,
    payload: &T,
) {
    if let Err(err) = publish_event(transport, channel, event, payload).await {
        metrics::counter!("bazaar_realtime_publish_failures_total", "event" => event)
            .increment(1);
        tracing::warn!(%channel, event, error = %err, "realtime publish failed");
    }
}
