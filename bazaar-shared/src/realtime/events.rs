//! Event names and payloads published on realtime channels.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::Timestamp;

/// Full message with sender profile, on the conversation channel.
pub const MESSAGE: &str = "message";
/// Read acknowledgement, on the conversation channel.
pub const READ_RECEIPT: &str = "read_receipt";
/// Updated conversation summary, on each participant's inbox channel.
pub const NEW_MESSAGE: &str = "new-message";
/// Refetch cue, on a user's unread channel.
pub const UNREAD_UPDATE: &str = "unread_update";
/// Presence membership change, on the conversation channel.
pub const PRESENCE: &str = "presence";
/// New notification, on a user's notification channel.
pub const NOTIFICATION: &str = "notification";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptEvent {
    pub reader_id: Uuid,
    pub message_ids: Vec<Uuid>,
    pub conversation_id: Uuid,
}

/// Carries no count on purpose: receivers refetch `/api/unread-count`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnreadUpdateEvent {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Enter,
    Leave,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub action: PresenceAction,
    pub client_id: Uuid,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRequest {
    pub action: PresenceAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMembersResponse {
    pub members: Vec<Uuid>,
}

/// Client publish on a channel the token grants `publish` for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientPublishRequest {
    pub event: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn presence_event_wire_shape() {
        let event = PresenceEvent {
            action: PresenceAction::Enter,
            client_id: Uuid::nil(),
            timestamp: Timestamp(Utc::now()),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["action"], "enter");
        assert_eq!(json["clientId"], Uuid::nil().to_string());
    }
}
