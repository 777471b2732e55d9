use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{MessagePreview, Timestamp, UserProfile};

/// Unordered pair of users stored with the smaller id first.
///
/// Every conversation row is keyed by its canonical pair, which is what lets
/// the store enforce one conversation per pair with a plain unique index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    low: Uuid,
    high: Uuid,
}

impl ParticipantPair {
    /// Returns `None` when both ids are the same user.
    #[must_use]
    pub fn new(a: Uuid, b: Uuid) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    #[must_use]
    pub const fn low(&self) -> Uuid {
        self.low
    }

    #[must_use]
    pub const fn high(&self) -> Uuid {
        self.high
    }
}

/// A durable 1:1 conversation between two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    /// Drives inbox ordering.
    pub last_message_at: Timestamp,
    pub created_at: Timestamp,
}

impl Conversation {
    #[must_use]
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The participant that is not `user_id`, if `user_id` takes part at all.
    #[must_use]
    pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
        if self.user1_id == user_id {
            Some(self.user2_id)
        } else if self.user2_id == user_id {
            Some(self.user1_id)
        } else {
            None
        }
    }

    #[must_use]
    pub fn participants(&self) -> [Uuid; 2] {
        [self.user1_id, self.user2_id]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub recipient_id: Uuid,
}

/// Inbox row: the conversation, both profiles and the latest message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub user1: UserProfile,
    pub user2: UserProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    /// Unread messages in this conversation for the user the summary was built for.
    #[serde(default)]
    pub unread_count: i64,
}
