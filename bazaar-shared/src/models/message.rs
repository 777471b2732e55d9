use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{Timestamp, UserProfile};

/// Characters kept in inbox previews.
pub const PREVIEW_CHARS: usize = 120;

/// A chat message. Immutable apart from `read_by`, which only ever grows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: Timestamp,
    /// Users (other than the sender) who acknowledged this message.
    #[serde(default)]
    pub read_by: Vec<Uuid>,
}

impl Message {
    /// Whether `user_id` still has to read this message.
    #[must_use]
    pub fn is_unread_for(&self, user_id: Uuid) -> bool {
        self.sender_id != user_id && !self.read_by.contains(&user_id)
    }

    #[must_use]
    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            id: self.id,
            sender_id: self.sender_id,
            content: truncate_chars(&self.content, PREVIEW_CHARS),
            created_at: self.created_at,
        }
    }
}

/// A message joined with its sender's public profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub sender: UserProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    pub success: bool,
    /// Messages whose read state actually changed.
    pub marked: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountResponse {
    pub unread_count: i64,
}

fn truncate_chars(content: &str, limit: usize) -> String {
    match content.char_indices().nth(limit) {
        Some((index, _)) => format!("{}…", &content[..index]),
        None => content.to_string(),
    }
}
