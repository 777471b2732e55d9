use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// A realtime channel.
///
/// Conversation channels are shared by exactly two participants. The personal
/// channels are subscribe-only and belong to a single user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelName {
    Conversation(Uuid),
    Inbox(Uuid),
    Unread(Uuid),
    Notifications(Uuid),
}

impl ChannelName {
    /// Owner of a personal channel; `None` for conversation channels.
    #[must_use]
    pub const fn owner(&self) -> Option<Uuid> {
        match self {
            Self::Conversation(_) => None,
            Self::Inbox(user) | Self::Unread(user) | Self::Notifications(user) => Some(*user),
        }
    }

    /// Every personal channel that belongs to `user_id`.
    #[must_use]
    pub fn personal(user_id: Uuid) -> [Self; 3] {
        [
            Self::Inbox(user_id),
            Self::Unread(user_id),
            Self::Notifications(user_id),
        ]
    }

    #[must_use]
    pub const fn is_conversation(&self) -> bool {
        matches!(self, Self::Conversation(_))
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Inbox(id) => write!(f, "user:{id}:inbox"),
            Self::Unread(id) => write!(f, "user:{id}:unread"),
            Self::Notifications(id) => write!(f, "user:{id}:notifications"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid channel name: {0}")]
pub struct ChannelParseError(pub String);

impl FromStr for ChannelName {
    type Err = ChannelParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ChannelParseError(value.to_string());
        let parts: Vec<&str> = value.split(':').collect();

        match parts.as_slice() {
            ["conversation", id] => Uuid::parse_str(id)
                .map(Self::Conversation)
                .map_err(|_| invalid()),
            ["user", id, kind] => {
                let user = Uuid::parse_str(id).map_err(|_| invalid())?;
                match *kind {
                    "inbox" => Ok(Self::Inbox(user)),
                    "unread" => Ok(Self::Unread(user)),
                    "notifications" => Ok(Self::Notifications(user)),
                    _ => Err(invalid()),
                }
            }
            _ => Err(invalid()),
        }
    }
}

impl Serialize for ChannelName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Operation a channel token may perform on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Publish,
    Subscribe,
    Presence,
}

impl Capability {
    /// Full access for conversation participants.
    pub const CHAT: [Self; 3] = [Self::Publish, Self::Subscribe, Self::Presence];
    /// Read-only access for personal channels.
    pub const LISTEN: [Self; 1] = [Self::Subscribe];
}

/// Channel name to granted operations, as embedded in channel tokens.
pub type CapabilityMap = BTreeMap<String, Vec<Capability>>;

/// Response of the token endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTokenResponse {
    pub token: String,
    pub capabilities: CapabilityMap,
    /// Seconds until the token expires.
    pub ttl: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip_through_strings() {
        let id = Uuid::new_v4();
        for channel in [
            ChannelName::Conversation(id),
            ChannelName::Inbox(id),
            ChannelName::Unread(id),
            ChannelName::Notifications(id),
        ] {
            let text = channel.to_string();
            assert_eq!(text.parse::<ChannelName>().unwrap(), channel);
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in [
            "",
            "conversation",
            "conversation:not-a-uuid",
            "user:00000000-0000-0000-0000-000000000000",
            "user:00000000-0000-0000-0000-000000000000:outbox",
            "room:00000000-0000-0000-0000-000000000000",
        ] {
            assert!(bad.parse::<ChannelName>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn personal_channels_have_owner() {
        let id = Uuid::new_v4();
        assert_eq!(ChannelName::Conversation(id).owner(), None);
        for channel in ChannelName::personal(id) {
            assert_eq!(channel.owner(), Some(id));
        }
    }

    #[test]
    fn serializes_as_string() {
        let id = Uuid::nil();
        let json = serde_json::to_string(&ChannelName::Unread(id)).unwrap();
        assert_eq!(json, format!("\"user:{id}:unread\""));
        let back: ChannelName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ChannelName::Unread(id));
    }
}
