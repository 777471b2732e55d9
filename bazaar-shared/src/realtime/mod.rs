pub mod channel;
pub mod events;
pub mod presence;

pub use channel::{
    Capability, CapabilityMap, ChannelName, ChannelParseError, ChannelTokenResponse,
};
pub use events::{
    ClientPublishRequest, PresenceAction, PresenceEvent, PresenceMembersResponse, PresenceRequest,
    ReadReceiptEvent, UnreadUpdateEvent,
};
pub use presence::PresenceSet;
