#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::{
    models::{
        Conversation, ConversationSummary, CreateConversationRequest, CreatePaymentRequest,
        CreatePaymentResponse, MarkAllReadResponse, MarkReadRequest, MarkReadResponse, Message,
        MessagePreview, MessageView, Notification, NotificationKind, SendMessageRequest,
        Timestamp, UnreadCountResponse, UserProfile, UserRole,
    },
    realtime::{
        Capability, ChannelTokenResponse, ClientPublishRequest, PresenceAction, PresenceEvent,
        PresenceMembersResponse, PresenceRequest, ReadReceiptEvent, UnreadUpdateEvent,
    },
};
use utoipa::OpenApi;

use crate::http::problem::ProblemDetails;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Bazaar API",
        version = "1.0.0",
        description = "Buyer/vendor chat, realtime channels, notifications and bKash payments"
    ),
    paths(
        crate::handlers::conversations::create_conversation,
        crate::handlers::conversations::list_conversations,
        crate::handlers::conversations::list_messages,
        crate::handlers::messages::send_message,
        crate::handlers::messages::mark_read,
        crate::handlers::messages::unread_count,
        crate::handlers::tokens::chat_token,
        crate::handlers::tokens::notification_token,
        crate::handlers::realtime::stream_channel,
        crate::handlers::realtime::publish,
        crate::handlers::realtime::update_presence,
        crate::handlers::realtime::presence_members,
        crate::handlers::notifications::list_notifications,
        crate::handlers::notifications::mark_read,
        crate::handlers::notifications::mark_all_read,
        crate::handlers::notifications::delete_notification,
        crate::handlers::payments::create_payment,
        crate::handlers::payments::payment_callback,
    ),
    components(
        schemas(
            Conversation,
            ConversationSummary,
            CreateConversationRequest,
            Message,
            MessageView,
            MessagePreview,
            SendMessageRequest,
            MarkReadRequest,
            MarkReadResponse,
            UnreadCountResponse,
            UserProfile,
            UserRole,
            Timestamp,
            ChannelTokenResponse,
            Capability,
            ClientPublishRequest,
            PresenceAction,
            PresenceEvent,
            PresenceRequest,
            PresenceMembersResponse,
            ReadReceiptEvent,
            UnreadUpdateEvent,
            Notification,
            NotificationKind,
            MarkAllReadResponse,
            CreatePaymentRequest,
            CreatePaymentResponse,
            ProblemDetails,
        )
    ),
    tags(
        (name = "Conversations", description = "Buyer/vendor conversations"),
        (name = "Messages", description = "Sending and reading messages"),
        (name = "Realtime", description = "Channel tokens, event streams and presence"),
        (name = "Notifications", description = "Per-user notifications"),
        (name = "Payments", description = "bKash checkout and reconciliation")
    )
)]
pub struct ApiDoc;
