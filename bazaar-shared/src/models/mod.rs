//! Wire models exchanged over the HTTP API and realtime channels.

pub mod conversation;
pub mod message;
pub mod notification;
pub mod order;
pub mod timestamp;
pub mod user;

pub use conversation::{
    Conversation, ConversationSummary, CreateConversationRequest, ParticipantPair,
};
pub use message::{
    MarkReadRequest, MarkReadResponse, Message, MessagePreview, MessageView, SendMessageRequest,
    UnreadCountResponse,
};
pub use notification::{MarkAllReadResponse, NewNotification, Notification, NotificationKind};
pub use order::{
    CreatePaymentRequest, CreatePaymentResponse, Order, OrderItem, OrderStatus,
    PaymentCallbackQuery, PaymentStatus,
};
pub use timestamp::Timestamp;
pub use user::{User, UserProfile, UserRole};
