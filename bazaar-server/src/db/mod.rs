//! Persistence seams.
//!
//! Services only ever talk to the traits below. [`postgres::PgStore`] backs
//! production deployments; [`memory::MemoryStore`] backs `memory://` mode and
//! the test suite.

pub mod bootstrap;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{
    Conversation, ConversationSummary, Message, MessageView, NewNotification, Notification, Order,
    ParticipantPair, User,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of the guarded `PAID` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentTransition {
    /// First confirmation: order updated, cart cleared, stock decremented.
    Applied(Order),
    /// The order was already paid; nothing changed.
    AlreadyPaid(Order),
}

/// Confirmation details recorded on the order when a payment succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub trx_id: String,
    /// `execute` or `query`, depending on which call confirmed the payment.
    pub executed_via: &'static str,
    pub paid_at: DateTime<Utc>,
}

/// Failure details recorded on the order when a payment is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentFailure {
    pub reason: String,
    pub callback_status: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> StoreResult<Option<User>>;

    /// Returns the pair's conversation and whether this call created it.
    async fn get_or_create_conversation(
        &self,
        pair: ParticipantPair,
    ) -> StoreResult<(Conversation, bool)>;

    async fn find_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>>;

    /// Inbox for `user_id`, most recently active first.
    async fn list_conversations(&self, user_id: Uuid) -> StoreResult<Vec<ConversationSummary>>;

    /// Summary of one conversation as seen by `viewer_id`.
    async fn conversation_summary(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
    ) -> StoreResult<Option<ConversationSummary>>;

    /// Messages with sender profiles, newest first.
    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<MessageView>>;

    /// Inserts the message and bumps `last_message_at` atomically.
    async fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
    ) -> StoreResult<Message>;

    /// Adds `reader_id` to `read_by` of the eligible messages and returns the
    /// ids that actually changed.
    async fn mark_read(
        &self,
        reader_id: Uuid,
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    ) -> StoreResult<Vec<Uuid>>;

    async fn unread_count(&self, user_id: Uuid) -> StoreResult<i64>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create_notification(&self, notification: NewNotification) -> StoreResult<Notification>;

    /// Newest first.
    async fn list_notifications(&self, recipient_id: Uuid) -> StoreResult<Vec<Notification>>;

    /// `false` when no notification with that id belongs to the recipient.
    async fn mark_notification_read(&self, recipient_id: Uuid, id: Uuid) -> StoreResult<bool>;

    async fn mark_all_notifications_read(&self, recipient_id: Uuid) -> StoreResult<u64>;

    /// `false` when no notification with that id belongs to the recipient.
    async fn delete_notification(&self, recipient_id: Uuid, id: Uuid) -> StoreResult<bool>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<Order>>;

    async fn find_order_by_payment_id(&self, payment_id: String) -> StoreResult<Option<Order>>;

    /// Stores the provider payment id used to correlate the callback.
    async fn record_payment_created(
        &self,
        order_id: Uuid,
        payment_id: String,
        created_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Marks an unpaid order as `FAILED`. Returns `false` if it was already paid.
    async fn mark_payment_failed(&self, order_id: Uuid, failure: PaymentFailure)
    -> StoreResult<bool>;

    /// Applies the `PAID` transition exactly once under a row lock.
    async fn mark_payment_succeeded(
        &self,
        order_id: Uuid,
        confirmation: PaymentConfirmation,
    ) -> StoreResult<PaymentTransition>;
}
