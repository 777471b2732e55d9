use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use shared::models::{
    Conversation, ConversationSummary, Message, MessageView, NewNotification, Notification, Order,
    OrderStatus, ParticipantPair, PaymentStatus, Timestamp, User, UserProfile,
    order::{
        CALLBACK_STATUS_KEY, EXECUTED_VIA_KEY, FAILED_AT_KEY, FAILURE_REASON_KEY, PAID_AT_KEY,
        PAYMENT_CREATED_AT_KEY, PAYMENT_ID_KEY, TRX_ID_KEY,
    },
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ChatStore, NotificationStore, OrderStore, PaymentConfirmation, PaymentFailure,
    PaymentTransition, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    conversations: HashMap<Uuid, Conversation>,
    pairs: HashMap<ParticipantPair, Uuid>,
    /// Insertion order.
    messages: Vec<Message>,
    notifications: Vec<Notification>,
    orders: HashMap<Uuid, Order>,
    stock: HashMap<Uuid, i64>,
    carts: HashMap<Uuid, HashMap<Uuid, i32>>,
}

impl MemoryState {
    fn profile(&self, user_id: Uuid) -> UserProfile {
        self.users
            .get(&user_id)
            .map_or_else(|| UserProfile::unknown(user_id), User::profile)
    }

    fn is_unread(message: &Message, conversation: &Conversation, viewer: Uuid) -> bool {
        message.conversation_id == conversation.id
            && conversation.has_participant(viewer)
            && message.is_unread_for(viewer)
    }

    fn summary(&self, conversation: &Conversation, viewer: Uuid) -> ConversationSummary {
        let last_message = self
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation.id)
            .fold(None::<&Message>, |latest, message| match latest {
                Some(current) if current.created_at > message.created_at => Some(current),
                _ => Some(message),
            })
            .map(Message::preview);

        let unread_count = self
            .messages
            .iter()
            .filter(|message| Self::is_unread(message, conversation, viewer))
            .count();

        ConversationSummary {
            conversation: conversation.clone(),
            user1: self.profile(conversation.user1_id),
            user2: self.profile(conversation.user2_id),
            last_message,
            unread_count: i64::try_from(unread_count).unwrap_or(i64::MAX),
        }
    }
}

/// Process-local store used for `memory://` deployments and tests.
///
/// Everything lives behind a single lock, which gives every operation the same
/// atomicity the relational store gets from transactions and constraints.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    pub async fn insert_order(&self, order: Order) {
        self.state.write().await.orders.insert(order.id, order);
    }

    pub async fn set_stock(&self, product_id: Uuid, stock: i64) {
        self.state.write().await.stock.insert(product_id, stock);
    }

    pub async fn stock(&self, product_id: Uuid) -> Option<i64> {
        self.state.read().await.stock.get(&product_id).copied()
    }

    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        *self
            .state
            .write()
            .await
            .carts
            .entry(user_id)
            .or_default()
            .entry(product_id)
            .or_default() += quantity;
    }

    pub async fn cart_len(&self, user_id: Uuid) -> usize {
        self.state
            .read()
            .await
            .carts
            .get(&user_id)
            .map_or(0, HashMap::len)
    }
}

fn merge_metadata(metadata: &mut Value, entries: Value) {
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    if let (Value::Object(target), Value::Object(source)) = (metadata, entries) {
        target.extend(source);
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn find_user(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn get_or_create_conversation(
        &self,
        pair: ParticipantPair,
    ) -> StoreResult<(Conversation, bool)> {
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .pairs
            .get(&pair)
            .and_then(|id| state.conversations.get(id))
        {
            return Ok((existing.clone(), false));
        }

        let now = Timestamp::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            user1_id: pair.low(),
            user2_id: pair.high(),
            last_message_at: now,
            created_at: now,
        };
        state.pairs.insert(pair, conversation.id);
        state
            .conversations
            .insert(conversation.id, conversation.clone());

        Ok((conversation, true))
    }

    async fn find_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned())
    }

    async fn list_conversations(&self, user_id: Uuid) -> StoreResult<Vec<ConversationSummary>> {
        let state = self.state.read().await;
        let mut summaries: Vec<ConversationSummary> = state
            .conversations
            .values()
            .filter(|conversation| conversation.has_participant(user_id))
            .map(|conversation| state.summary(conversation, user_id))
            .collect();

        summaries.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
        });
        Ok(summaries)
    }

    async fn conversation_summary(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
    ) -> StoreResult<Option<ConversationSummary>> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .get(&conversation_id)
            .map(|conversation| state.summary(conversation, viewer_id)))
    }

    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<MessageView>> {
        let state = self.state.read().await;
        let mut views: Vec<MessageView> = state
            .messages
            .iter()
            .rev()
            .filter(|message| message.conversation_id == conversation_id)
            .map(|message| MessageView {
                message: message.clone(),
                sender: state.profile(message.sender_id),
            })
            .collect();

        views.sort_by(|a, b| b.message.created_at.cmp(&a.message.created_at));
        Ok(views)
    }

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
    ) -> StoreResult<Message> {
        let mut state = self.state.write().await;
        let now = Timestamp::now();

        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        conversation.last_message_at = now;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content,
            created_at: now,
            read_by: Vec::new(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn mark_read(
        &self,
        reader_id: Uuid,
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    ) -> StoreResult<Vec<Uuid>> {
        let mut state = self.state.write().await;
        let mut changed = Vec::new();

        for message in state.messages.iter_mut().filter(|message| {
            message.conversation_id == conversation_id && message_ids.contains(&message.id)
        }) {
            if message.is_unread_for(reader_id) {
                message.read_by.push(reader_id);
                changed.push(message.id);
            }
        }

        Ok(changed)
    }

    async fn unread_count(&self, user_id: Uuid) -> StoreResult<i64> {
        let state = self.state.read().await;
        let count = state
            .messages
            .iter()
            .filter(|message| {
                state
                    .conversations
                    .get(&message.conversation_id)
                    .is_some_and(|conversation| MemoryState::is_unread(message, conversation, user_id))
            })
            .count();

        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create_notification(&self, notification: NewNotification) -> StoreResult<Notification> {
        let created = Notification {
            id: Uuid::new_v4(),
            recipient_id: notification.recipient_id,
            kind: notification.kind,
            title: notification.title,
            body: notification.body,
            payload: notification.payload,
            is_read: false,
            created_at: Timestamp::now(),
        };
        self.state.write().await.notifications.push(created.clone());
        Ok(created)
    }

    async fn list_notifications(&self, recipient_id: Uuid) -> StoreResult<Vec<Notification>> {
        let state = self.state.read().await;
        let mut notifications: Vec<Notification> = state
            .notifications
            .iter()
            .rev()
            .filter(|notification| notification.recipient_id == recipient_id)
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }

    async fn mark_notification_read(&self, recipient_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .notifications
            .iter_mut()
            .find(|notification| notification.id == id && notification.recipient_id == recipient_id)
            .map(|notification| notification.is_read = true)
            .is_some())
    }

    async fn mark_all_notifications_read(&self, recipient_id: Uuid) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for notification in state
            .notifications
            .iter_mut()
            .filter(|notification| notification.recipient_id == recipient_id && !notification.is_read)
        {
            notification.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_notification(&self, recipient_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let before = state.notifications.len();
        state
            .notifications
            .retain(|notification| !(notification.id == id && notification.recipient_id == recipient_id));
        Ok(state.notifications.len() < before)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn find_order_by_payment_id(&self, payment_id: String) -> StoreResult<Option<Order>> {
        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .find(|order| order.provider_payment_id() == Some(payment_id.as_str()))
            .cloned())
    }

    async fn record_payment_created(
        &self,
        order_id: Uuid,
        payment_id: String,
        created_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NotFound("order"))?;

        merge_metadata(
            &mut order.metadata,
            json!({
                PAYMENT_ID_KEY: payment_id,
                PAYMENT_CREATED_AT_KEY: rfc3339(created_at),
            }),
        );
        Ok(())
    }

    async fn mark_payment_failed(
        &self,
        order_id: Uuid,
        failure: PaymentFailure,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NotFound("order"))?;

        if order.payment_status == PaymentStatus::Paid {
            return Ok(false);
        }

        order.payment_status = PaymentStatus::Failed;
        merge_metadata(
            &mut order.metadata,
            json!({
                FAILURE_REASON_KEY: failure.reason,
                CALLBACK_STATUS_KEY: failure.callback_status,
                FAILED_AT_KEY: rfc3339(failure.failed_at),
            }),
        );
        Ok(true)
    }

    async fn mark_payment_succeeded(
        &self,
        order_id: Uuid,
        confirmation: PaymentConfirmation,
    ) -> StoreResult<PaymentTransition> {
        let mut state = self.state.write().await;
        let mut order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(StoreError::NotFound("order"))?;

        if order.payment_status == PaymentStatus::Paid {
            return Ok(PaymentTransition::AlreadyPaid(order));
        }
        if !order.payment_status.can_transition_to_paid() {
            return Err(StoreError::InvalidState(format!(
                "order {order_id} is {}",
                order.payment_status.as_str()
            )));
        }

        order.payment_status = PaymentStatus::Paid;
        order.status = OrderStatus::Processing;
        merge_metadata(
            &mut order.metadata,
            json!({
                TRX_ID_KEY: confirmation.trx_id,
                PAID_AT_KEY: rfc3339(confirmation.paid_at),
                EXECUTED_VIA_KEY: confirmation.executed_via,
            }),
        );

        state.carts.remove(&order.user_id);
        for item in &order.items {
            if let Some(stock) = state.stock.get_mut(&item.product_id) {
                *stock -= i64::from(item.quantity);
            }
        }
        state.orders.insert(order_id, order.clone());

        Ok(PaymentTransition::Applied(order))
    }
}
