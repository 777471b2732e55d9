use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use shared::models::{
    Conversation, ConversationSummary, Message, MessageView, NewNotification, Notification,
    NotificationKind, Order, OrderItem, OrderStatus, ParticipantPair, PaymentStatus, Timestamp,
    User, UserProfile, UserRole,
    order::{
        CALLBACK_STATUS_KEY, EXECUTED_VIA_KEY, FAILED_AT_KEY, FAILURE_REASON_KEY, PAID_AT_KEY,
        PAYMENT_CREATED_AT_KEY, PAYMENT_ID_KEY, TRX_ID_KEY,
    },
};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::instrument;
use uuid::Uuid;

use super::{
    ChatStore, NotificationStore, OrderStore, PaymentConfirmation, PaymentFailure,
    PaymentTransition, StoreError, StoreResult,
};

/// Must match the `idx_orders_payment_id` expression.
const FIND_ORDER_BY_PAYMENT_ID: &str =
    "SELECT id FROM orders WHERE metadata ->> 'paymentID' = $1 LIMIT 1";

/// Relational store over PostgreSQL.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    name: Option<String>,
    username: Option<String>,
    image: Option<String>,
    role: String,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = UserRole::from_str(&row.role)
            .map_err(|_| StoreError::Corrupt(format!("user {} has role {}", row.id, row.role)))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            username: row.username,
            image: row.image,
            role,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: Uuid,
    user1_id: Uuid,
    user2_id: Uuid,
    last_message_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            user1_id: row.user1_id,
            user2_id: row.user2_id,
            last_message_at: Timestamp(row.last_message_at),
            created_at: Timestamp(row.created_at),
        }
    }
}

#[derive(Debug, FromRow)]
struct UpsertedConversationRow {
    #[sqlx(flatten)]
    conversation: ConversationRow,
    created: bool,
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    #[sqlx(flatten)]
    conversation: ConversationRow,
    user1_name: Option<String>,
    user1_username: Option<String>,
    user1_image: Option<String>,
    user2_name: Option<String>,
    user2_username: Option<String>,
    user2_image: Option<String>,
    last_message_id: Option<Uuid>,
    last_message_sender_id: Option<Uuid>,
    last_message_content: Option<String>,
    last_message_created_at: Option<DateTime<Utc>>,
    unread_count: i64,
}

impl From<SummaryRow> for ConversationSummary {
    fn from(row: SummaryRow) -> Self {
        let conversation = Conversation::from(row.conversation);

        let last_message = match (
            row.last_message_id,
            row.last_message_sender_id,
            row.last_message_content,
            row.last_message_created_at,
        ) {
            (Some(id), Some(sender_id), Some(content), Some(created_at)) => Some(
                Message {
                    id,
                    conversation_id: conversation.id,
                    sender_id,
                    content,
                    created_at: Timestamp(created_at),
                    read_by: Vec::new(),
                }
                .preview(),
            ),
            _ => None,
        };

        Self {
            user1: UserProfile {
                id: conversation.user1_id,
                name: row.user1_name,
                username: row.user1_username,
                image: row.user1_image,
            },
            user2: UserProfile {
                id: conversation.user2_id,
                name: row.user2_name,
                username: row.user2_username,
                image: row.user2_image,
            },
            conversation,
            last_message,
            unread_count: row.unread_count,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
    read_by: Vec<Uuid>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: Timestamp(row.created_at),
            read_by: row.read_by,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageViewRow {
    #[sqlx(flatten)]
    message: MessageRow,
    sender_name: Option<String>,
    sender_username: Option<String>,
    sender_image: Option<String>,
}

impl From<MessageViewRow> for MessageView {
    fn from(row: MessageViewRow) -> Self {
        let message = Message::from(row.message);
        Self {
            sender: UserProfile {
                id: message.sender_id,
                name: row.sender_name,
                username: row.sender_username,
                image: row.sender_image,
            },
            message,
        }
    }
}

#[derive(Debug, FromRow)]
struct NotificationRow {
    id: Uuid,
    recipient_id: Uuid,
    kind: String,
    title: String,
    body: String,
    payload: Value,
    is_read: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let kind = NotificationKind::try_from(row.kind.as_str())
            .map_err(|err| StoreError::Corrupt(format!("notification {}: {err}", row.id)))?;
        Ok(Self {
            id: row.id,
            recipient_id: row.recipient_id,
            kind,
            title: row.title,
            body: row.body,
            payload: row.payload,
            is_read: row.is_read,
            created_at: Timestamp(row.created_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    user_id: Uuid,
    status: String,
    payment_status: String,
    total_amount: i64,
    metadata: Value,
}

#[derive(Debug, FromRow)]
struct OrderItemRow {
    product_id: Uuid,
    quantity: i32,
}

const SUMMARY_SELECT: &str = r"
SELECT c.id, c.user1_id, c.user2_id, c.last_message_at, c.created_at,
       u1.name AS user1_name, u1.username AS user1_username, u1.image AS user1_image,
       u2.name AS user2_name, u2.username AS user2_username, u2.image AS user2_image,
       lm.id AS last_message_id,
       lm.sender_id AS last_message_sender_id,
       lm.content AS last_message_content,
       lm.created_at AS last_message_created_at,
       (SELECT COUNT(*)
          FROM messages m
         WHERE m.conversation_id = c.id
           AND m.sender_id <> $1
           AND NOT ($1 = ANY(m.read_by))) AS unread_count
  FROM conversations c
  LEFT JOIN users u1 ON u1.id = c.user1_id
  LEFT JOIN users u2 ON u2.id = c.user2_id
  LEFT JOIN LATERAL (
        SELECT id, sender_id, content, created_at
          FROM messages
         WHERE conversation_id = c.id
         ORDER BY created_at DESC
         LIMIT 1
  ) lm ON TRUE";

async fn load_order(conn: &mut PgConnection, order_id: Uuid) -> StoreResult<Option<Order>> {
    let row = sqlx::query_as::<_, OrderRow>(
        "SELECT id, order_number, user_id, status, payment_status, total_amount, metadata
           FROM orders WHERE id = $1",
    )
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let items = sqlx::query_as::<_, OrderItemRow>(
        "SELECT product_id, quantity FROM order_items WHERE order_id = $1 ORDER BY product_id",
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await?;

    let status = OrderStatus::try_from(row.status.as_str())
        .map_err(|err| StoreError::Corrupt(format!("order {}: {err}", row.id)))?;
    let payment_status = PaymentStatus::try_from(row.payment_status.as_str())
        .map_err(|err| StoreError::Corrupt(format!("order {}: {err}", row.id)))?;

    Ok(Some(Order {
        id: row.id,
        order_number: row.order_number,
        user_id: row.user_id,
        status,
        payment_status,
        total_amount: row.total_amount,
        metadata: row.metadata,
        items: items
            .into_iter()
            .map(|item| OrderItem {
                product_id: item.product_id,
                quantity: item.quantity,
            })
            .collect(),
    }))
}

#[async_trait]
impl ChatStore for PgStore {
    #[instrument(name = "store.find_user", skip(self), err)]
    async fn find_user(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, name, username, image, role FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .map(User::try_from)
        .transpose()
    }

    #[instrument(name = "store.get_or_create_conversation", skip(self), err)]
    async fn get_or_create_conversation(
        &self,
        pair: ParticipantPair,
    ) -> StoreResult<(Conversation, bool)> {
        // The no-op update makes RETURNING yield the existing row on conflict;
        // xmax = 0 only holds for a freshly inserted tuple.
        let row = sqlx::query_as::<_, UpsertedConversationRow>(
            "INSERT INTO conversations (id, user1_id, user2_id, last_message_at, created_at)
             VALUES ($1, $2, $3, now(), now())
             ON CONFLICT (user1_id, user2_id) DO UPDATE SET user1_id = EXCLUDED.user1_id
             RETURNING id, user1_id, user2_id, last_message_at, created_at, (xmax = 0) AS created",
        )
        .bind(Uuid::new_v4())
        .bind(pair.low())
        .bind(pair.high())
        .fetch_one(&self.pool)
        .await?;

        Ok((Conversation::from(row.conversation), row.created))
    }

    #[instrument(name = "store.find_conversation", skip(self), err)]
    async fn find_conversation(&self, conversation_id: Uuid) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user1_id, user2_id, last_message_at, created_at
               FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Conversation::from))
    }

    #[instrument(name = "store.list_conversations", skip(self), err)]
    async fn list_conversations(&self, user_id: Uuid) -> StoreResult<Vec<ConversationSummary>> {
        let sql = format!(
            "{SUMMARY_SELECT}
             WHERE c.user1_id = $1 OR c.user2_id = $1
             ORDER BY c.last_message_at DESC"
        );

        let rows = sqlx::query_as::<_, SummaryRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ConversationSummary::from).collect())
    }

    #[instrument(name = "store.conversation_summary", skip(self), err)]
    async fn conversation_summary(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
    ) -> StoreResult<Option<ConversationSummary>> {
        let sql = format!("{SUMMARY_SELECT} WHERE c.id = $2");

        let row = sqlx::query_as::<_, SummaryRow>(&sql)
            .bind(viewer_id)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ConversationSummary::from))
    }

    #[instrument(name = "store.list_messages", skip(self), err)]
    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<MessageView>> {
        let rows = sqlx::query_as::<_, MessageViewRow>(
            "SELECT m.id, m.conversation_id, m.sender_id, m.content, m.created_at, m.read_by,
                    u.name AS sender_name, u.username AS sender_username, u.image AS sender_image
               FROM messages m
               LEFT JOIN users u ON u.id = m.sender_id
              WHERE m.conversation_id = $1
              ORDER BY m.created_at DESC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MessageView::from).collect())
    }

    #[instrument(name = "store.insert_message", skip(self, content), err)]
    async fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
    ) -> StoreResult<Message> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query("UPDATE conversations SET last_message_at = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        if bumped.rows_affected() == 0 {
            return Err(StoreError::NotFound("conversation"));
        }

        let row = sqlx::query_as::<_, MessageRow>(
            "INSERT INTO messages (id, conversation_id, sender_id, content, created_at, read_by)
             VALUES ($1, $2, $3, $4, $5, '{}')
             RETURNING id, conversation_id, sender_id, content, created_at, read_by",
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(sender_id)
        .bind(&content)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Message::from(row))
    }

    #[instrument(name = "store.mark_read", skip(self, message_ids), err)]
    async fn mark_read(
        &self,
        reader_id: Uuid,
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    ) -> StoreResult<Vec<Uuid>> {
        let changed = sqlx::query_scalar::<_, Uuid>(
            "UPDATE messages
                SET read_by = array_append(read_by, $1)
              WHERE conversation_id = $2
                AND id = ANY($3)
                AND sender_id <> $1
                AND NOT ($1 = ANY(read_by))
          RETURNING id",
        )
        .bind(reader_id)
        .bind(conversation_id)
        .bind(&message_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(changed)
    }

    #[instrument(name = "store.unread_count", skip(self), err)]
    async fn unread_count(&self, user_id: Uuid) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)
               FROM messages m
               JOIN conversations c ON c.id = m.conversation_id
              WHERE (c.user1_id = $1 OR c.user2_id = $1)
                AND m.sender_id <> $1
                AND NOT ($1 = ANY(m.read_by))",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    #[instrument(name = "store.create_notification", skip(self, notification), err)]
    async fn create_notification(&self, notification: NewNotification) -> StoreResult<Notification> {
        sqlx::query_as::<_, NotificationRow>(
            "INSERT INTO notifications (id, recipient_id, kind, title, body, payload)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, recipient_id, kind, title, body, payload, is_read, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(notification.recipient_id)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&notification.payload)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)
        .and_then(Notification::try_from)
    }

    #[instrument(name = "store.list_notifications", skip(self), err)]
    async fn list_notifications(&self, recipient_id: Uuid) -> StoreResult<Vec<Notification>> {
        sqlx::query_as::<_, NotificationRow>(
            "SELECT id, recipient_id, kind, title, body, payload, is_read, created_at
               FROM notifications
              WHERE recipient_id = $1
              ORDER BY created_at DESC",
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Notification::try_from)
        .collect()
    }

    #[instrument(name = "store.mark_notification_read", skip(self), err)]
    async fn mark_notification_read(&self, recipient_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE id = $1 AND recipient_id = $2",
        )
        .bind(id)
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "store.mark_all_notifications_read", skip(self), err)]
    async fn mark_all_notifications_read(&self, recipient_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE recipient_id = $1 AND NOT is_read",
        )
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(name = "store.delete_notification", skip(self), err)]
    async fn delete_notification(&self, recipient_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1 AND recipient_id = $2")
            .bind(id)
            .bind(recipient_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OrderStore for PgStore {
    #[instrument(name = "store.find_order", skip(self), err)]
    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        load_order(&mut conn, order_id).await
    }

    #[instrument(name = "store.find_order_by_payment_id", skip(self), err)]
    async fn find_order_by_payment_id(&self, payment_id: String) -> StoreResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        let order_id = sqlx::query_scalar::<_, Uuid>(FIND_ORDER_BY_PAYMENT_ID)
            .bind(&payment_id)
            .fetch_optional(&mut *conn)
            .await?;

        match order_id {
            Some(order_id) => load_order(&mut conn, order_id).await,
            None => Ok(None),
        }
    }

    #[instrument(name = "store.record_payment_created", skip(self), err)]
    async fn record_payment_created(
        &self,
        order_id: Uuid,
        payment_id: String,
        created_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let patch = json!({
            PAYMENT_ID_KEY: payment_id,
            PAYMENT_CREATED_AT_KEY: created_at.to_rfc3339(),
        });

        let result = sqlx::query(
            "UPDATE orders SET metadata = metadata || $2, updated_at = now() WHERE id = $1",
        )
        .bind(order_id)
        .bind(&patch)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("order"));
        }
        Ok(())
    }

    #[instrument(name = "store.mark_payment_failed", skip(self), err)]
    async fn mark_payment_failed(
        &self,
        order_id: Uuid,
        failure: PaymentFailure,
    ) -> StoreResult<bool> {
        let patch = json!({
            FAILURE_REASON_KEY: failure.reason,
            CALLBACK_STATUS_KEY: failure.callback_status,
            FAILED_AT_KEY: failure.failed_at.to_rfc3339(),
        });

        let result = sqlx::query(
            "UPDATE orders
                SET payment_status = $3, metadata = metadata || $2, updated_at = now()
              WHERE id = $1 AND payment_status <> $4",
        )
        .bind(order_id)
        .bind(&patch)
        .bind(PaymentStatus::Failed.as_str())
        .bind(PaymentStatus::Paid.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM orders WHERE id = $1)")
            .bind(order_id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound("order"))
        }
    }

    #[instrument(name = "store.mark_payment_succeeded", skip(self), err)]
    async fn mark_payment_succeeded(
        &self,
        order_id: Uuid,
        confirmation: PaymentConfirmation,
    ) -> StoreResult<PaymentTransition> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_scalar::<_, String>(
            "SELECT payment_status FROM orders WHERE id = $1 FOR UPDATE",
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("order"))?;

        let current = PaymentStatus::try_from(current.as_str())
            .map_err(|err| StoreError::Corrupt(format!("order {order_id}: {err}")))?;

        if current == PaymentStatus::Paid {
            let order = load_order(&mut tx, order_id)
                .await?
                .ok_or(StoreError::NotFound("order"))?;
            tx.commit().await?;
            return Ok(PaymentTransition::AlreadyPaid(order));
        }
        if !current.can_transition_to_paid() {
            return Err(StoreError::InvalidState(format!(
                "order {order_id} is {}",
                current.as_str()
            )));
        }

        let patch = json!({
            TRX_ID_KEY: confirmation.trx_id,
            PAID_AT_KEY: confirmation.paid_at.to_rfc3339(),
            EXECUTED_VIA_KEY: confirmation.executed_via,
        });

        sqlx::query(
            "UPDATE orders
                SET payment_status = $2, status = $3, metadata = metadata || $4, updated_at = now()
              WHERE id = $1",
        )
        .bind(order_id)
        .bind(PaymentStatus::Paid.as_str())
        .bind(OrderStatus::Processing.as_str())
        .bind(&patch)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM cart_items WHERE user_id = (SELECT user_id FROM orders WHERE id = $1)",
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE products p
                SET stock = p.stock - oi.quantity
               FROM (SELECT product_id, SUM(quantity)::BIGINT AS quantity
                       FROM order_items
                      WHERE order_id = $1
                      GROUP BY product_id) oi
              WHERE p.id = oi.product_id",
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        let order = load_order(&mut tx, order_id)
            .await?
            .ok_or(StoreError::NotFound("order"))?;
        tx.commit().await?;

        Ok(PaymentTransition::Applied(order))
    }
}
