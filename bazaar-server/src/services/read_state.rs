use std::{fmt, sync::Arc};

use tracing::instrument;
use uuid::Uuid;

use shared::{
    models::MarkReadResponse,
    realtime::{ChannelName, ReadReceiptEvent, UnreadUpdateEvent, events},
};

use crate::{
    db::ChatStore,
    realtime::{Transport, publish_best_effort},
};

use super::{
    conversation_service::participant_conversation,
    error::{ServiceError, ServiceResult},
};

/// Per-message read tracking and unread aggregation.
#[derive(Clone)]
pub struct ReadStateService {
    store: Arc<dyn ChatStore>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for ReadStateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStateService").finish()
    }
}

impl ReadStateService {
    pub fn new(store: Arc<dyn ChatStore>, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    /// Adds the reader to `read_by` of the given messages. Repeating the call
    /// changes nothing.
    #[instrument(name = "read_state.mark_read", skip(self, message_ids), fields(count = message_ids.len()), err)]
    pub async fn mark_read(
        &self,
        reader_id: Uuid,
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    ) -> ServiceResult<MarkReadResponse> {
        if message_ids.is_empty() {
            return Err(ServiceError::invalid("messageIds must not be empty"));
        }
        participant_conversation(self.store.as_ref(), conversation_id, reader_id).await?;

        let changed = self
            .store
            .mark_read(reader_id, conversation_id, message_ids.clone())
            .await?;

        let transport = self.transport.as_ref();
        publish_best_effort(
            transport,
            ChannelName::Conversation(conversation_id),
            events::READ_RECEIPT,
            &ReadReceiptEvent {
                reader_id,
                message_ids,
                conversation_id,
            },
        )
        .await;
        publish_best_effort(
            transport,
            ChannelName::Unread(reader_id),
            events::UNREAD_UPDATE,
            &UnreadUpdateEvent { user_id: reader_id },
        )
        .await;

        Ok(MarkReadResponse {
            success: true,
            marked: changed.len() as u64,
        })
    }

    #[instrument(name = "read_state.unread_count", skip(self), err)]
    pub async fn unread_count(&self, user_id: Uuid) -> ServiceResult<i64> {
        Ok(self.store.unread_count(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        realtime::ChannelHub,
        services::{conversation_service::ConversationService, message_service::MessageService},
        test_support::{buyer_and_vendor, seed_user},
    };
    use shared::models::UserRole;
    use std::time::Duration;

    struct Fixture {
        reads: ReadStateService,
        messages: MessageService,
        hub: Arc<ChannelHub>,
        buyer: Uuid,
        vendor: Uuid,
        conversation_id: Uuid,
        store: Arc<crate::db::memory::MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let (store, buyer, vendor) = buyer_and_vendor().await;
        let hub = Arc::new(ChannelHub::new(32, 16, Duration::from_secs(60)));
        let (conversation, _) = ConversationService::new(store.clone())
            .get_or_create(buyer, vendor)
            .await
            .unwrap();
        Fixture {
            reads: ReadStateService::new(store.clone(), hub.clone()),
            messages: MessageService::new(store.clone(), hub.clone(), 4000),
            hub,
            buyer,
            vendor,
            conversation_id: conversation.id,
            store,
        }
    }

    #[tokio::test]
    async fn unread_counts_follow_sends_and_reads() {
        let f = fixture().await;
        let first = f
            .messages
            .send(f.buyer, f.conversation_id, "one".into())
            .await
            .unwrap();
        let second = f
            .messages
            .send(f.buyer, f.conversation_id, "two".into())
            .await
            .unwrap();
        f.messages
            .send(f.vendor, f.conversation_id, "reply".into())
            .await
            .unwrap();

        assert_eq!(f.reads.unread_count(f.vendor).await.unwrap(), 2);
        assert_eq!(f.reads.unread_count(f.buyer).await.unwrap(), 1);

        let response = f
            .reads
            .mark_read(f.vendor, f.conversation_id, vec![first.id])
            .await
            .unwrap();
        assert_eq!(response.marked, 1);
        assert_eq!(f.reads.unread_count(f.vendor).await.unwrap(), 1);

        f.reads
            .mark_read(f.vendor, f.conversation_id, vec![first.id, second.id])
            .await
            .unwrap();
        assert_eq!(f.reads.unread_count(f.vendor).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn marking_twice_is_idempotent() {
        let f = fixture().await;
        let message = f
            .messages
            .send(f.buyer, f.conversation_id, "hello".into())
            .await
            .unwrap();

        for expected in [1, 0] {
            let response = f
                .reads
                .mark_read(f.vendor, f.conversation_id, vec![message.id])
                .await
                .unwrap();
            assert!(response.success);
            assert_eq!(response.marked, expected);
        }

        let views = f.store.list_messages(f.conversation_id).await.unwrap();
        assert_eq!(views[0].message.read_by, vec![f.vendor]);
        assert_eq!(f.reads.unread_count(f.vendor).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn senders_never_mark_their_own_messages() {
        let f = fixture().await;
        let message = f
            .messages
            .send(f.buyer, f.conversation_id, "mine".into())
            .await
            .unwrap();

        let response = f
            .reads
            .mark_read(f.buyer, f.conversation_id, vec![message.id])
            .await
            .unwrap();
        assert_eq!(response.marked, 0);
    }

    #[tokio::test]
    async fn empty_ids_and_strangers_are_rejected() {
        let f = fixture().await;
        let stranger = seed_user(&f.store, "Stranger", UserRole::Customer).await;

        let err = f
            .reads
            .mark_read(f.vendor, f.conversation_id, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        let err = f
            .reads
            .mark_read(stranger, f.conversation_id, vec![Uuid::new_v4()])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn read_receipt_reaches_the_conversation() {
        let f = fixture().await;
        let message = f
            .messages
            .send(f.buyer, f.conversation_id, "hello".into())
            .await
            .unwrap();
        let mut room = f
            .hub
            .subscribe(ChannelName::Conversation(f.conversation_id), None)
            .await
            .unwrap();

        f.reads
            .mark_read(f.vendor, f.conversation_id, vec![message.id])
            .await
            .unwrap();

        let frame = room.receiver.try_recv().unwrap();
        assert_eq!(frame.event, events::READ_RECEIPT);
        let receipt: ReadReceiptEvent = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(receipt.reader_id, f.vendor);
        assert_eq!(receipt.message_ids, vec![message.id]);
    }
}
