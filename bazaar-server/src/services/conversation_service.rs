use std::{fmt, sync::Arc};

use tracing::{info, instrument};
use uuid::Uuid;

use shared::models::{Conversation, ConversationSummary, MessageView, ParticipantPair};

use crate::db::ChatStore;

use super::error::{ServiceError, ServiceResult};

/// Loads a conversation and checks that `user_id` takes part in it.
pub(crate) async fn participant_conversation(
    store: &dyn ChatStore,
    conversation_id: Uuid,
    user_id: Uuid,
) -> ServiceResult<Conversation> {
    let conversation = store
        .find_conversation(conversation_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("conversation"))?;

    if !conversation.has_participant(user_id) {
        return Err(ServiceError::forbidden(
            "not a participant in this conversation",
        ));
    }

    Ok(conversation)
}

#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn ChatStore>,
}

impl fmt::Debug for ConversationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationService").finish()
    }
}

impl ConversationService {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Returns the conversation between the two users, creating it on first
    /// contact. The flag reports whether this call created it.
    #[instrument(name = "conversations.get_or_create", skip(self), err)]
    pub async fn get_or_create(
        &self,
        current_user: Uuid,
        other_user: Uuid,
    ) -> ServiceResult<(Conversation, bool)> {
        let pair = ParticipantPair::new(current_user, other_user)
            .ok_or_else(|| ServiceError::invalid("cannot start a conversation with yourself"))?;

        if self.store.find_user(other_user).await?.is_none() {
            return Err(ServiceError::not_found("recipient"));
        }

        let (conversation, created) = self.store.get_or_create_conversation(pair).await?;
        if created {
            metrics::counter!("bazaar_conversations_created_total").increment(1);
            info!(conversation_id = %conversation.id, "conversation created");
        }
        Ok((conversation, created))
    }

    #[instrument(name = "conversations.list", skip(self), err)]
    pub async fn list(&self, user_id: Uuid) -> ServiceResult<Vec<ConversationSummary>> {
        Ok(self.store.list_conversations(user_id).await?)
    }

    #[instrument(name = "conversations.messages", skip(self), err)]
    pub async fn messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> ServiceResult<Vec<MessageView>> {
        participant_conversation(self.store.as_ref(), conversation_id, user_id).await?;
        Ok(self.store.list_messages(conversation_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{buyer_and_vendor, seed_user};
    use shared::models::UserRole;

    #[tokio::test]
    async fn second_call_returns_the_same_conversation() {
        let (store, buyer, vendor) = buyer_and_vendor().await;
        let service = ConversationService::new(store);

        let (first, created) = service.get_or_create(buyer, vendor).await.unwrap();
        assert!(created);
        let (second, created) = service.get_or_create(vendor, buyer).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert!(first.user1_id < first.user2_id);
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let (store, buyer, _) = buyer_and_vendor().await;
        let service = ConversationService::new(store);

        let err = service.get_or_create(buyer, buyer).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unknown_recipient_is_not_found() {
        let (store, buyer, _) = buyer_and_vendor().await;
        let service = ConversationService::new(store);

        let err = service
            .get_or_create(buyer, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn strangers_cannot_read_messages() {
        let (store, buyer, vendor) = buyer_and_vendor().await;
        let stranger = seed_user(&store, "Stranger", UserRole::Customer).await;
        let service = ConversationService::new(store);
        let (conversation, _) = service.get_or_create(buyer, vendor).await.unwrap();

        let err = service
            .messages(stranger, conversation.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let err = service.messages(buyer, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
