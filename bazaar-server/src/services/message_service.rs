use std::{fmt, sync::Arc};

use tracing::{debug, instrument};
use uuid::Uuid;

use shared::{
    models::{Message, MessageView, UserProfile},
    realtime::{ChannelName, UnreadUpdateEvent, events},
};

use crate::{
    db::ChatStore,
    realtime::{Transport, publish_best_effort},
};

use super::{
    conversation_service::participant_conversation,
    error::{ServiceError, ServiceResult},
};

/// Persists messages, then fans them out over realtime channels.
#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn ChatStore>,
    transport: Arc<dyn Transport>,
    max_message_chars: usize,
}

impl fmt::Debug for MessageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageService")
            .field("max_message_chars", &self.max_message_chars)
            .finish_non_exhaustive()
    }
}

impl MessageService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        transport: Arc<dyn Transport>,
        max_message_chars: usize,
    ) -> Self {
        Self {
            store,
            transport,
            max_message_chars,
        }
    }

    fn validate(&self, content: &str) -> ServiceResult<()> {
        if content.trim().is_empty() {
            return Err(ServiceError::invalid("message content must not be empty"));
        }
        if content.chars().count() > self.max_message_chars {
            return Err(ServiceError::invalid(format!(
                "message content exceeds {} characters",
                self.max_message_chars
            )));
        }
        Ok(())
    }

    /// Stores the message and notifies both participants.
    ///
    /// The write is authoritative; realtime delivery failures are logged and
    /// never undo it.
    #[instrument(name = "messages.send", skip(self, content), fields(len = content.len()), err)]
    pub async fn send(
        &self,
        sender_id: Uuid,
        conversation_id: Uuid,
        content: String,
    ) -> ServiceResult<Message> {
        self.validate(&content)?;
        let conversation =
            participant_conversation(self.store.as_ref(), conversation_id, sender_id).await?;

        let message = self
            .store
            .insert_message(conversation_id, sender_id, content)
            .await?;
        metrics::counter!("bazaar_messages_sent_total").increment(1);

        let sender = self
            .store
            .find_user(sender_id)
            .await?
            .map_or_else(|| UserProfile::unknown(sender_id), |user| user.profile());
        let view = MessageView {
            message: message.clone(),
            sender,
        };
        let transport = self.transport.as_ref();
        publish_best_effort(
            transport,
            ChannelName::Conversation(conversation_id),
            events::MESSAGE,
            &view,
        )
        .await;

        if let Some(recipient) = conversation.counterpart(sender_id) {
            publish_best_effort(
                transport,
                ChannelName::Unread(recipient),
                events::UNREAD_UPDATE,
                &UnreadUpdateEvent { user_id: recipient },
            )
            .await;
        }

        for participant in conversation.participants() {
            match self
                .store
                .conversation_summary(conversation_id, participant)
                .await
            {
                Ok(Some(summary)) => {
                    publish_best_effort(
                        transport,
                        ChannelName::Inbox(participant),
                        events::NEW_MESSAGE,
                        &summary,
                    )
                    .await;
                }
                Ok(None) => debug!(%participant, "no summary for inbox update"),
                Err(err) => {
                    metrics::counter!(
                        "bazaar_realtime_publish_failures_total",
                        "event" => events::NEW_MESSAGE
                    )
                    .increment(1);
                    tracing::warn!(%participant, error = %err, "failed to load inbox summary");
                }
            }
        }

        Ok(message)
    }
}
