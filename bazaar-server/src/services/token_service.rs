use std::{fmt, sync::Arc};

use tracing::{debug, instrument};
use uuid::Uuid;

use shared::realtime::{Capability, ChannelName, ChannelTokenResponse};

use crate::{
    auth::channel_token::{
        ChannelGrant, TokenError, TokenIssuer, chat_capabilities, fingerprint,
        personal_capabilities,
    },
    db::ChatStore,
};

use super::{
    conversation_service::participant_conversation,
    error::{ServiceError, ServiceResult},
};

/// Issues and checks realtime channel tokens.
#[derive(Clone)]
pub struct TokenService {
    issuer: Arc<TokenIssuer>,
    store: Arc<dyn ChatStore>,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired | TokenError::Invalid(_) => Self::Unauthenticated,
            TokenError::Signing(message) => Self::Internal(message),
        }
    }
}

impl TokenService {
    pub fn new(issuer: Arc<TokenIssuer>, store: Arc<dyn ChatStore>) -> Self {
        Self { issuer, store }
    }

    /// Token for one conversation channel, for participants only.
    #[instrument(name = "tokens.chat", skip(self), err)]
    pub async fn chat_token(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> ServiceResult<ChannelTokenResponse> {
        participant_conversation(self.store.as_ref(), conversation_id, user_id).await?;
        let issued = self
            .issuer
            .issue(user_id, chat_capabilities(conversation_id))?;
        debug!(token = %fingerprint(&issued.token), "issued chat token");
        Ok(issued)
    }

    /// Subscribe-only token for the caller's own channels.
    #[instrument(name = "tokens.personal", skip(self), err)]
    pub fn personal_token(&self, user_id: Uuid) -> ServiceResult<ChannelTokenResponse> {
        let issued = self.issuer.issue(user_id, personal_capabilities(user_id))?;
        debug!(token = %fingerprint(&issued.token), "issued personal token");
        Ok(issued)
    }

    /// Verifies `token` and checks it grants `capability` on `channel`.
    pub fn authorize(
        &self,
        token: Option<&str>,
        channel: ChannelName,
        capability: Capability,
    ) -> ServiceResult<ChannelGrant> {
        let token = token.ok_or(ServiceError::Unauthenticated)?;
        let grant = self.issuer.verify(token).inspect_err(|err| {
            debug!(token = %fingerprint(token), error = %err, "rejected channel token");
        })?;

        if !grant.allows(channel, capability) {
            return Err(ServiceError::forbidden(format!(
                "token does not grant {capability:?} on {channel}"
            )));
        }
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::conversation_service::ConversationService,
        test_support::{buyer_and_vendor, seed_user},
    };
    use shared::models::UserRole;
    use std::time::Duration;

    fn issuer() -> Arc<TokenIssuer> {
        Arc::new(TokenIssuer::new("realtime-secret", Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn chat_tokens_require_participation() {
        let (store, buyer, vendor) = buyer_and_vendor().await;
        let stranger = seed_user(&store, "Stranger", UserRole::Customer).await;
        let (conversation, _) = ConversationService::new(store.clone())
            .get_or_create(buyer, vendor)
            .await
            .unwrap();
        let tokens = TokenService::new(issuer(), store);

        let issued = tokens.chat_token(buyer, conversation.id).await.unwrap();
        let channel = ChannelName::Conversation(conversation.id);
        assert_eq!(
            issued.capabilities[&channel.to_string()],
            Capability::CHAT.to_vec()
        );

        let err = tokens
            .chat_token(stranger, conversation.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let err = tokens
            .chat_token(buyer, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn authorize_distinguishes_missing_bad_and_insufficient_tokens() {
        let (store, buyer, _) = buyer_and_vendor().await;
        let tokens = TokenService::new(issuer(), store);
        let personal = tokens.personal_token(buyer).unwrap();
        let inbox = ChannelName::Inbox(buyer);

        assert!(
            tokens
                .authorize(Some(&personal.token), inbox, Capability::Subscribe)
                .is_ok()
        );
        assert!(matches!(
            tokens.authorize(None, inbox, Capability::Subscribe),
            Err(ServiceError::Unauthenticated)
        ));
        assert!(matches!(
            tokens.authorize(Some("garbage"), inbox, Capability::Subscribe),
            Err(ServiceError::Unauthenticated)
        ));
        assert!(matches!(
            tokens.authorize(Some(&personal.token), inbox, Capability::Publish),
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            tokens.authorize(
                Some(&personal.token),
                ChannelName::Inbox(Uuid::new_v4()),
                Capability::Subscribe
            ),
            Err(ServiceError::Forbidden(_))
        ));
    }
}
