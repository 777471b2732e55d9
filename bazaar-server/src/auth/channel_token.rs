//! Short-lived realtime channel tokens.
//!
//! Tokens are HS256 JWTs scoped to the `bazaar-realtime` audience so they
//! can never be replayed as session tokens (and vice versa).

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use shared::realtime::{Capability, CapabilityMap, ChannelName, ChannelTokenResponse};

pub const CHANNEL_TOKEN_AUDIENCE: &str = "bazaar-realtime";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("channel token expired")]
    Expired,
    #[error("channel token invalid: {0}")]
    Invalid(String),
    #[error("failed to sign channel token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::Invalid(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelClaims {
    pub sub: Uuid,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
    pub capabilities: CapabilityMap,
}

/// What a verified token lets its holder do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGrant {
    pub client_id: Uuid,
    pub capabilities: CapabilityMap,
}

impl ChannelGrant {
    #[must_use]
    pub fn allows(&self, channel: ChannelName, capability: Capability) -> bool {
        self.capabilities
            .get(&channel.to_string())
            .is_some_and(|granted| granted.contains(&capability))
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    #[must_use]
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[CHANNEL_TOKEN_AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "sub", "aud"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    #[must_use]
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.validation.leeway = seconds;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Signs a token granting `capabilities` to `client_id`.
    pub fn issue(
        &self,
        client_id: Uuid,
        capabilities: CapabilityMap,
    ) -> Result<ChannelTokenResponse, TokenError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = ChannelClaims {
            sub: client_id,
            aud: CHANNEL_TOKEN_AUDIENCE.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
            jti: Uuid::new_v4(),
            capabilities: capabilities.clone(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| TokenError::Signing(err.to_string()))?;

        Ok(ChannelTokenResponse {
            token,
            capabilities,
            ttl: self.ttl.as_secs(),
        })
    }

    pub fn verify(&self, token: &str) -> Result<ChannelGrant, TokenError> {
        let data = decode::<ChannelClaims>(token, &self.decoding, &self.validation)?;
        Ok(ChannelGrant {
            client_id: data.claims.sub,
            capabilities: data.claims.capabilities,
        })
    }
}

/// Full chat access on one conversation channel.
#[must_use]
pub fn chat_capabilities(conversation_id: Uuid) -> CapabilityMap {
    CapabilityMap::from([(
        ChannelName::Conversation(conversation_id).to_string(),
        Capability::CHAT.to_vec(),
    )])
}

/// Subscribe-only access on the user's personal channels.
#[must_use]
pub fn personal_capabilities(user_id: Uuid) -> CapabilityMap {
    ChannelName::personal(user_id)
        .into_iter()
        .map(|channel| (channel.to_string(), Capability::LISTEN.to_vec()))
        .collect()
}

/// Short digest of a token, safe to put in logs.
#[must_use]
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest[..6].iter().map(|byte| format!("{byte:02x}")).collect()
}
