use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query, State},
    routing::get,
};
use serde::Deserialize;
use tracing::instrument;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::{
        error::{ApiError, AppResult},
        problem::ProblemDetails,
    },
    middleware::{auth::require_user, request_context::RequestContext},
};
use shared::realtime::ChannelTokenResponse;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query, rename_all = "camelCase")]
pub struct ChatTokenQuery {
    /// Conversation the token should grant access to.
    pub conversation_id: Option<String>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat-token", get(chat_token))
        .route("/notification-token", get(notification_token))
}

fn parse_conversation_id(raw: Option<&str>) -> Result<Uuid, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("conversationId is required"))?;
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("conversationId must be a UUID"))
}

/// Publish, subscribe and presence on one conversation channel.
#[utoipa::path(
    get,
    path = "/api/chat-token",
    params(ChatTokenQuery),
    responses(
        (status = 200, description = "Channel token issued", body = ChannelTokenResponse),
        (status = 400, description = "Missing or malformed conversationId", body = ProblemDetails),
        (status = 401, description = "Not signed in", body = ProblemDetails),
        (status = 403, description = "Not a participant", body = ProblemDetails),
        (status = 404, description = "Conversation not found", body = ProblemDetails)
    ),
    tag = "Realtime"
)]
#[instrument(skip(state, context))]
pub async fn chat_token(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Query(query): Query<ChatTokenQuery>,
) -> AppResult<Json<ChannelTokenResponse>> {
    let user = require_user(&context)?;
    let conversation_id = parse_conversation_id(query.conversation_id.as_deref())?;
    let issued = state.tokens.chat_token(user.id, conversation_id).await?;
    Ok(Json(issued))
}

/// Subscribe-only access to the caller's inbox, unread and notification channels.
#[utoipa::path(
    get,
    path = "/api/notification-token",
    responses(
        (status = 200, description = "Channel token issued", body = ChannelTokenResponse),
        (status = 401, description = "Not signed in", body = ProblemDetails)
    ),
    tag = "Realtime"
)]
#[instrument(skip(state, context))]
pub async fn notification_token(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<ChannelTokenResponse>> {
    let user = require_user(&context)?;
    Ok(Json(state.tokens.personal_token(user.id)?))
}
