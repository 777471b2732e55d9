use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::{error::AppResult, extract::ApiJson, problem::ProblemDetails},
    middleware::{auth::require_user, request_context::RequestContext},
};
use shared::models::{Conversation, ConversationSummary, CreateConversationRequest, MessageView};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(list_messages),
        )
}

/// Opens (or reopens) the conversation with another user.
#[utoipa::path(
    post,
    path = "/api/conversations",
    request_body = CreateConversationRequest,
    responses(
        (status = 201, description = "Conversation created", body = Conversation),
        (status = 200, description = "Existing conversation returned", body = Conversation),
        (status = 400, description = "Cannot start a conversation with yourself", body = ProblemDetails),
        (status = 401, description = "Not signed in", body = ProblemDetails),
        (status = 404, description = "Recipient does not exist", body = ProblemDetails)
    ),
    tag = "Conversations"
)]
#[instrument(skip(state, context))]
pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    ApiJson(payload): ApiJson<CreateConversationRequest>,
) -> AppResult<impl IntoResponse> {
    let user = require_user(&context)?;
    let (conversation, created) = state
        .conversations
        .get_or_create(user.id, payload.recipient_id)
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}

#[utoipa::path(
    get,
    path = "/api/conversations",
    responses(
        (status = 200, description = "Inbox, most recent first", body = [ConversationSummary]),
        (status = 401, description = "Not signed in", body = ProblemDetails)
    ),
    tag = "Conversations"
)]
#[instrument(skip(state, context))]
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<Vec<ConversationSummary>>> {
    let user = require_user(&context)?;
    Ok(Json(state.conversations.list(user.id).await?))
}

#[utoipa::path(
    get,
    path = "/api/conversations/{conversation_id}/messages",
    params(("conversation_id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, description = "Messages, newest first", body = [MessageView]),
        (status = 401, description = "Not signed in", body = ProblemDetails),
        (status = 403, description = "Not a participant", body = ProblemDetails),
        (status = 404, description = "Conversation not found", body = ProblemDetails)
    ),
    tag = "Conversations"
)]
#[instrument(skip(state, context))]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<Vec<MessageView>>> {
    let user = require_user(&context)?;
    Ok(Json(
        state.conversations.messages(user.id, conversation_id).await?,
    ))
}
