use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, State},
    routing::{get, post},
};
use tracing::instrument;

use crate::{
    app_state::AppState,
    http::{error::AppResult, extract::ApiJson, problem::ProblemDetails},
    middleware::{auth::require_user, request_context::RequestContext},
};
use shared::models::{
    MarkReadRequest, MarkReadResponse, Message, SendMessageRequest, UnreadCountResponse,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/messages/send", post(send_message))
        .route("/messages/mark-read", post(mark_read))
        .route("/unread-count", get(unread_count))
}

#[utoipa::path(
    post,
    path = "/api/messages/send",
    request_body = SendMessageRequest,
    responses(
        (status = 200, description = "Message stored and published", body = Message),
        (status = 400, description = "Empty or oversized content", body = ProblemDetails),
        (status = 401, description = "Not signed in", body = ProblemDetails),
        (status = 403, description = "Not a participant", body = ProblemDetails),
        (status = 404, description = "Conversation not found", body = ProblemDetails)
    ),
    tag = "Messages"
)]
#[instrument(skip(state, context, payload), fields(conversation_id = %payload.conversation_id))]
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    ApiJson(payload): ApiJson<SendMessageRequest>,
) -> AppResult<Json<Message>> {
    let user = require_user(&context)?;
    let message = state
        .messages
        .send(user.id, payload.conversation_id, payload.content)
        .await?;
    Ok(Json(message))
}

#[utoipa::path(
    post,
    path = "/api/messages/mark-read",
    request_body = MarkReadRequest,
    responses(
        (status = 200, description = "Messages marked as read", body = MarkReadResponse),
        (status = 400, description = "No message ids given", body = ProblemDetails),
        (status = 401, description = "Not signed in", body = ProblemDetails),
        (status = 403, description = "Not a participant", body = ProblemDetails)
    ),
    tag = "Messages"
)]
#[instrument(skip(state, context, payload), fields(conversation_id = %payload.conversation_id))]
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    ApiJson(payload): ApiJson<MarkReadRequest>,
) -> AppResult<Json<MarkReadResponse>> {
    let user = require_user(&context)?;
    let response = state
        .read_state
        .mark_read(user.id, payload.conversation_id, payload.message_ids)
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/unread-count",
    responses(
        (status = 200, description = "Unread messages across all conversations", body = UnreadCountResponse),
        (status = 401, description = "Not signed in", body = ProblemDetails)
    ),
    tag = "Messages"
)]
#[instrument(skip(state, context))]
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<UnreadCountResponse>> {
    let user = require_user(&context)?;
    let unread_count = state.read_state.unread_count(user.id).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}
