use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::{error::AppResult, problem::ProblemDetails},
    middleware::{auth::require_user, request_context::RequestContext},
};
use shared::models::{MarkAllReadResponse, Notification};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/notifications/{notification_id}/read", post(mark_read))
        .route("/notifications/{notification_id}", delete(delete_notification))
}

#[utoipa::path(
    get,
    path = "/api/notifications",
    responses(
        (status = 200, description = "Notifications, newest first", body = [Notification]),
        (status = 401, description = "Not signed in", body = ProblemDetails)
    ),
    tag = "Notifications"
)]
#[instrument(skip(state, context))]
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<Vec<Notification>>> {
    let user = require_user(&context)?;
    Ok(Json(state.notifications.list(user.id).await?))
}

#[utoipa::path(
    post,
    path = "/api/notifications/{notification_id}/read",
    params(("notification_id" = Uuid, Path, description = "Notification id")),
    responses(
        (status = 204, description = "Notification marked as read"),
        (status = 401, description = "Not signed in", body = ProblemDetails),
        (status = 404, description = "No such notification for this user", body = ProblemDetails)
    ),
    tag = "Notifications"
)]
#[instrument(skip(state, context))]
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(notification_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let user = require_user(&context)?;
    state
        .notifications
        .mark_read(user.id, notification_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/notifications/read-all",
    responses(
        (status = 200, description = "Unread notifications marked as read", body = MarkAllReadResponse),
        (status = 401, description = "Not signed in", body = ProblemDetails)
    ),
    tag = "Notifications"
)]
#[instrument(skip(state, context))]
pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<MarkAllReadResponse>> {
    let user = require_user(&context)?;
    let updated = state.notifications.mark_all_read(user.id).await?;
    Ok(Json(MarkAllReadResponse { updated }))
}

#[utoipa::path(
    delete,
    path = "/api/notifications/{notification_id}",
    params(("notification_id" = Uuid, Path, description = "Notification id")),
    responses(
        (status = 204, description = "Notification deleted"),
        (status = 401, description = "Not signed in", body = ProblemDetails),
        (status = 404, description = "No such notification for this user", body = ProblemDetails)
    ),
    tag = "Notifications"
)]
#[instrument(skip(state, context))]
pub async fn delete_notification(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(notification_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let user = require_user(&context)?;
    state.notifications.delete(user.id, notification_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
