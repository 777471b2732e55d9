use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query, State, rejection::QueryRejection},
    response::Redirect,
    routing::{get, post},
};
use tracing::{info, instrument, warn};

use crate::{
    app_state::AppState,
    http::{error::AppResult, extract::ApiJson, problem::ProblemDetails},
    middleware::{auth::require_user, request_context::RequestContext},
};
use shared::models::{CreatePaymentRequest, CreatePaymentResponse, PaymentCallbackQuery};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payments/bkash/create", post(create_payment))
        .route("/payments/bkash/callback", get(payment_callback))
}

/// Starts a bKash checkout for one of the caller's unpaid orders.
#[utoipa::path(
    post,
    path = "/api/payments/bkash/create",
    request_body = CreatePaymentRequest,
    responses(
        (status = 200, description = "Checkout session opened", body = CreatePaymentResponse),
        (status = 401, description = "Not signed in", body = ProblemDetails),
        (status = 403, description = "Order belongs to another user", body = ProblemDetails),
        (status = 404, description = "Order not found", body = ProblemDetails),
        (status = 409, description = "Order is not payable", body = ProblemDetails),
        (status = 502, description = "Payment provider unavailable", body = ProblemDetails)
    ),
    tag = "Payments"
)]
#[instrument(skip(state, context))]
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    ApiJson(payload): ApiJson<CreatePaymentRequest>,
) -> AppResult<Json<CreatePaymentResponse>> {
    let user = require_user(&context)?;
    let session = state
        .payments
        .create_payment(user.id, payload.order_id)
        .await?;
    Ok(Json(session))
}

/// Provider redirect after checkout. Always answers with a redirect to the storefront.
#[utoipa::path(
    get,
    path = "/api/payments/bkash/callback",
    params(PaymentCallbackQuery),
    responses(
        (status = 303, description = "Redirect to the success or cancel page")
    ),
    tag = "Payments"
)]
#[instrument(skip(state))]
pub async fn payment_callback(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PaymentCallbackQuery>, QueryRejection>,
) -> Redirect {
    let query = query.map(|Query(query)| query).unwrap_or_else(|err| {
        warn!(error = %err, "unreadable payment callback query");
        PaymentCallbackQuery::default()
    });
    let outcome = state.payments.handle_callback(query).await;
    let target = state.payments.redirect_for(&outcome);
    info!(?outcome, "payment callback handled");
    Redirect::to(&target)
}
