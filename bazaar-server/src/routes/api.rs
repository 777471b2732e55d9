use std::sync::Arc;

use axum::Router;

use crate::{app_state::AppState, handlers};

/// Every `/api` route. Session and channel-token checks happen in the handlers.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(handlers::conversations::routes())
        .merge(handlers::messages::routes())
        .merge(handlers::tokens::routes())
        .merge(handlers::realtime::routes())
        .merge(handlers::notifications::routes())
        .merge(handlers::payments::routes())
}
