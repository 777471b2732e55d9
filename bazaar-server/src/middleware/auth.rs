use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use cookie::Cookie;
use tracing::{debug, instrument};

use crate::{
    auth::session::{SessionUser, SessionVerifier},
    http::error::ApiError,
    middleware::request_context::RequestContext,
};
use shared::config::server::Config;

#[derive(Clone, Debug)]
pub struct AuthState {
    verifier: SessionVerifier,
    cookie_name: String,
}

impl AuthState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            verifier: SessionVerifier::new(&config.auth.session_secret),
            cookie_name: config.auth.session_cookie.clone(),
        }
    }
}

/// Resolves the caller from a bearer token or the session cookie.
///
/// Never rejects: anonymous requests pass through with no session and the
/// handlers that need one answer `401` through [`require_user`].
#[instrument(skip_all, fields(path = %req.uri().path()))]
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let session = extract_token(req.headers(), &state.cookie_name).and_then(|token| {
        state
            .verifier
            .verify(&token)
            .inspect_err(|err| debug!(error = %err, "ignoring invalid session token"))
            .ok()
    });

    if let Some(context) = req.extensions_mut().get_mut::<RequestContext>() {
        context.session = session;
    } else {
        req.extensions_mut().insert(RequestContext {
            request_id: String::new(),
            session,
        });
    }

    next.run(req).await
}

/// The authenticated caller or `401`.
pub fn require_user(context: &RequestContext) -> Result<SessionUser, ApiError> {
    context
        .session
        .ok_or_else(|| ApiError::unauthorized("authentication required"))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    bearer_token(headers).or_else(|| extract_session_cookie(headers, cookie_name))
}

fn extract_session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(header::COOKIE)?.to_str().ok()?;
    Cookie::split_parse(value)
        .flatten()
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}
