//! Channel endpoints authorized by realtime channel tokens rather than sessions.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::{info, instrument, warn};
use utoipa::IntoParams;

use crate::{
    app_state::AppState,
    http::{
        error::{ApiError, AppResult},
        extract::ApiJson,
        problem::ProblemDetails,
    },
    middleware::auth::bearer_token,
    realtime::{HubEvent, Subscription, Transport},
};
use shared::realtime::{
    Capability, ChannelName, ClientPublishRequest, PresenceAction, PresenceMembersResponse,
    PresenceRequest, events,
};

const MAX_EVENT_NAME_LEN: usize = 64;

/// Event names only the server may publish.
const RESERVED_EVENTS: [&str; 7] = [
    events::MESSAGE,
    events::READ_RECEIPT,
    events::NEW_MESSAGE,
    events::UNREAD_UPDATE,
    events::PRESENCE,
    events::NOTIFICATION,
    "error",
];

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ChannelAuthQuery {
    /// Channel token, for clients that cannot set an `Authorization` header.
    pub token: Option<String>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/realtime/{channel}/stream", get(stream_channel))
        .route("/realtime/{channel}/publish", post(publish))
        .route(
            "/realtime/{channel}/presence",
            get(presence_members).post(update_presence),
        )
}

fn parse_channel(raw: &str) -> Result<ChannelName, ApiError> {
    raw.parse()
        .map_err(|err: shared::realtime::ChannelParseError| ApiError::bad_request(err.to_string()))
}

/// The query parameter wins over the header: browsers' `EventSource` cannot set headers.
fn channel_token(query: &ChannelAuthQuery, headers: &HeaderMap) -> Option<String> {
    query
        .token
        .clone()
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(headers))
}

fn validate_event_name(event: &str) -> Result<(), ApiError> {
    let event = event.trim();
    if event.is_empty() {
        return Err(ApiError::bad_request("event name is required"));
    }
    if event.len() > MAX_EVENT_NAME_LEN {
        return Err(ApiError::bad_request(format!(
            "event name exceeds {MAX_EVENT_NAME_LEN} bytes"
        )));
    }
    if RESERVED_EVENTS.contains(&event) {
        return Err(ApiError::bad_request(format!(
            "event name '{event}' is reserved"
        )));
    }
    Ok(())
}

fn to_sse(frame: HubEvent) -> Event {
    let mut event = Event::default().event(&frame.event);
    if let Some(id) = frame.id() {
        event = event.id(id);
    }
    event.data(frame.data)
}

/// Server-sent events for one channel, resumable with `Last-Event-ID`.
#[utoipa::path(
    get,
    path = "/api/realtime/{channel}/stream",
    params(
        ("channel" = String, Path, description = "Channel name, e.g. conversation:{id}"),
        ChannelAuthQuery
    ),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = String),
        (status = 400, description = "Malformed channel name", body = ProblemDetails),
        (status = 401, description = "Missing or invalid channel token", body = ProblemDetails),
        (status = 403, description = "Token does not grant subscribe", body = ProblemDetails)
    ),
    tag = "Realtime"
)]
#[instrument(skip(state, query, headers))]
pub async fn stream_channel(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<ChannelAuthQuery>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let channel = parse_channel(&channel)?;
    let token = channel_token(&query, &headers);
    let grant = state
        .tokens
        .authorize(token.as_deref(), channel, Capability::Subscribe)?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok());
    let Subscription { backlog, receiver } = state.hub.subscribe(channel, last_event_id).await?;

    info!(
        %channel,
        client_id = %grant.client_id,
        replayed = backlog.len(),
        "realtime stream opened"
    );

    let live = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(%channel, error = %err, "subscriber fell behind; frames dropped");
            None
        }
    });
    let stream = tokio_stream::iter(backlog)
        .chain(live)
        .map(|frame| Ok::<_, Infallible>(to_sse(frame)));

    let keepalive = KeepAlive::new()
        .interval(Duration::from_secs(
            state.config.realtime.heartbeat_seconds.max(5),
        ))
        .text("keep-alive");

    Ok(Sse::new(stream).keep_alive(keepalive))
}

/// Relays a client event to everyone on a conversation channel.
#[utoipa::path(
    post,
    path = "/api/realtime/{channel}/publish",
    params(
        ("channel" = String, Path, description = "Conversation channel name"),
        ChannelAuthQuery
    ),
    request_body = ClientPublishRequest,
    responses(
        (status = 202, description = "Event accepted for delivery"),
        (status = 400, description = "Malformed channel or reserved event name", body = ProblemDetails),
        (status = 401, description = "Missing or invalid channel token", body = ProblemDetails),
        (status = 403, description = "Token does not grant publish", body = ProblemDetails)
    ),
    tag = "Realtime"
)]
#[instrument(skip(state, query, headers, payload), fields(event = %payload.event))]
pub async fn publish(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<ChannelAuthQuery>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<ClientPublishRequest>,
) -> AppResult<StatusCode> {
    let channel = parse_channel(&channel)?;
    let token = channel_token(&query, &headers);
    state
        .tokens
        .authorize(token.as_deref(), channel, Capability::Publish)?;

    if !channel.is_conversation() {
        return Err(ApiError::forbidden(
            "client events are only accepted on conversation channels",
        ));
    }
    validate_event_name(&payload.event)?;

    state
        .hub
        .publish(channel, payload.event.trim().to_string(), payload.data)
        .await?;
    metrics::counter!("bazaar_realtime_client_publishes_total").increment(1);
    Ok(StatusCode::ACCEPTED)
}

#[utoipa::path(
    post,
    path = "/api/realtime/{channel}/presence",
    params(
        ("channel" = String, Path, description = "Conversation channel name"),
        ChannelAuthQuery
    ),
    request_body = PresenceRequest,
    responses(
        (status = 204, description = "Presence updated"),
        (status = 400, description = "Presence is not tracked on this channel", body = ProblemDetails),
        (status = 401, description = "Missing or invalid channel token", body = ProblemDetails),
        (status = 403, description = "Token does not grant presence", body = ProblemDetails)
    ),
    tag = "Realtime"
)]
#[instrument(skip(state, query, headers))]
pub async fn update_presence(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<ChannelAuthQuery>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<PresenceRequest>,
) -> AppResult<StatusCode> {
    let channel = parse_channel(&channel)?;
    let token = channel_token(&query, &headers);
    let grant = state
        .tokens
        .authorize(token.as_deref(), channel, Capability::Presence)?;

    match request.action {
        PresenceAction::Enter => state.hub.enter_presence(channel, grant.client_id).await?,
        PresenceAction::Heartbeat => {
            state
                .hub
                .heartbeat_presence(channel, grant.client_id)
                .await?;
        }
        PresenceAction::Leave => {
            if let Err(err) = state.hub.leave_presence(channel, grant.client_id).await {
                warn!(%channel, client_id = %grant.client_id, error = %err, "presence leave failed");
            }
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/realtime/{channel}/presence",
    params(
        ("channel" = String, Path, description = "Conversation channel name"),
        ChannelAuthQuery
    ),
    responses(
        (status = 200, description = "Current members", body = PresenceMembersResponse),
        (status = 400, description = "Presence is not tracked on this channel", body = ProblemDetails),
        (status = 401, description = "Missing or invalid channel token", body = ProblemDetails),
        (status = 403, description = "Token does not grant presence", body = ProblemDetails)
    ),
    tag = "Realtime"
)]
#[instrument(skip(state, query, headers))]
pub async fn presence_members(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<ChannelAuthQuery>,
    headers: HeaderMap,
) -> AppResult<Json<PresenceMembersResponse>> {
    let channel = parse_channel(&channel)?;
    let token = channel_token(&query, &headers);
    state
        .tokens
        .authorize(token.as_deref(), channel, Capability::Presence)?;

    let members = state.hub.presence_members(channel).await?;
    Ok(Json(PresenceMembersResponse { members }))
}
