use std::{
    str::FromStr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use axum::{
    Extension, Router,
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, DatabaseConfig, LogFormat};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::{AppState, Stores},
    db::{
        bootstrap::{self, BootstrapError},
        memory::MemoryStore,
    },
    middleware::{
        auth::{AuthState, auth_middleware},
        request_context::{self, RequestIdState},
    },
    routes::{self, openapi::openapi_routes},
    services::payment::{BkashGateway, GatewayError, PaymentGateway},
    tracer,
};

const CORS_MAX_AGE: Duration = Duration::from_secs(3600);

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to connect to the database: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error("failed to build the payment gateway client: {0}")]
    Gateway(#[from] GatewayError),
    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-wide Prometheus handle. Falls back to a detached recorder when a
/// global one is already installed.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|err| {
                    warn!(error = %err, "prometheus recorder already installed");
                    PrometheusBuilder::new().build_recorder().handle()
                })
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed; keeping the existing one");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool from the given database URL.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(&db.url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Builds the application state. `memory://` database URLs select the
/// in-process store; anything else connects to Postgres, applies the
/// bootstrap scripts and checks readiness first.
///
/// # Errors
/// Returns [`StartupError`] when the database or payment gateway cannot be set up.
pub async fn create_app_state(config: Arc<Config>) -> Result<Arc<AppState>, StartupError> {
    let gateway: Arc<dyn PaymentGateway> = Arc::new(BkashGateway::new(config.payments.clone())?);

    if config.db.is_memory() {
        warn!("using the in-memory store; all data is lost on shutdown");
        let stores = Stores::memory(Arc::new(MemoryStore::new()));
        return Ok(Arc::new(AppState::new(config, None, stores, gateway)));
    }

    let pool = create_database_pool(&config.db).await?;
    bootstrap::ensure_liveness(&pool).await?;
    bootstrap::run(&pool, &config.db).await?;
    bootstrap::ensure_readiness(&pool).await?;

    let stores = Stores::postgres(pool.clone());
    Ok(Arc::new(AppState::new(config, Some(pool), stores, gateway)))
}

/// CORS for the storefront. Credentialed requests need explicit origins and
/// headers, so an empty origin list disables credentials.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let cors_config = &config.server.cors;

    let mut headers = vec![
        header::ACCEPT,
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        HeaderName::from_static("last-event-id"),
    ];
    if let Ok(request_id) = HeaderName::from_str(&config.server.request_id_header) {
        headers.push(request_id);
    }

    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list(headers))
        .max_age(CORS_MAX_AGE);

    if cors_config.allowed_origins.is_empty() {
        return cors.allow_origin(AllowOrigin::any());
    }

    let origins = cors_config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    cors.allow_origin(AllowOrigin::list(origins))
        .allow_credentials(cors_config.allow_credentials)
}

/// Creates the main application router with all middleware and routes.
///
/// Layers run outside-in: CORS, request id, tracing, then session resolution.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let config = state.config();
    let cors = create_cors_layer(config);
    let request_id_state = RequestIdState::from_config(config);
    let auth_state = AuthState::from_config(config);

    Router::new()
        .nest("/api", routes::api::create_api_router())
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .merge(openapi_routes())
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
        .layer(tracer::create_trace_layer())
        .layer(middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .layer(Extension(metrics_handle))
        .layer(cors)
        .with_state(state)
}

/// Creates the graceful shutdown signal handler.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl-C handler; shutdown signal disabled");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

/// Starts the server and serves until Ctrl-C.
///
/// # Errors
/// Returns an error if the state cannot be built or the listener fails.
pub async fn run(config: Config) -> Result<(), StartupError> {
    initialize_tracing(&config);
    info!("Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);
    let state = create_app_state(config.clone()).await?;

    let hub = state.hub().clone();
    let sweeper = hub.spawn_presence_sweeper(Duration::from_secs(
        config.realtime.presence_sweep_seconds,
    ));

    let app = create_app_router(state, metrics_handle);
    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!(address = %listener.local_addr()?, "Listening");

    let shutdown_hub = hub.clone();
    serve(listener, app)
        .with_graceful_shutdown(async move {
            create_shutdown_signal().await;
            shutdown_hub.shutdown().await;
        })
        .await?;

    sweeper.abort();
    Ok(())
}
