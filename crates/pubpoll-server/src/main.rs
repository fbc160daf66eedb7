//! pubpoll Server - Pub/Sub Broker HTTP Server
//!
//! This is the main entry point for the pubpoll message broker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use clap::Parser;
use pubpoll_core::{
    init_logging, load_config_file, Broker, CachedChannelProvider, ConfigChannelProvider,
    LogFilterHandle, Overrides, ServerConfig,
};
use pubpoll_storage::new_storage;
use pubpoll_types::{
    jwt_exp_from_unix, ChannelId, ChannelProvider, Error, HumanDuration, JwtJti, Message,
    MessageId, RealSystemClock, SubscriberId, SubscriberLocator, SystemClock,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

/// Messages returned by one poll when `max` is omitted
const DEFAULT_POLL_MAX_MESSAGES: usize = 64;

// ==================== App State ====================

/// Shared application state
#[derive(Clone)]
struct AppState {
    broker: Arc<Broker>,
    log_filter: LogFilterHandle,
    admin_tokens: Arc<Vec<String>>,
    long_polling_max_timeout: Duration,
}

// ==================== Request/Response Types ====================

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    /// Health status
    status: String,
    /// Server version
    version: String,
}

/// Probe response
#[derive(Debug, Serialize, ToSchema)]
struct ProbeResponse {
    status: String,
    /// Per storage detail
    #[schema(value_type = Object)]
    detail: serde_json::Value,
}

/// Publish response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    channel_id: String,
    /// ID of the published message
    message_id: String,
}

/// Polling query parameters
#[derive(Debug, Deserialize, ToSchema)]
struct PollQuery {
    /// How long to wait for a message, e.g. `5s` (capped by `http.longPollingMaxTimeout`)
    timeout: Option<String>,
    /// Maximum number of messages to receive
    max: Option<usize>,
}

/// A delivered message
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    message_id: String,
    /// Message content, lossily decoded as UTF-8
    content: String,
}

impl From<Message> for MessageResponse {
    fn from(msg: Message) -> Self {
        Self {
            message_id: msg.message_id.to_string(),
            content: String::from_utf8_lossy(&msg.content).into_owned(),
        }
    }
}

/// Polling response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct PollResponse {
    channel_id: String,
    messages: Vec<MessageResponse>,
}

/// Revocation query parameters
#[derive(Debug, Deserialize, ToSchema)]
struct RevokeQuery {
    /// `jti` claim of the token
    jti: String,
    /// `exp` claim of the token (UNIX seconds)
    exp: i64,
}

/// Revocation lookup parameters
#[derive(Debug, Deserialize, ToSchema)]
struct JtiQuery {
    jti: String,
}

/// Revocation status
#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct RevocationResponse {
    jti: String,
    revoked: bool,
}

/// Log filter (`tracing_subscriber::EnvFilter` directives)
#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct LogFilterBody {
    filter: String,
}

/// API Error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct ApiErrorBody {
    /// Error message
    error: String,
    /// Error code
    code: String,
}

// ==================== Error Handling ====================

/// Wrapper for pubpoll errors to implement IntoResponse
struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::InvalidChannel(_) => (StatusCode::BAD_REQUEST, "INVALID_CHANNEL"),
            Error::InvalidId { .. } => (StatusCode::BAD_REQUEST, "INVALID_ID"),
            Error::InvalidParameter(_) => (StatusCode::BAD_REQUEST, "INVALID_PARAMETER"),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Error::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, "NOT_SUPPORTED"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        // Server side failures may carry backend detail; keep it in the logs only.
        let error = if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };

        let body = Json(ApiErrorBody {
            error,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

// ==================== OpenAPI Documentation ====================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "pubpoll API",
        version = "0.1.0",
        description = "pubpoll - Pub/Sub Broker with long polling",
        license(name = "MIT OR Apache-2.0"),
        contact(name = "pubpoll Contributors", url = "https://github.com/pubpoll/pubpoll")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(
        health,
        liveness,
        readiness,
        publish_message,
        publish_generated,
        poll_messages,
        revoke_jwt,
        jwt_status,
        get_log_filter,
        set_log_filter,
    ),
    components(
        schemas(
            HealthResponse,
            ProbeResponse,
            PublishResponse,
            PollQuery,
            MessageResponse,
            PollResponse,
            RevokeQuery,
            JtiQuery,
            RevocationResponse,
            LogFilterBody,
            ApiErrorBody,
        )
    ),
    tags(
        (name = "health", description = "Health check and probe endpoints"),
        (name = "channels", description = "Publish and long-polling endpoints"),
        (name = "admin", description = "Admin endpoints, require a bearer token")
    )
)]
struct ApiDoc;

// ==================== Handlers ====================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/probe/liveness",
    tag = "health",
    responses(
        (status = 200, description = "Storage is alive", body = ProbeResponse),
        (status = 500, description = "Storage is broken", body = ApiErrorBody)
    )
)]
async fn liveness(State(state): State<AppState>) -> Result<Json<ProbeResponse>, AppError> {
    let detail = state.broker.liveness().await?;
    Ok(Json(ProbeResponse {
        status: "ok".to_string(),
        detail,
    }))
}

/// Readiness probe
#[utoipa::path(
    get,
    path = "/probe/readiness",
    tag = "health",
    responses(
        (status = 200, description = "Storage is ready", body = ProbeResponse),
        (status = 500, description = "Storage is not ready", body = ApiErrorBody)
    )
)]
async fn readiness(State(state): State<AppState>) -> Result<Json<ProbeResponse>, AppError> {
    let detail = state.broker.readiness().await?;
    Ok(Json(ProbeResponse {
        status: "ok".to_string(),
        detail,
    }))
}

/// Publish a message under a caller supplied ID
///
/// Publishing the same ID twice delivers the message once.
#[utoipa::path(
    put,
    path = "/channel/{channel_id}/message/{message_id}",
    tag = "channels",
    params(
        ("channel_id" = String, Path, description = "Channel ID"),
        ("message_id" = String, Path, description = "Message ID")
    ),
    request_body(content = String, description = "Message content", content_type = "application/json"),
    responses(
        (status = 200, description = "Message published", body = PublishResponse),
        (status = 400, description = "Invalid channel or message ID", body = ApiErrorBody),
        (status = 501, description = "Storage has no pub/sub capability", body = ApiErrorBody)
    )
)]
async fn publish_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<PublishResponse>, AppError> {
    let channel_id = ChannelId::new(channel_id)?;
    let message_id = MessageId::new(message_id)?;

    state
        .broker
        .publish(channel_id.clone(), message_id.clone(), body)
        .await?;

    Ok(Json(PublishResponse {
        channel_id: channel_id.to_string(),
        message_id: message_id.to_string(),
    }))
}

/// Publish a message under a generated ID
#[utoipa::path(
    post,
    path = "/channel/{channel_id}/message",
    tag = "channels",
    params(
        ("channel_id" = String, Path, description = "Channel ID")
    ),
    request_body(content = String, description = "Message content", content_type = "application/json"),
    responses(
        (status = 201, description = "Message published", body = PublishResponse),
        (status = 400, description = "Invalid channel ID", body = ApiErrorBody),
        (status = 501, description = "Storage has no pub/sub capability", body = ApiErrorBody)
    )
)]
async fn publish_generated(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    let channel_id = ChannelId::new(channel_id)?;
    let message_id = state
        .broker
        .publish_generated(channel_id.clone(), body)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
        }),
    ))
}

/// Long-poll the pending messages of a subscriber
///
/// The subscriber is created by its first poll.
#[utoipa::path(
    get,
    path = "/channel/{channel_id}/subscription/polling/{subscriber_id}",
    tag = "channels",
    params(
        ("channel_id" = String, Path, description = "Channel ID"),
        ("subscriber_id" = String, Path, description = "Subscriber ID"),
        ("timeout" = Option<String>, Query, description = "Maximum wait, e.g. `5s`"),
        ("max" = Option<usize>, Query, description = "Maximum messages to receive")
    ),
    responses(
        (status = 200, description = "Messages received, possibly none", body = PollResponse),
        (status = 400, description = "Invalid parameter", body = ApiErrorBody),
        (status = 501, description = "Storage has no pub/sub capability", body = ApiErrorBody)
    )
)]
async fn poll_messages(
    State(state): State<AppState>,
    Path((channel_id, subscriber_id)): Path<(String, String)>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, AppError> {
    let locator = SubscriberLocator::new(
        ChannelId::new(channel_id)?,
        SubscriberId::new(subscriber_id)?,
    );
    let timeout = match query.timeout.as_deref() {
        Some(timeout) => timeout.parse::<HumanDuration>()?.as_duration(),
        None => state.long_polling_max_timeout,
    };
    let max_messages = query.max.unwrap_or(DEFAULT_POLL_MAX_MESSAGES);
    if max_messages == 0 {
        return Err(Error::InvalidParameter("max must be greater than zero".to_string()).into());
    }

    let messages = state
        .broker
        .poll(
            &locator,
            max_messages,
            timeout.min(state.long_polling_max_timeout),
        )
        .await?;

    Ok(Json(PollResponse {
        channel_id: locator.channel_id.to_string(),
        messages: messages.into_iter().map(Into::into).collect(),
    }))
}

/// Revoke a JWT until its expiry
#[utoipa::path(
    put,
    path = "/admin/jwt/revoke",
    tag = "admin",
    params(
        ("jti" = String, Query, description = "`jti` claim of the token"),
        ("exp" = i64, Query, description = "`exp` claim of the token (UNIX seconds)")
    ),
    responses(
        (status = 200, description = "Token revoked", body = RevocationResponse),
        (status = 401, description = "Missing or invalid admin token", body = ApiErrorBody),
        (status = 501, description = "Storage has no JWT capability", body = ApiErrorBody)
    )
)]
async fn revoke_jwt(
    State(state): State<AppState>,
    Query(query): Query<RevokeQuery>,
) -> Result<Json<RevocationResponse>, AppError> {
    let jti = JwtJti::new(query.jti)?;
    let exp = jwt_exp_from_unix(query.exp)?;
    state.broker.revoke_jwt(&jti, exp).await?;

    Ok(Json(RevocationResponse {
        jti: jti.to_string(),
        revoked: true,
    }))
}

/// Whether a JWT has been revoked
#[utoipa::path(
    get,
    path = "/admin/jwt/revoke",
    tag = "admin",
    params(
        ("jti" = String, Query, description = "`jti` claim of the token")
    ),
    responses(
        (status = 200, description = "Revocation status", body = RevocationResponse),
        (status = 401, description = "Missing or invalid admin token", body = ApiErrorBody),
        (status = 501, description = "Storage has no JWT capability", body = ApiErrorBody)
    )
)]
async fn jwt_status(
    State(state): State<AppState>,
    Query(query): Query<JtiQuery>,
) -> Result<Json<RevocationResponse>, AppError> {
    let jti = JwtJti::new(query.jti)?;
    let revoked = state.broker.is_jwt_revoked(&jti).await?;

    Ok(Json(RevocationResponse {
        jti: jti.to_string(),
        revoked,
    }))
}

/// Current log filter
#[utoipa::path(
    get,
    path = "/admin/logging/filter",
    tag = "admin",
    responses(
        (status = 200, description = "Active filter", body = LogFilterBody),
        (status = 401, description = "Missing or invalid admin token", body = ApiErrorBody)
    )
)]
async fn get_log_filter(State(state): State<AppState>) -> Json<LogFilterBody> {
    Json(LogFilterBody {
        filter: state.log_filter.current(),
    })
}

/// Replace the log filter
#[utoipa::path(
    put,
    path = "/admin/logging/filter",
    tag = "admin",
    request_body = LogFilterBody,
    responses(
        (status = 200, description = "Filter replaced", body = LogFilterBody),
        (status = 400, description = "Invalid filter", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid admin token", body = ApiErrorBody)
    )
)]
async fn set_log_filter(
    State(state): State<AppState>,
    Json(req): Json<LogFilterBody>,
) -> Result<Json<LogFilterBody>, AppError> {
    state.log_filter.set(&req.filter)?;
    info!(filter = %req.filter, "Log filter replaced");
    Ok(Json(LogFilterBody {
        filter: state.log_filter.current(),
    }))
}

// ==================== Middleware ====================

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}

/// Reject admin requests without a configured bearer token
async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if state.admin_tokens.is_empty() {
        return Err(Error::Unauthorized("admin API is disabled".to_string()).into());
    }
    let authorized = bearer_token(request.headers()).map_or(false, |token| {
        // Compare against every configured token without stopping at the first match
        state
            .admin_tokens
            .iter()
            .fold(false, |found, t| constant_time_eq(t.as_bytes(), token.as_bytes()) | found)
    });
    if !authorized {
        warn!(uri = %request.uri(), "Rejected admin request");
        return Err(Error::Unauthorized("invalid admin token".to_string()).into());
    }
    Ok(next.run(request).await)
}

// ==================== Router ====================

/// Build the router, mounting the API under `path_prefix` when it is not empty
fn create_router(state: AppState, path_prefix: &str) -> Router {
    let admin = Router::new()
        .route("/jwt/revoke", put(revoke_jwt).get(jwt_status))
        .route("/logging/filter", get(get_log_filter).put(set_log_filter))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let api = Router::new()
        // Health
        .route("/health", get(health))
        .route("/probe/liveness", get(liveness))
        .route("/probe/readiness", get(readiness))
        // Channels
        .route(
            "/channel/:channel_id/message/:message_id",
            put(publish_message),
        )
        .route("/channel/:channel_id/message", post(publish_generated))
        .route(
            "/channel/:channel_id/subscription/polling/:subscriber_id",
            get(poll_messages),
        )
        // Admin
        .nest("/admin", admin);
    let api = if path_prefix.is_empty() {
        api
    } else {
        Router::new().nest(path_prefix, api)
    };

    api
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ==================== Main ====================

/// pubpoll - Pub/Sub Broker with long polling
#[derive(Debug, Parser)]
#[command(name = "pubpoll", version, about)]
struct Cli {
    /// Configuration file, `-` reads standard input
    config: Option<PathBuf>,

    /// Override http.port configuration item
    #[arg(long)]
    port: Option<u16>,

    /// Override http.listen configuration item
    #[arg(long)]
    listen: Option<String>,

    /// Enable debug logs
    #[arg(long)]
    debug: bool,

    /// Dump loaded configuration to stderr
    #[arg(long)]
    dump_config: bool,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = Overrides {
        port: cli.port,
        listen: cli.listen.clone(),
        debug: cli.debug,
    };

    let config: ServerConfig = load_config_file(cli.config.as_deref(), &overrides)?;
    if cli.dump_config {
        config.dump_config(std::io::stderr())?;
    }

    // Initialize logging
    let log_filter = init_logging(&config.logging)?;

    let clock: Arc<dyn SystemClock> = Arc::new(RealSystemClock);
    let channels: Arc<dyn ChannelProvider> = Arc::new(CachedChannelProvider::new(
        Arc::new(ConfigChannelProvider::new(&config.channels)?),
        Arc::clone(&clock),
    ));
    let storage = new_storage(&config.storages, clock, Arc::clone(&channels))?;
    let broker = Arc::new(Broker::new(storage, channels));

    info!(
        required = broker.file_descriptor_pressure(),
        "Open file limit required by channels and storages"
    );

    // Create app state
    let state = AppState {
        broker: Arc::clone(&broker),
        log_filter,
        admin_tokens: Arc::new(config.admin.auth.bearer_tokens.clone()),
        long_polling_max_timeout: config.http.long_polling_max_timeout.as_duration(),
    };
    if state.admin_tokens.is_empty() {
        warn!("No admin bearer token configured, admin API is disabled");
    }

    // Create router
    let app = create_router(state, &config.http.path_prefix);

    // Start server
    let listener =
        tokio::net::TcpListener::bind((config.http.listen.as_str(), config.http.port)).await?;
    let addr = listener.local_addr()?;

    info!("pubpoll server listening on {}{}", addr, config.http.path_prefix);
    info!("Swagger UI: http://{}/swagger-ui/", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = broker.shutdown().await {
        warn!(error = %e, "Storage did not shut down cleanly");
    }
    info!("Server closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use pubpoll_core::ChannelConfig;
    use pubpoll_storage::{OnmemoryStorageConfig, StorageConfig, StoragesConfig};
    use pubpoll_types::{ManualClock, StorageId};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::layer::SubscriberExt;

    const ADMIN_TOKEN: &str = "admin-secret";

    struct TestApp {
        router: Router,
        _guard: DefaultGuard,
    }

    fn test_app_at(storages: StoragesConfig, tokens: &[&str], path_prefix: &str) -> TestApp {
        let clock: Arc<dyn SystemClock> = Arc::new(ManualClock::starting_now());
        let channels: Arc<dyn ChannelProvider> = Arc::new(
            ConfigChannelProvider::new(&[ChannelConfig {
                regex: "room-.+".to_string(),
                expire: HumanDuration::from_secs(60),
                jwt: None,
            }])
            .unwrap(),
        );
        let storage = new_storage(&storages, clock, Arc::clone(&channels)).unwrap();
        let (layer, log_filter) = LogFilterHandle::new("pubpoll=info").unwrap();
        let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

        let state = AppState {
            broker: Arc::new(Broker::new(storage, channels)),
            log_filter,
            admin_tokens: Arc::new(tokens.iter().map(|t| t.to_string()).collect()),
            long_polling_max_timeout: Duration::from_secs(1),
        };
        TestApp {
            router: create_router(state, path_prefix),
            _guard: guard,
        }
    }

    fn test_app_with(storages: StoragesConfig, tokens: &[&str]) -> TestApp {
        test_app_at(storages, tokens, "")
    }

    fn test_app() -> TestApp {
        test_app_with(StoragesConfig::new(), &[ADMIN_TOKEN])
    }

    async fn send(app: &TestApp, request: HttpRequest<Body>) -> (StatusCode, Bytes) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    fn json<T: DeserializeOwned>(body: &Bytes) -> T {
        serde_json::from_slice(body).unwrap()
    }

    fn request(method: &str, uri: &str, body: impl Into<Body>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    fn admin_request(method: &str, uri: &str, token: &str, body: impl Into<Body>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_probes() {
        let app = test_app();

        let (status, body) = send(&app, request("GET", "/health", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("healthy"));

        let (status, _) = send(&app, request("GET", "/probe/liveness", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, request("GET", "/probe/readiness", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_publish_and_poll() {
        let app = test_app();

        let (status, body) = send(
            &app,
            request("PUT", "/channel/room-1/message/m1", r#"{"hello":"world"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let published: PublishResponse = json(&body);
        assert_eq!(published.message_id, "m1");

        let (status, body) = send(&app, request("POST", "/channel/room-1/message", "second")).await;
        assert_eq!(status, StatusCode::CREATED);
        let generated: PublishResponse = json(&body);

        let (status, body) = send(
            &app,
            request(
                "GET",
                "/channel/room-1/subscription/polling/s1?timeout=0&max=10",
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let polled: PollResponse = json(&body);
        assert_eq!(polled.channel_id, "room-1");
        assert_eq!(polled.messages.len(), 2);
        assert_eq!(polled.messages[0].message_id, "m1");
        assert_eq!(polled.messages[0].content, r#"{"hello":"world"}"#);
        assert_eq!(polled.messages[1].message_id, generated.message_id);
        assert_eq!(polled.messages[1].content, "second");
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let app = test_app();
        let (status, body) = send(
            &app,
            request(
                "GET",
                "/channel/room-1/subscription/polling/s1?timeout=50ms",
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let polled: PollResponse = json(&body);
        assert!(polled.messages.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let app = test_app();

        let (status, body) = send(&app, request("PUT", "/channel/lobby/message/m1", "x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json::<ApiErrorBody>(&body).code, "INVALID_CHANNEL");

        let (status, body) = send(&app, request("PUT", "/channel/room!1/message/m1", "x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json::<ApiErrorBody>(&body).code, "INVALID_ID");

        let (status, body) = send(
            &app,
            request(
                "GET",
                "/channel/room-1/subscription/polling/s1?timeout=soon",
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json::<ApiErrorBody>(&body).code, "INVALID_PARAMETER");
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let app = test_app();
        let (status, _) = send(&app, request("GET", "/admin/logging/filter", Body::empty())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            admin_request("GET", "/admin/logging/filter", "wrong", Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let disabled = test_app_with(StoragesConfig::new(), &[]);
        let (status, body) = send(
            &disabled,
            admin_request("GET", "/admin/logging/filter", ADMIN_TOKEN, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json::<ApiErrorBody>(&body).code, "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_any_configured_admin_token_is_accepted() {
        let app = test_app_with(StoragesConfig::new(), &["first-token", ADMIN_TOKEN]);
        for token in ["first-token", ADMIN_TOKEN] {
            let (status, _) = send(
                &app,
                admin_request("GET", "/admin/logging/filter", token, Body::empty()),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        // Same length as a valid token, one byte off
        let (status, _) = send(
            &app,
            admin_request("GET", "/admin/logging/filter", "admin-secreT", Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokeN"));
        assert!(!constant_time_eq(b"token", b"token-longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn test_path_prefix() {
        let app = test_app_at(StoragesConfig::new(), &[ADMIN_TOKEN], "/foo/bar");

        let (status, _) = send(&app, request("GET", "/foo/bar/probe/liveness", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, request("GET", "/foo/bar/probe/readiness", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            request("PUT", "/foo/bar/channel/room-1/message/m1", "hello"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            &app,
            admin_request("GET", "/foo/bar/admin/logging/filter", ADMIN_TOKEN, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Nothing is served outside the prefix
        let (status, _) = send(&app, request("GET", "/probe/liveness", Body::empty())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_jwt_revocation() {
        let app = test_app();

        let (status, body) = send(
            &app,
            admin_request("GET", "/admin/jwt/revoke?jti=tok-1", ADMIN_TOKEN, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!json::<RevocationResponse>(&body).revoked);

        let exp = exp_in_one_hour();
        let (status, _) = send(
            &app,
            admin_request(
                "PUT",
                &format!("/admin/jwt/revoke?jti=tok-1&exp={}", exp),
                ADMIN_TOKEN,
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(
            &app,
            admin_request("GET", "/admin/jwt/revoke?jti=tok-1", ADMIN_TOKEN, Body::empty()),
        )
        .await;
        let status: RevocationResponse = json(&body);
        assert_eq!(status.jti, "tok-1");
        assert!(status.revoked);
    }

    /// One hour from now, in UNIX seconds
    fn exp_in_one_hour() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600
    }

    #[tokio::test]
    async fn test_log_filter() {
        let app = test_app();

        let (status, body) = send(
            &app,
            admin_request("GET", "/admin/logging/filter", ADMIN_TOKEN, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json::<LogFilterBody>(&body).filter, "pubpoll=info");

        let (status, body) = send(
            &app,
            admin_request(
                "PUT",
                "/admin/logging/filter",
                ADMIN_TOKEN,
                r#"{"filter":"pubpoll=debug"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json::<LogFilterBody>(&body).filter, "pubpoll=debug");

        let (status, body) = send(
            &app,
            admin_request(
                "PUT",
                "/admin/logging/filter",
                ADMIN_TOKEN,
                r#"{"filter":"pubpoll=nope"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json::<ApiErrorBody>(&body).code, "INVALID_PARAMETER");
    }

    #[tokio::test]
    async fn test_missing_capability_is_not_implemented() {
        let mut storages = StoragesConfig::new();
        storages.insert(
            StorageId::new("jwt-only"),
            StorageConfig::onmemory(OnmemoryStorageConfig {
                disable_pub_sub: true,
                ..Default::default()
            }),
        );
        let app = test_app_with(storages, &[ADMIN_TOKEN]);

        let (status, body) = send(&app, request("PUT", "/channel/room-1/message/m1", "x")).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(json::<ApiErrorBody>(&body).code, "NOT_SUPPORTED");
    }

    #[tokio::test]
    async fn test_internal_errors_are_opaque() {
        let response = AppError(Error::Storage("redis at 10.0.0.1 refused".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ApiErrorBody = json(&body);
        assert_eq!(body.error, "internal server error");
        assert_eq!(body.code, "INTERNAL_ERROR");
    }

    #[test]
    fn test_cli() {
        let cli = Cli::try_parse_from(["pubpoll", "config.yaml", "--port", "8080", "--debug"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("config.yaml")));
        assert_eq!(cli.port, Some(8080));
        assert!(cli.debug);
        assert!(!cli.dump_config);
    }
}
