use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use engine_bridge_error::{ErrorType, GatewayError, ProblemDetails};
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stdio_bridge::config::bool_from_env;
use stdio_bridge::{BridgeError, Gateway, GatewayStatus, HandshakeState, Notification};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

mod support;
mod types;

use self::support::*;
pub use self::types::*;

pub const ENV_LOG_HTTP: &str = "ENGINE_BRIDGE_LOG_HTTP";
pub const ENV_LOG_HTTP_HEADERS: &str = "ENGINE_BRIDGE_LOG_HTTP_HEADERS";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    gateway: Gateway,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(auth: AuthConfig, gateway: Gateway) -> Self {
        Self {
            auth,
            gateway,
            started_at: Utc::now(),
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/rpc", post(post_rpc))
        .route("/events", get(get_events))
        .route("/engine/restart", post(post_engine_restart))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    if bool_from_env(ENV_LOG_HTTP) != Some(false) {
        let include_headers = std::env::var(ENV_LOG_HTTP_HEADERS).is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let mut headers = Vec::new();
                    for (name, value) in req.headers().iter() {
                        let display_value = if *name == header::AUTHORIZATION {
                            "<redacted>".to_string()
                        } else {
                            value.to_str().unwrap_or("<binary>").to_string()
                        };
                        headers.push((name.as_str().to_string(), display_value));
                    }
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                }
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Stops the engine; in-flight HTTP calls fail with `process_exited`.
pub async fn shutdown_bridge(state: &Arc<AppState>) {
    state.gateway.bridge().shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_status,
        post_rpc,
        get_events,
        post_engine_restart,
        get_openapi
    ),
    components(
        schemas(
            HealthResponse,
            StatusResponse,
            RpcEnvelope,
            RpcResponse,
            RpcErrorObject,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "rpc", description = "JSON-RPC access to the engine"),
        (name = "engine", description = "Engine process control")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<BridgeError> for ApiError {
    fn from(value: BridgeError) -> Self {
        Self::Gateway(map_bridge_error(value))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Gateway(err) = &self;
        let problem = err.to_problem_details();
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(problem),
        )
            .into_response();
        if err.error_type() == ErrorType::CapacityExceeded {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

#[utoipa::path(
    get,
    path = "/v1/status",
    responses(
        (status = 200, body = StatusResponse),
        (status = 401, body = ProblemDetails)
    ),
    tag = "meta"
)]
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse::new(
        state.gateway.status().await,
        state.started_at,
    ))
}

#[utoipa::path(
    post,
    path = "/v1/rpc",
    request_body = RpcEnvelope,
    responses(
        (status = 200, description = "Engine response to a request", body = RpcResponse),
        (status = 202, description = "Notification or client response forwarded"),
        (status = 400, body = ProblemDetails),
        (status = 415, body = ProblemDetails),
        (status = 502, body = ProblemDetails),
        (status = 503, body = ProblemDetails),
        (status = 504, body = ProblemDetails)
    ),
    tag = "rpc"
)]
async fn post_rpc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !is_json_content_type(&headers) {
        return Err(GatewayError::UnsupportedMediaType {
            message: "content-type must be application/json".to_string(),
        }
        .into());
    }

    let raw: Value = serde_json::from_slice(&body).map_err(|err| GatewayError::InvalidRequest {
        message: format!("request body is not valid json: {err}"),
    })?;
    let envelope: RpcEnvelope =
        serde_json::from_value(raw.clone()).map_err(|err| GatewayError::InvalidRequest {
            message: format!("request body is not a json-rpc message: {err}"),
        })?;
    let id = envelope.id.filter(|id| !id.is_null());
    if matches!(&id, Some(id) if !(id.is_string() || id.is_number())) {
        return Err(GatewayError::InvalidRequest {
            message: "id must be a string or a number".to_string(),
        }
        .into());
    }

    match (envelope.method, id) {
        (Some(method), Some(id)) => {
            tracing::debug!(method = %method, "rpc: forwarding request");
            let params = envelope.params.unwrap_or(Value::Null);
            match state.gateway.call(&method, params).await {
                Ok(result) => Ok(Json(RpcResponse::result(id, result)).into_response()),
                Err(BridgeError::Protocol {
                    code,
                    message,
                    data,
                }) => Ok(Json(RpcResponse::error(
                    id,
                    RpcErrorObject {
                        code,
                        message,
                        data,
                    },
                ))
                .into_response()),
                Err(err) => Err(err.into()),
            }
        }
        (Some(method), None) => {
            tracing::debug!(method = %method, "rpc: forwarding notification");
            state
                .gateway
                .notify(&method, envelope.params.unwrap_or(Value::Null))
                .await?;
            Ok(StatusCode::ACCEPTED.into_response())
        }
        (None, Some(_)) if envelope.result.is_some() || envelope.error.is_some() => {
            state.gateway.send_raw(raw).await?;
            Ok(StatusCode::ACCEPTED.into_response())
        }
        _ => Err(GatewayError::InvalidRequest {
            message: "message needs a method, or an id with a result or error".to_string(),
        }
        .into()),
    }
}

#[utoipa::path(
    get,
    path = "/v1/events",
    responses((status = 200, description = "SSE stream of engine notifications")),
    tag = "rpc"
)]
async fn get_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.gateway.bridge().subscribe();
    tracing::debug!(subscriber = %subscription.id(), "events: stream opened");
    let stream = subscription
        .map(|notification| Ok::<Event, Infallible>(notification_event(&notification)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

#[utoipa::path(
    post,
    path = "/v1/engine/restart",
    responses(
        (status = 204, description = "Engine process stopped; the next call starts a new one"),
        (status = 401, body = ProblemDetails)
    ),
    tag = "engine"
)]
async fn post_engine_restart(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.gateway.bridge().restart().await {
        Some(exit) => tracing::info!(code = exit.code, signal = exit.signal, "engine restarted"),
        None => tracing::info!("restart requested with no engine running"),
    }
    StatusCode::NO_CONTENT
}

#[utoipa::path(
    get,
    path = "/v1/openapi.json",
    responses((status = 200, description = "OpenAPI document")),
    tag = "meta"
)]
async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
