use super::*;

pub(super) async fn not_found() -> Response {
    let problem = ProblemDetails {
        type_: ErrorType::InvalidRequest.as_urn().to_string(),
        title: "Not Found".to_string(),
        status: 404,
        detail: Some("endpoint not found".to_string()),
        instance: None,
        extensions: serde_json::Map::new(),
    };

    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(problem),
    )
        .into_response()
}

pub(super) async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();
    if path == "/v1/health" || path == "/health" {
        return Ok(next.run(request).await);
    }

    let Some(expected) = state.auth.token.as_ref() else {
        return Ok(next.run(request).await);
    };

    if extract_token(request.headers()).as_deref() == Some(expected.as_str()) {
        return Ok(next.run(request).await);
    }

    tracing::debug!(path = %request.uri().path(), "rejecting request with missing or invalid token");
    Err(GatewayError::TokenInvalid {
        message: Some("missing or invalid token".to_string()),
    }
    .into())
}

/// Accepts `Bearer`, `Token` and `Basic` authorization; for `Basic` the
/// password (or the whole decoded value when there is no `:`) is the token.
pub(super) fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.to_string()),
        "basic" => {
            let engines = [
                base64::engine::general_purpose::STANDARD,
                base64::engine::general_purpose::STANDARD_NO_PAD,
                base64::engine::general_purpose::URL_SAFE,
                base64::engine::general_purpose::URL_SAFE_NO_PAD,
            ];
            engines.iter().find_map(|engine| {
                let decoded = String::from_utf8(engine.decode(rest).ok()?).ok()?;
                match decoded.split_once(':') {
                    Some((_, password)) => Some(password.to_string()),
                    None if !decoded.is_empty() => Some(decoded),
                    None => None,
                }
            })
        }
        _ => None,
    }
}

pub(super) fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let essence = value.split(';').next().unwrap_or_default().trim();
            essence.eq_ignore_ascii_case("application/json")
        })
        .unwrap_or(false)
}

/// Outward classification of a bridge failure. Engine-reported errors never
/// get here; they are answered as JSON-RPC error objects.
pub(super) fn map_bridge_error(err: BridgeError) -> GatewayError {
    match err {
        BridgeError::InvalidEnvelope(_)
        | BridgeError::DuplicateId(_)
        | BridgeError::Serialize(_) => GatewayError::InvalidRequest {
            message: err.to_string(),
        },
        BridgeError::CapacityExceeded { ceiling } => GatewayError::CapacityExceeded { ceiling },
        BridgeError::Timeout { method, timeout_ms } => GatewayError::Timeout { method, timeout_ms },
        BridgeError::ProcessExited {
            code,
            signal,
            stderr,
        } => GatewayError::ProcessExited {
            code,
            signal,
            stderr,
        },
        BridgeError::Shutdown => GatewayError::ShuttingDown,
        BridgeError::NotRunning
        | BridgeError::Spawn { .. }
        | BridgeError::MissingPipe(_)
        | BridgeError::Write(_)
        | BridgeError::HandshakeAborted
        | BridgeError::Protocol { .. } => GatewayError::EngineUnavailable {
            message: err.to_string(),
        },
    }
}

pub(super) fn notification_event(notification: &Notification) -> Event {
    let data = serde_json::to_string(&notification.to_jsonrpc()).unwrap_or_else(|_| "{}".into());
    Event::default()
        .event("notification")
        .id(notification.sequence.to_string())
        .data(data)
}
