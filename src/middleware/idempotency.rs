use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use super::{error_response, org_id};
use crate::error::RelayError;
use crate::idempotency::{Idempotency, IdempotencyDecision, StoredResponse};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Set on responses served from the idempotency store.
pub const REPLAYED_HEADER: &str = "Idempotent-Replayed";

/// Largest request or response body the middleware will buffer.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Deduplicate requests that carry an `Idempotency-Key` header.
///
/// ## Behavior
///
/// - No key: passes through
/// - Key seen with a stored response: the response is replayed with
///   `Idempotent-Replayed: true`
/// - Identical request still in progress: 409 Conflict
/// - Key reused with a different body: 422 Unprocessable Entity
/// - Otherwise the handler runs. Its response is stored unless it is a
///   server error, in which case the key is released for a retry.
///
/// Requests without an organization are scoped to the nil UUID.
pub async fn idempotency_middleware(
    State(idempotency): State<Idempotency>,
    request: Request,
    next: Next,
) -> Response {
    let key = match request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        Some(key) => key.to_string(),
        None => return next.run(request).await,
    };

    let org = org_id(&request).unwrap_or(Uuid::nil());
    let endpoint = format!("{} {}", request.method(), request.uri().path());

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request_body_unreadable",
                e.to_string(),
            )
        }
    };

    match idempotency.begin(org, &key, &endpoint, &body).await {
        Ok(IdempotencyDecision::Replay(stored)) => {
            tracing::debug!(
                target: "outbox_relay::http",
                org_id = %org,
                endpoint = %endpoint,
                status = stored.status,
                "Replaying stored response"
            );
            replay(stored)
        }
        Ok(IdempotencyDecision::Execute) => {
            let request = Request::from_parts(parts, Body::from(body));
            let response = next.run(request).await;
            store_response(&idempotency, org, &key, &endpoint, response).await
        }
        Err(RelayError::Conflict(message)) => {
            error_response(StatusCode::CONFLICT, "idempotency_conflict", message)
        }
        Err(RelayError::Validation(message)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, "idempotency_key_mismatch", message)
        }
        Err(e) => {
            tracing::error!(
                target: "outbox_relay::http",
                org_id = %org,
                endpoint = %endpoint,
                error = %e,
                "Idempotency check failed"
            );
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "idempotency_unavailable",
                "idempotency store unavailable",
            )
        }
    }
}

fn replay(stored: StoredResponse) -> Response {
    let StoredResponse { status, content_type, body } = stored;
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let headers = response.headers_mut();
    if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}

async fn store_response(
    idempotency: &Idempotency,
    org: Uuid,
    key: &str,
    endpoint: &str,
    response: Response,
) -> Response {
    let (parts, body) = response.into_parts();

    if parts.status.is_server_error() {
        release(idempotency, org, key, endpoint).await;
        return Response::from_parts(parts, body);
    }

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            // The response is gone; release the key so the client can retry.
            release(idempotency, org, key, endpoint).await;
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_body_unreadable",
                e.to_string(),
            );
        }
    };

    let mut stored = StoredResponse::new(parts.status.as_u16(), bytes.to_vec());
    if let Some(content_type) = parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        stored = stored.with_content_type(content_type);
    }
    if let Err(e) = idempotency.complete(org, key, endpoint, &stored).await {
        tracing::warn!(
            target: "outbox_relay::http",
            org_id = %org,
            endpoint = %endpoint,
            error = %e,
            "Failed to store idempotent response"
        );
    }

    Response::from_parts(parts, Body::from(bytes))
}

async fn release(idempotency: &Idempotency, org: Uuid, key: &str, endpoint: &str) {
    if let Err(e) = idempotency.abandon(org, key, endpoint).await {
        tracing::warn!(
            target: "outbox_relay::http",
            org_id = %org,
            endpoint = %endpoint,
            error = %e,
            "Failed to release idempotency key"
        );
    }
}
