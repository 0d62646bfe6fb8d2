//! axum middleware for the idempotency and rate-limit primitives.
//! Requires the `http` feature.
//!
//! ```rust,ignore
//! use axum::{middleware, routing::post, Router};
//! use outbox_relay::middleware::{idempotency_middleware, rate_limit_middleware, RateLimitPolicy};
//!
//! let app = Router::new()
//!     .route("/tasks", post(create_task))
//!     .layer(middleware::from_fn_with_state(idempotency, idempotency_middleware))
//!     .layer(middleware::from_fn_with_state(policy, rate_limit_middleware));
//! ```

mod idempotency;
mod rate_limit;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

pub use idempotency::{idempotency_middleware, IDEMPOTENCY_KEY_HEADER, REPLAYED_HEADER};
pub use rate_limit::{rate_limit_middleware, RateLimitPolicy};

/// Header consulted for the organization when no [`OrgId`] extension is set.
pub const ORG_ID_HEADER: &str = "X-Org-Id";

/// Organization of the authenticated caller.
///
/// Authentication middleware inserts it as a request extension; the
/// middlewares here fall back to [`ORG_ID_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrgId(pub Uuid);

pub(crate) fn org_id(request: &Request) -> Option<Uuid> {
    if let Some(OrgId(id)) = request.extensions().get::<OrgId>() {
        return Some(*id);
    }
    request
        .headers()
        .get(ORG_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
}

pub(crate) fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    let body = serde_json::json!({
        "error": error,
        "message": message.into(),
    });
    (status, Json(body)).into_response()
}
