use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::org_id;
use crate::clock::{Clock, SystemClock};
use crate::rate_limit::{RateLimitDecision, RateLimiter};

const LIMIT_HEADER: &str = "X-RateLimit-Limit";
const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
const RESET_HEADER: &str = "X-RateLimit-Reset";

/// Limiter plus the budget applied to every caller.
#[derive(Clone)]
pub struct RateLimitPolicy {
    limiter: Arc<dyn RateLimiter>,
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimitPolicy {
    pub fn new(limiter: Arc<dyn RateLimiter>, limit: u32, window: Duration) -> Self {
        Self {
            limiter,
            limit,
            window,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Serialize)]
struct RateLimitExceeded {
    error: &'static str,
    reset_at: String,
}

/// Count the request against its organization (or `anonymous`).
///
/// Every response carries `X-RateLimit-*` headers. Requests over the limit
/// get 429 with `Retry-After`. If the limiter itself fails the request is let
/// through.
pub async fn rate_limit_middleware(
    State(policy): State<RateLimitPolicy>,
    request: Request,
    next: Next,
) -> Response {
    let key = org_id(&request)
        .map(|id| id.to_string())
        .unwrap_or_else(|| "anonymous".to_string());

    let decision = match policy.limiter.allow(&key, policy.limit, policy.window).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(
                target: "outbox_relay::http",
                key = %key,
                error = %e,
                "Rate limiter unavailable"
            );
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        tracing::warn!(
            target: "outbox_relay::http",
            key = %key,
            count = decision.count,
            limit = decision.limit,
            "Request rejected: rate limit exceeded"
        );
        let retry_after = decision.retry_after(policy.clock.now()).as_secs().max(1);
        let body = RateLimitExceeded {
            error: "rate_limit_exceeded",
            reset_at: decision.reset_at.to_rfc3339(),
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        set_limit_headers(headers, &decision);
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let mut response = next.run(request).await;
    set_limit_headers(response.headers_mut(), &decision);
    response
}

fn set_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_at.timestamp()));
}
