//! HMAC-SHA256 webhook signatures.
//!
//! The signature covers `{timestamp}.{body}`, where the timestamp is the
//! millisecond Unix time sent in [`TIMESTAMP_HEADER`]. Receivers recompute it
//! with the shared secret and reject requests whose timestamp is outside an
//! acceptable skew, which defeats replays of captured requests.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery";

/// Version tag prefixed to the hex digest.
pub const SIGNATURE_VERSION: &str = "v1";

/// Default skew accepted by [`verify`].
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5 * 60);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed timestamp")]
    MalformedTimestamp,
    #[error("timestamp outside tolerance")]
    Expired,
    #[error("unsupported signature version")]
    UnsupportedVersion,
    #[error("signature mismatch")]
    Mismatch,
}

/// Hex-encoded `HMAC-SHA256(secret, timestamp || "." || body)`.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// The [`SIGNATURE_HEADER`] value: `v1=<hex>`.
pub fn signature_header(secret: &str, timestamp: &str, body: &[u8]) -> String {
    format!("{SIGNATURE_VERSION}={}", sign(secret, timestamp, body))
}

/// Millisecond timestamp in the form sent in [`TIMESTAMP_HEADER`].
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

/// Check a received webhook.
///
/// `timestamp` and `signature` are the raw header values.
pub fn verify(
    secret: &str,
    timestamp: &str,
    signature: &str,
    body: &[u8],
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let millis: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::MalformedTimestamp)?;
    let sent_at = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or(SignatureError::MalformedTimestamp)?;

    let skew = (now - sent_at).abs().to_std().unwrap_or(Duration::MAX);
    if skew > tolerance {
        return Err(SignatureError::Expired);
    }

    let digest = signature
        .trim()
        .strip_prefix(SIGNATURE_VERSION)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or(SignatureError::UnsupportedVersion)?;

    let expected = sign(secret, timestamp.trim(), body);
    if bool::from(expected.as_bytes().ct_eq(digest.as_bytes())) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
