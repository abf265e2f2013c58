//! `Stripe-Signature` header verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The
//! signed payload is `"{t}.{raw body}"`, keyed with the endpoint secret.

use chrono::{DateTime, Utc};

use crate::crypto::{constant_time_eq, hmac_sha256_hex};

/// Maximum age (and future skew) of a signed timestamp, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Why a signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The header has no `t=` element or it is not an integer.
    #[error("missing or invalid timestamp")]
    MissingTimestamp,

    /// The header has no `v1=` element.
    #[error("no v1 signature")]
    MissingSignature,

    /// The timestamp is outside the tolerance window.
    #[error("timestamp outside tolerance")]
    Expired,

    /// No `v1` signature matches.
    #[error("signature mismatch")]
    Mismatch,
}

/// Verify `header` against the raw `payload` at time `now`.
///
/// # Errors
///
/// Returns a [`SignatureError`] describing the first check that failed.
pub fn verify(
    payload: &str,
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", ts)) => timestamp = Some(ts),
            Some(("v1", sig)) => signatures.push(sig),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    let signed_at: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::MissingTimestamp)?;

    if signatures.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    if (now.timestamp() - signed_at).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Expired);
    }

    let expected = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"))
        .ok_or(SignatureError::Mismatch)?;

    if signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Build a `Stripe-Signature` header value for `payload` signed at `timestamp`.
#[must_use]
pub fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
    let signature =
        hmac_sha256_hex(secret, &format!("{timestamp}.{payload}")).unwrap_or_default();
    format!("t={timestamp},v1={signature}")
}
