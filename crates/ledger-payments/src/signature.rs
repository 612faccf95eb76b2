//! Webhook Signature Verification
//!
//! Stripe-compatible scheme: the `Stripe-Signature` header carries
//! `t=<unix seconds>` and one or more `v1=<hex>` values, where each `v1` is
//! HMAC-SHA256 over `"<t>.<raw body>"` keyed with the endpoint secret.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Verify `header` against `payload`.
///
/// Fails if no `v1` signature matches or the timestamp is further than
/// `tolerance` from `now` in either direction.
pub fn verify(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| PaymentError::InvalidSignature("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(PaymentError::InvalidSignature("missing v1 signature".into()));
    }

    let age = now.timestamp().abs_diff(timestamp);
    if age > tolerance.as_secs() {
        return Err(PaymentError::InvalidSignature(format!(
            "timestamp outside tolerance ({age}s)"
        )));
    }

    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    });

    if matched {
        Ok(())
    } else {
        Err(PaymentError::InvalidSignature("no matching signature".into()))
    }
}

/// Build a signature header for `payload`, as the gateway would.
///
/// Used for local development tooling and tests.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::Config(format!("Invalid webhook secret: {e}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const TOLERANCE: Duration = Duration::from_secs(300);

    #[test]
    fn test_valid_signature() {
        let now = Utc::now();
        let header = sign(b"{}", SECRET, now.timestamp()).unwrap();
        assert!(verify(b"{}", &header, SECRET, TOLERANCE, now).is_ok());
    }

    #[test]
    fn test_tampered_payload() {
        let now = Utc::now();
        let header = sign(b"{\"amount\":1}", SECRET, now.timestamp()).unwrap();
        let err = verify(b"{\"amount\":9}", &header, SECRET, TOLERANCE, now).unwrap_err();
        assert!(matches!(err, PaymentError::InvalidSignature(_)));
    }

    #[test]
    fn test_wrong_secret() {
        let now = Utc::now();
        let header = sign(b"{}", "whsec_other", now.timestamp()).unwrap();
        assert!(verify(b"{}", &header, SECRET, TOLERANCE, now).is_err());
    }

    #[test]
    fn test_stale_timestamp() {
        let now = Utc::now();
        let header = sign(b"{}", SECRET, now.timestamp() - 301).unwrap();
        assert!(verify(b"{}", &header, SECRET, TOLERANCE, now).is_err());
    }

    #[test]
    fn test_any_v1_may_match() {
        let now = Utc::now();
        let good = sign(b"{}", SECRET, now.timestamp()).unwrap();
        let v1 = good.split_once(",v1=").unwrap().1;
        let header = format!("t={},v1=deadbeef,v1={v1}", now.timestamp());
        assert!(verify(b"{}", &header, SECRET, TOLERANCE, now).is_ok());
    }

    #[test]
    fn test_malformed_header() {
        let now = Utc::now();
        assert!(verify(b"{}", "garbage", SECRET, TOLERANCE, now).is_err());
        assert!(verify(b"{}", "t=123", SECRET, TOLERANCE, now).is_err());
    }
}
