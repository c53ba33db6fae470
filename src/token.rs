//! Access token expiry decoding.
//!
//! Access tokens are JWT-shaped (`header.claims.signature`). Only the `exp`
//! claim is read; the signature is the server's business and is never
//! verified here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: Option<u64>,
}

/// Returns the instant encoded in the token's `exp` claim.
///
/// `None` when the token is not three dot-separated segments, the claims
/// segment is not base64url JSON, or `exp` is missing.
pub fn expires_at(token: &str) -> Option<SystemTime> {
    let mut segments = token.split('.');
    let (_header, claims, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    // Some issuers pad their segments even though JWT forbids it.
    let bytes = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('=')).ok()?;
    let claims: ExpiryClaims = serde_json::from_slice(&bytes).ok()?;
    UNIX_EPOCH.checked_add(Duration::from_secs(claims.exp?))
}

/// Whether `token` should be treated as expired at `now`.
///
/// No grace period is applied: a token is expired from the `exp` second
/// onwards. Undecodable tokens count as expired.
pub fn is_expired(token: &str, now: SystemTime) -> bool {
    match expires_at(token) {
        Some(expiry) => now >= expiry,
        None => true,
    }
}

#[cfg(test)]
pub(crate) fn encode_unsigned(exp: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"tester","exp":{exp}}}"#));
    format!("{header}.{claims}.signature")
}
