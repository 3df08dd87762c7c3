//! Anti-replay HMAC authentication for dispatch requests.
//!
//! A request carries `X-Dispatch-Timestamp` (unix seconds),
//! `X-Dispatch-Nonce` and `X-Dispatch-Signature`, the hex HMAC-SHA256 of
//! `timestamp.nonce.body` under the shared dispatch secret. Checks run in
//! order and the nonce is recorded only after the signature verified; the
//! whole sequence holds the nonce-cache lock so two copies of one request
//! cannot both pass.

use std::sync::Mutex;

use axum::http::HeaderMap;
use taskd_common::signature::{self, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use thiserror::Error;

use crate::nonce_cache::NonceCache;

pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("timestamp is not a unix time in seconds")]
    InvalidTimestamp,
    #[error("timestamp outside the accepted window ({skew}s skew)")]
    StaleTimestamp { skew: i64 },
    #[error("nonce already used")]
    ReplayedNonce,
    #[error("signature mismatch")]
    BadSignature,
    #[error("nonce cache unavailable")]
    Unavailable,
}

pub struct DispatchAuthenticator {
    secret: String,
    max_skew_secs: i64,
    nonces: Mutex<NonceCache>,
}

impl DispatchAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self::with_cache(secret, NonceCache::default())
    }

    pub fn with_cache(secret: impl Into<String>, cache: NonceCache) -> Self {
        Self {
            secret: secret.into(),
            max_skew_secs: MAX_CLOCK_SKEW_SECS,
            nonces: Mutex::new(cache),
        }
    }

    pub fn verify(&self, headers: &HeaderMap, body: &[u8], now: i64) -> Result<(), AuthError> {
        let raw_ts = header(headers, TIMESTAMP_HEADER)?;
        let nonce = header(headers, NONCE_HEADER)?;
        let provided = header(headers, SIGNATURE_HEADER)?;

        let timestamp: i64 = raw_ts.parse().map_err(|_| AuthError::InvalidTimestamp)?;
        let skew = (now - timestamp).abs();
        if skew > self.max_skew_secs {
            return Err(AuthError::StaleTimestamp { skew });
        }

        let mut nonces = self.nonces.lock().map_err(|_| AuthError::Unavailable)?;
        if nonces.contains(nonce) {
            return Err(AuthError::ReplayedNonce);
        }
        if !signature::verify(&self.secret, raw_ts, nonce, body, provided) {
            return Err(AuthError::BadSignature);
        }
        nonces.insert(nonce.to_string(), timestamp, now);
        Ok(())
    }

    pub fn seen_nonces(&self) -> usize {
        self.nonces.lock().map(|n| n.len()).unwrap_or_default()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, AuthError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MissingHeader(name))
}
