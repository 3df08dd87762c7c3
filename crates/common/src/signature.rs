//! HMAC-SHA256 signatures over `timestamp.nonce.body`, shared by inbound
//! dispatch authentication and outbound webhook delivery.

use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-dispatch-timestamp";
pub const NONCE_HEADER: &str = "x-dispatch-nonce";
pub const SIGNATURE_HEADER: &str = "x-dispatch-signature";

fn mac_for(secret: &str, timestamp: &str, nonce: &str, body: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(nonce.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Lowercase hex signature.
pub fn sign(secret: &str, timestamp: &str, nonce: &str, body: &[u8]) -> Result<String> {
    let mac = mac_for(secret, timestamp, nonce, body)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison against a hex signature. Malformed hex never
/// verifies.
pub fn verify(secret: &str, timestamp: &str, nonce: &str, body: &[u8], signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    match mac_for(secret, timestamp, nonce, body) {
        Ok(mac) => mac.verify_slice(&provided).is_ok(),
        Err(_) => false,
    }
}

/// The three header values for a freshly signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl SignedHeaders {
    pub fn new(secret: &str, timestamp: i64, body: &[u8]) -> Result<Self> {
        let timestamp = timestamp.to_string();
        let nonce = uuid::Uuid::new_v4().to_string();
        let signature = sign(secret, &timestamp, &nonce, body)?;
        Ok(Self {
            timestamp,
            nonce,
            signature,
        })
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        vec![
            (TIMESTAMP_HEADER.to_string(), self.timestamp.clone()),
            (NONCE_HEADER.to_string(), self.nonce.clone()),
            (SIGNATURE_HEADER.to_string(), self.signature.clone()),
        ]
    }
}
