//! HMAC signing for webhook payloads
//!
//! Merchants verify webhook authenticity against the shared secret using
//! the hex signature carried in the `X-DhanSetu-Signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a payload body, returning the hex-encoded HMAC-SHA256 digest.
pub fn sign_payload(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature against a payload body in constant time.
pub fn verify_signature(body: &[u8], signature_hex: &str, secret: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}
