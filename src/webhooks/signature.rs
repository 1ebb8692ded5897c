//! Webhook signature verification using HMAC-SHA256.
//!
//! The code host signs webhook payloads using HMAC-SHA256 with a shared
//! secret and provides the signature in the `X-Hub-Signature-256` header as
//! `sha256=<hex>`. Verification is the first step in webhook processing;
//! invalid signatures are rejected before any parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parses a signature header (e.g., "sha256=abc123...") into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex, etc.).
/// Never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
///
/// This is useful for testing purposes (generating expected signatures).
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a header value in the `sha256=<hex>` format.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a webhook signature against the raw payload bytes and secret.
///
/// Returns `true` if the signature is valid, `false` otherwise.
/// Uses constant-time comparison to prevent timing attacks.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let expected_signature = match parse_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // Constant-time comparison via the HMAC library
    mac.verify_slice(&expected_signature).is_ok()
}
