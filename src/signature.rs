use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Serialize a value to the byte string that gets signed and sent.
///
/// Field order follows the struct definition, so the same payload always
/// produces the same bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// HMAC-SHA256 of `body` keyed with `secret`, hex-encoded.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature over the exact raw body.
/// Accepts a bare hex digest or a GitHub-style "sha256=<hex>" value.
pub fn verify(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let provided = signature_header
        .strip_prefix("sha256=")
        .unwrap_or(signature_header)
        .trim()
        .to_ascii_lowercase();

    let computed = sign(secret, body);
    computed.as_bytes().ct_eq(provided.as_bytes()).into()
}
