use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Generate a webhook signature: base64(HMAC-SHA256(body, secret)).
pub fn generate_signature(secret: &str, body: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Verify a base64 webhook signature using constant-time comparison.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<bool, anyhow::Error> {
    let expected_signature = generate_signature(secret, body)?;

    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = signature.trim().as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}
