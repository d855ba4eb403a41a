//! # Webhook Signature Verification
//!
//! HMAC-SHA256 and shared-token checks for the POS providers' webhook deliveries.
//! All comparisons are constant time.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Missing webhook signature")]
    MissingSignature,

    #[error("Invalid signature format")]
    InvalidSignatureFormat,

    #[error("Webhook secret is empty")]
    MissingSecret,

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

fn mac_over(secret: &str, parts: &[&[u8]]) -> VerificationResult<HmacSha256> {
    if secret.is_empty() {
        return Err(VerificationError::MissingSecret);
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// Base64 HMAC-SHA256 of the concatenated parts.
pub fn sign_base64(secret: &str, parts: &[&[u8]]) -> VerificationResult<String> {
    let mac = mac_over(secret, parts)?;
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Verify a base64 HMAC-SHA256 signature over the concatenated parts.
pub fn verify_base64_hmac(
    parts: &[&[u8]],
    signature: &str,
    secret: &str,
) -> VerificationResult<()> {
    let signature = signature.trim();
    if signature.is_empty() {
        return Err(VerificationError::MissingSignature);
    }

    let provided = STANDARD
        .decode(signature)
        .map_err(|_| VerificationError::InvalidSignatureFormat)?;
    let expected = mac_over(secret, parts)?.finalize().into_bytes();

    if expected.as_slice().ct_eq(&provided).into() {
        Ok(())
    } else {
        debug!("Webhook HMAC mismatch");
        Err(VerificationError::VerificationFailed)
    }
}

/// Square signs `notification_url || body` with the subscription's signature key.
pub fn verify_square_signature(
    body: &[u8],
    signature: &str,
    secret: &str,
    notification_url: &str,
) -> VerificationResult<()> {
    verify_base64_hmac(&[notification_url.as_bytes(), body], signature, secret)
}

/// Shopify signs the raw body with the app's API secret.
pub fn verify_shopify_signature(body: &[u8], signature: &str, secret: &str) -> VerificationResult<()> {
    verify_base64_hmac(&[body], signature, secret)
}

/// Clover echoes the app's auth code verbatim.
pub fn verify_shared_token(provided: &str, expected: &str) -> VerificationResult<()> {
    let provided = provided.trim();
    if provided.is_empty() {
        return Err(VerificationError::MissingSignature);
    }
    if expected.is_empty() {
        return Err(VerificationError::MissingSecret);
    }
    if provided.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Random 256-bit secret for subscriptions whose provider does not issue one.
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
