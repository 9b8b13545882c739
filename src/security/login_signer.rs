//! Produces login-ready signatures with a client's private key. Backs the
//! `/generateJWT` integration helper; partner traffic never goes through it.

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, FixedOffset, Local};
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::Sha256;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::security::credential::{canonical_login_string, TIMESTAMP_FORMAT};
use crate::security::keys::{load_private_key, KeyError};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("failed to sign login string: {0}")]
    Sign(String),
    #[error("failed to encode login link: {0}")]
    Link(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedLogin {
    pub client_id: String,
    pub timestamp: String,
    pub signature: String,
    #[serde(rename = "externalId")]
    pub external_id: String,
    pub link: String,
}

/// URL-safe base64 PKCS#1 v1.5 / SHA-256 signature, as `/auth/login` expects it.
pub fn sign_login_string(key: &RsaPrivateKey, message: &str) -> Result<String, SigningError> {
    let signature = SigningKey::<Sha256>::new(key.clone())
        .try_sign(message.as_bytes())
        .map_err(|e| SigningError::Sign(e.to_string()))?;
    Ok(general_purpose::URL_SAFE.encode(signature.to_vec()))
}

pub fn generate_signed_login(
    client_id: &str,
    private_key_path: &Path,
    product: &str,
    link_base: &str,
) -> Result<SignedLogin, SigningError> {
    let key = load_private_key(private_key_path)?;
    let now = Local::now().fixed_offset();
    generate_signed_login_at(client_id, &key, product, link_base, now, &Uuid::new_v4().to_string())
}

pub fn generate_signed_login_at(
    client_id: &str,
    key: &RsaPrivateKey,
    product: &str,
    link_base: &str,
    at: DateTime<FixedOffset>,
    external_id: &str,
) -> Result<SignedLogin, SigningError> {
    let timestamp = at.format(TIMESTAMP_FORMAT).to_string();
    let message = canonical_login_string(client_id, &timestamp, external_id);
    let signature = sign_login_string(key, &message)?;

    let pairs: &[(&str, &str)] = &[
        ("ca_code", client_id),
        ("externalId", external_id),
        ("product", product),
        ("signature", &signature),
        ("timestamp", &timestamp),
    ];
    let query = serde_urlencoded::to_string(pairs).map_err(|e| SigningError::Link(e.to_string()))?;

    Ok(SignedLogin {
        client_id: client_id.to_string(),
        timestamp,
        signature,
        external_id: external_id.to_string(),
        link: format!("{link_base}/auth/login?{query}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::credential::{parse_timestamp, verify_with_key};
    use chrono::TimeZone;

    #[test]
    fn test_generated_signature_verifies() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let at = FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .unwrap();

        let signed = generate_signed_login_at("C00001", &key, "ferry", "http://localhost:3000", at, "abc-123").unwrap();
        assert_eq!(signed.timestamp, "2024-01-01T10:00:00+07:00");
        assert!(parse_timestamp(&signed.timestamp).is_ok());

        let message = canonical_login_string("C00001", &signed.timestamp, "abc-123");
        assert!(verify_with_key(&key.to_public_key(), &message, &signed.signature).is_ok());

        assert!(signed.link.starts_with("http://localhost:3000/auth/login?ca_code=C00001&externalId=abc-123&product=ferry&signature="));
        assert!(signed.link.contains("timestamp=2024-01-01T10%3A00%3A00%2B07%3A00"));
    }

    #[test]
    fn test_missing_private_key() {
        let err = generate_signed_login("C00001", Path::new("/nonexistent/C00001.pem"), "ferry", "").unwrap_err();
        assert!(matches!(err, SigningError::Key(KeyError::Read { .. })));
    }
}
