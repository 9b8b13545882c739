use axum::http::HeaderMap;
use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;

use crate::gateway::registry::{ClientRegistry, PublicKeyState};

pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_CLIENT_KEY: &str = "x-client-key";
pub const HEADER_SIGNATURE: &str = "x-signature";
pub const HEADER_EXTERNAL_ID: &str = "x-external-id";
pub const HEADER_PRODUCT_ID: &str = "x-product-id";

/// `YYYY-MM-DDTHH:MM:SS±HH:MM`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// URL-safe alphabet; clients differ on whether they pad, so both are accepted.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("client '{0}' is not registered")]
    UnknownClient(String),
    #[error("public key unavailable: {0}")]
    KeyLoad(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginAttemptError {
    #[error("Missing Required Headers (X-TIMESTAMP, X-CLIENT-KEY, X-SIGNATURE, X-EXTERNAL-ID, X-PRODUCT-ID)")]
    MissingHeaders,
    #[error("Invalid X-TIMESTAMP format")]
    InvalidTimestamp,
    #[error("Invalid X-EXTERNAL-ID")]
    InvalidExternalId,
}

/// One login request as presented in the headers of `POST /auth/login`.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub client_id: String,
    pub timestamp: String,
    pub external_id: String,
    pub signature: String,
    pub product_id: String,
}

impl LoginAttempt {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, LoginAttemptError> {
        let get = |name: &str| -> Result<String, LoginAttemptError> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(LoginAttemptError::MissingHeaders)
        };
        let attempt = Self {
            timestamp: get(HEADER_TIMESTAMP)?,
            client_id: get(HEADER_CLIENT_KEY)?,
            signature: get(HEADER_SIGNATURE)?,
            external_id: get(HEADER_EXTERNAL_ID)?,
            product_id: get(HEADER_PRODUCT_ID)?,
        };
        if attempt.external_id.contains('|') {
            return Err(LoginAttemptError::InvalidExternalId);
        }
        Ok(attempt)
    }

    pub fn parsed_timestamp(&self) -> Result<DateTime<FixedOffset>, LoginAttemptError> {
        parse_timestamp(&self.timestamp)
    }

    pub fn signed_string(&self) -> String {
        canonical_login_string(&self.client_id, &self.timestamp, &self.external_id)
    }
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, LoginAttemptError> {
    DateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|_| LoginAttemptError::InvalidTimestamp)
}

/// Whether `timestamp` is at most `max_skew_secs` away from `now`, in either
/// direction. Sub-second skew counts: 300.5s is outside a 300s window.
pub fn within_window(timestamp: DateTime<FixedOffset>, now: DateTime<Utc>, max_skew_secs: i64) -> bool {
    (now - timestamp.with_timezone(&Utc)).abs() <= TimeDelta::seconds(max_skew_secs)
}

/// `client_id|timestamp|external_id`, the exact input the client signs.
pub fn canonical_login_string(client_id: &str, timestamp: &str, external_id: &str) -> String {
    format!("{client_id}|{timestamp}|{external_id}")
}

/// Verify an RSASSA-PKCS1-v1_5 / SHA-256 signature given as URL-safe base64.
pub fn verify_with_key(key: &RsaPublicKey, message: &str, signature_b64: &str) -> Result<(), VerifyError> {
    let raw = URL_SAFE_LENIENT
        .decode(signature_b64)
        .map_err(|e| VerifyError::InvalidSignature(format!("signature is not url-safe base64: {e}")))?;
    let signature = Signature::try_from(raw.as_slice())
        .map_err(|e| VerifyError::InvalidSignature(format!("malformed signature: {e}")))?;
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(message.as_bytes(), &signature)
        .map_err(|_| VerifyError::InvalidSignature("signature verification failed".to_string()))
}

/// Verifies login signatures against the registered client public keys.
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    registry: Arc<ClientRegistry>,
}

impl CredentialVerifier {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub fn verify(&self, client_id: &str, signed_string: &str, signature_b64: &str) -> Result<(), VerifyError> {
        let registration = self
            .registry
            .get(client_id)
            .ok_or_else(|| VerifyError::UnknownClient(client_id.to_string()))?;
        match &registration.public_key {
            PublicKeyState::Loaded(key) => verify_with_key(key, signed_string, signature_b64),
            PublicKeyState::Unavailable(reason) => Err(VerifyError::KeyLoad(reason.clone())),
        }
    }
}
