use base64::{engine::general_purpose, Engine};
use hmac::{Hmac, Mac};
use serde::de::IgnoredAny;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

// base64(HMAC-SHA512(shared_secret, "METHOD:path:token:hex(sha256(compact(body))):timestamp")) → X-SIGNATURE

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("authorization header must be in 'Bearer <token>' format")]
    MalformedAuthorization,
    #[error("access token could not be parsed")]
    MalformedToken,
    #[error("client '{0}' has no shared secret")]
    UnknownClient(String),
    #[error("signature mismatch")]
    SignatureMismatch,
}

/// Extract the token from `Bearer <token>`: exactly one space, scheme case-insensitive.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() => Some(token),
        _ => None,
    }
}

/// Remove insignificant JSON whitespace, keeping key order and literal text.
/// Bodies that are not valid JSON fall back to dropping every space, tab, CR
/// and LF byte.
pub fn compact_body(raw: &[u8]) -> Vec<u8> {
    if serde_json::from_slice::<IgnoredAny>(raw).is_ok() {
        compact_json(raw)
    } else {
        raw.iter()
            .copied()
            .filter(|b| !is_json_whitespace(*b))
            .collect()
    }
}

fn compact_json(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    for &b in raw {
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if !is_json_whitespace(b) {
            if b == b'"' {
                in_string = true;
            }
            out.push(b);
        }
    }
    out
}

fn is_json_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

/// Lowercase hex SHA-256 of the compacted body.
pub fn body_digest_hex(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(compact_body(raw)))
}

/// Inputs bound by the per-request HMAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningMaterial<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub token: &'a str,
    pub body_digest: String,
    pub timestamp: &'a str,
}

impl<'a> SigningMaterial<'a> {
    pub fn new(method: &'a str, path: &'a str, token: &'a str, body: &[u8], timestamp: &'a str) -> Self {
        Self {
            method,
            path,
            token,
            body_digest: body_digest_hex(body),
            timestamp,
        }
    }

    pub fn signing_string(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.method, self.path, self.token, self.body_digest, self.timestamp
        )
    }
}

pub fn compute_signature_base64(secret: &str, signing_string: &str) -> String {
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(signing_string.as_bytes());
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Compare the caller's signature with the expected one in constant time.
pub fn verify_signature(secret: &str, signing_string: &str, provided_b64: &str) -> Result<(), IntegrityError> {
    let expected = compute_signature_base64(secret, signing_string);
    if expected.as_bytes().ct_eq(provided_b64.as_bytes()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(IntegrityError::SignatureMismatch)
    }
}
