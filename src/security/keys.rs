use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {kind} key from {path}: {reason}")]
    Parse {
        kind: &'static str,
        path: String,
        reason: String,
    },
}

/// Load an RSA public key. SubjectPublicKeyInfo (`BEGIN PUBLIC KEY`) is the
/// registered format; PKCS#1 (`BEGIN RSA PUBLIC KEY`) is accepted as well.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, KeyError> {
    let pem = read_pem(path)?;
    parse_public_key_pem(&pem).map_err(|reason| KeyError::Parse {
        kind: "public",
        path: path.display().to_string(),
        reason,
    })
}

pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, String> {
    match RsaPublicKey::from_public_key_pem(pem) {
        Ok(key) => Ok(key),
        Err(spki_err) => RsaPublicKey::from_pkcs1_pem(pem)
            .map_err(|pkcs1_err| format!("not an RSA public key ({spki_err}; {pkcs1_err})")),
    }
}

/// Load an RSA private key in PKCS#1 or PKCS#8 PEM form.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, KeyError> {
    let pem = read_pem(path)?;
    parse_private_key_pem(&pem).map_err(|reason| KeyError::Parse {
        kind: "private",
        path: path.display().to_string(),
        reason,
    })
}

pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, String> {
    match RsaPrivateKey::from_pkcs1_pem(pem) {
        Ok(key) => Ok(key),
        Err(pkcs1_err) => RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|pkcs8_err| format!("not an RSA private key ({pkcs1_err}; {pkcs8_err})")),
    }
}

fn read_pem(path: &Path) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.display().to_string(),
        source,
    })
}
