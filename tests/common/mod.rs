#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, FixedOffset, Local};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;
use tokio::sync::mpsc;

use partner_gateway::comms::local_api::{create_router, AppState, SharedState};
use partner_gateway::gateway::config::{ClientConfig, GatewayConfig};
use partner_gateway::gateway::registry::ClientRegistry;
use partner_gateway::security::audit_log::{AuditLogger, AuditRecord};
use partner_gateway::security::login_signer::sign_login_string;

pub const SIGNING_KEY: &str = "integration-signing-key-0123456789";
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

pub const CLIENT_1: &str = "C00001";
pub const CLIENT_2: &str = "C00002";
/// Registered, but its public key file does not exist.
pub const CLIENT_BROKEN: &str = "C00003";

pub const SECRET_1: &str = "super-secret-for-client-001";
pub const SECRET_2: &str = "super-secret-for-client-002";

pub fn keypair(client_id: &str) -> &'static RsaPrivateKey {
    static KEYS: OnceLock<(RsaPrivateKey, RsaPrivateKey)> = OnceLock::new();
    let (k1, k2) = KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        (
            RsaPrivateKey::new(&mut rng, 1024).unwrap(),
            RsaPrivateKey::new(&mut rng, 1024).unwrap(),
        )
    });
    match client_id {
        CLIENT_1 => k1,
        _ => k2,
    }
}

pub struct TestGateway {
    pub dir: TempDir,
    pub state: SharedState,
    pub audit_rx: mpsc::Receiver<AuditRecord>,
}

impl TestGateway {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut GatewayConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.token.signing_key = SIGNING_KEY.to_string();
        config.helper.secure_page_base = "http://localhost:3000".to_string();
        config.audit.path = dir.path().join("audit.log");
        config.audit.fallback_path = dir.path().join("tracelog.txt");

        for (client_id, secret) in [(CLIENT_1, SECRET_1), (CLIENT_2, SECRET_2)] {
            let key = keypair(client_id);
            let pub_path = dir.path().join(format!("{client_id}.pub.pem"));
            let priv_path = dir.path().join(format!("{client_id}.pem"));
            std::fs::write(&pub_path, key.to_public_key().to_public_key_pem(LineEnding::LF).unwrap()).unwrap();
            std::fs::write(&priv_path, key.to_pkcs1_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
            config.clients.insert(
                client_id.to_string(),
                ClientConfig {
                    public_key_path: pub_path,
                    // Only C00001 may use the signing helper.
                    private_key_path: (client_id == CLIENT_1).then_some(priv_path),
                    shared_secret: secret.to_string(),
                },
            );
        }
        config.clients.insert(
            CLIENT_BROKEN.to_string(),
            ClientConfig {
                public_key_path: dir.path().join("missing.pub.pem"),
                private_key_path: None,
                shared_secret: "super-secret-for-client-003".to_string(),
            },
        );
        tweak(&mut config);
        config.validate().unwrap();

        let registry = ClientRegistry::from_config(&config);
        let (audit, audit_rx) = AuditLogger::channel(1024);
        let state = Arc::new(AppState::new(config, registry, audit).unwrap());
        Self { dir, state, audit_rx }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub fn drain_audit(&mut self) -> Vec<AuditRecord> {
        let mut records = Vec::new();
        while let Ok(record) = self.audit_rx.try_recv() {
            records.push(record);
        }
        records
    }
}

pub fn now_ts() -> String {
    Local::now().fixed_offset().format(TS_FORMAT).to_string()
}

pub fn ts_at(at: DateTime<FixedOffset>) -> String {
    at.format(TS_FORMAT).to_string()
}

pub fn login_signature(signer: &str, client_id: &str, timestamp: &str, external_id: &str) -> String {
    sign_login_string(keypair(signer), &format!("{client_id}|{timestamp}|{external_id}")).unwrap()
}

pub fn login_request_with(
    client_id: &str,
    timestamp: &str,
    external_id: &str,
    signature: &str,
    body: &str,
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .header("X-TIMESTAMP", timestamp)
        .header("X-CLIENT-KEY", client_id)
        .header("X-SIGNATURE", signature)
        .header("X-EXTERNAL-ID", external_id)
        .header("X-PRODUCT-ID", "ferry")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// A login request signed with the client's own key at the current time.
pub fn login_request(client_id: &str, external_id: &str) -> Request<Body> {
    let timestamp = now_ts();
    let signature = login_signature(client_id, client_id, &timestamp, external_id);
    login_request_with(client_id, &timestamp, external_id, &signature, "{}")
}

/// X-SIGNATURE as a partner computes it for an already compact body.
pub fn request_signature(secret: &str, method: &str, path: &str, token: &str, body: &[u8], timestamp: &str) -> String {
    let digest = hex::encode(Sha256::digest(body));
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{method}:{path}:{token}:{digest}:{timestamp}").as_bytes());
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

pub fn secure_request(
    method: &str,
    uri: &str,
    token: &str,
    timestamp: &str,
    signature: &str,
    body: &str,
) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {token}"))
        .header("X-TIMESTAMP", timestamp)
        .header("X-SIGNATURE", signature)
        .header("X-PRODUCT-ID", "ferry")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// An address nothing listens on.
pub fn refused_addr() -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
