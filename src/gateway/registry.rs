use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::gateway::config::GatewayConfig;
use crate::security::keys::load_public_key;

/// Outcome of loading a client's public key at startup.
///
/// A key that cannot be loaded does not prevent startup; the client stays
/// registered and every login attempt for it fails signature verification.
#[derive(Debug, Clone)]
pub enum PublicKeyState {
    Loaded(RsaPublicKey),
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub client_id: String,
    pub public_key: PublicKeyState,
    pub shared_secret: String,
    pub private_key_path: Option<PathBuf>,
}

impl ClientRegistration {
    pub fn new(client_id: impl Into<String>, public_key: RsaPublicKey, shared_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            public_key: PublicKeyState::Loaded(public_key),
            shared_secret: shared_secret.into(),
            private_key_path: None,
        }
    }

    pub fn with_private_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }
}

/// Read-only view of the registered partner clients, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, ClientRegistration>,
}

impl ClientRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let registrations = config.clients.iter().map(|(client_id, client)| {
            let public_key = match load_public_key(&client.public_key_path) {
                Ok(key) => {
                    debug!(client_id = %client_id, path = %client.public_key_path.display(), "public key loaded");
                    PublicKeyState::Loaded(key)
                }
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "public key unavailable");
                    PublicKeyState::Unavailable(e.to_string())
                }
            };
            ClientRegistration {
                client_id: client_id.clone(),
                public_key,
                shared_secret: client.shared_secret.clone(),
                private_key_path: client.private_key_path.clone(),
            }
        });
        Self::from_registrations(registrations)
    }

    pub fn from_registrations(registrations: impl IntoIterator<Item = ClientRegistration>) -> Self {
        let clients = registrations
            .into_iter()
            .map(|r| (r.client_id.clone(), r))
            .collect();
        Self { clients }
    }

    pub fn get(&self, client_id: &str) -> Option<&ClientRegistration> {
        self.clients.get(client_id)
    }

    pub fn shared_secret(&self, client_id: &str) -> Option<&str> {
        self.clients.get(client_id).map(|c| c.shared_secret.as_str())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRegistration> {
        self.clients.values()
    }
}
