use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::security::replay::ReplayPolicy;

const TOKEN_KEY_ENV: &str = "GATEWAY_TOKEN_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Bearer credential settings. The signing key is process-wide and never rotated.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub signing_key: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            access_ttl_secs: 60 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("signing_key", &"<redacted>")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub max_clock_skew_secs: i64,
    /// Value advertised as `expiresIn` in login and refresh responses. It is
    /// a hint for partners and does not change the token's `exp` claim.
    pub expires_in_hint_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 5 * 60,
            expires_in_hint_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicyKind {
    #[default]
    Fixed,
    Midnight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub policy: ReplayPolicyKind,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            policy: ReplayPolicyKind::Fixed,
            ttl_secs: 15 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl ReplayConfig {
    pub fn policy(&self) -> ReplayPolicy {
        match self.policy {
            ReplayPolicyKind::Fixed => ReplayPolicy::FixedWindow(Duration::from_secs(self.ttl_secs)),
            ReplayPolicyKind::Midnight => ReplayPolicy::UntilMidnight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub queue_capacity: usize,
    /// JSON-lines audit trail, written alongside the `audit` tracing target.
    pub path: PathBuf,
    /// Receives records the primary sinks failed to store.
    pub fallback_path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            path: PathBuf::from("logs/audit.log"),
            fallback_path: PathBuf::from("logs/tracelog.txt"),
        }
    }
}

/// Settings for the `/generateJWT` helper.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HelperConfig {
    /// Prefix prepended to generated login links, e.g. `https://partner.example.com`.
    #[serde(alias = "secure_page_port")]
    pub secure_page_base: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub public_key_path: PathBuf,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    pub shared_secret: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("public_key_path", &self.public_key_path)
            .field("private_key_path", &self.private_key_path)
            .field("shared_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub helper: HelperConfig,
    #[serde(default)]
    pub clients: BTreeMap<String, ClientConfig>,
}

impl GatewayConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg = Self::from_json(&raw)?;
        cfg.apply_overrides(std::env::var(TOKEN_KEY_ENV).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parsing config JSON")
    }

    pub fn apply_overrides(&mut self, token_key: Option<String>) {
        if let Some(key) = token_key.filter(|k| !k.is_empty()) {
            self.token.signing_key = key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.signing_key.is_empty() {
            bail!("token.signing_key is required (or set {TOKEN_KEY_ENV})");
        }
        if self.token.access_ttl_secs == 0 || self.token.refresh_ttl_secs == 0 {
            bail!("token lifetimes must be positive");
        }
        if self.replay.ttl_secs == 0 {
            bail!("replay.ttl_secs must be positive");
        }
        if self.proxy.timeout_secs == 0 {
            bail!("proxy.timeout_secs must be positive");
        }
        if self.audit.queue_capacity == 0 {
            bail!("audit.queue_capacity must be positive");
        }
        for (client_id, client) in &self.clients {
            if client_id.is_empty() || client_id.contains('|') {
                bail!("invalid client id {client_id:?}: must be non-empty and free of '|'");
            }
            if client.shared_secret.is_empty() {
                bail!("client {client_id}: shared_secret is required");
            }
        }
        Ok(())
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"{
        "server": {"host": "127.0.0.1", "port": 9090},
        "token": {"signing_key": "test-signing-key-0123456789abcdef"},
        "replay": {"policy": "midnight"},
        "helper": {"secure_page_port": "http://localhost:3000"},
        "clients": {
            "C00001": {
                "public_key_path": "keys/C00001.pub.pem",
                "private_key_path": "keys/C00001.pem",
                "shared_secret": "super-secret-for-client-001"
            }
        }
    }"#;

    #[test]
    fn test_config_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{FULL}").unwrap();

        let config = GatewayConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.replay.policy, ReplayPolicyKind::Midnight);
        assert_eq!(config.replay.policy(), ReplayPolicy::UntilMidnight);
        assert_eq!(config.helper.secure_page_base, "http://localhost:3000");

        let client = &config.clients["C00001"];
        assert_eq!(client.shared_secret, "super-secret-for-client-001");
        assert_eq!(
            client.private_key_path.as_deref(),
            Some(std::path::Path::new("keys/C00001.pem"))
        );
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_json(r#"{"token": {"signing_key": "k"}}"#).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.token.access_ttl_secs, 3600);
        assert_eq!(config.token.refresh_ttl_secs, 604800);
        assert_eq!(config.login.max_clock_skew_secs, 300);
        assert_eq!(config.login.expires_in_hint_secs, 900);
        assert_eq!(config.replay.policy(), ReplayPolicy::FixedWindow(Duration::from_secs(900)));
        assert_eq!(config.proxy_timeout(), Duration::from_secs(30));
        assert_eq!(config.audit.path, PathBuf::from("logs/audit.log"));
        assert_eq!(config.audit.fallback_path, PathBuf::from("logs/tracelog.txt"));
        assert!(config.clients.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_login_and_audit_overrides() {
        let config = GatewayConfig::from_json(
            r#"{
                "token": {"signing_key": "k"},
                "login": {"expires_in_hint_secs": 1800},
                "audit": {"path": "/var/log/gateway/audit.log"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.login.expires_in_hint_secs, 1800);
        assert_eq!(config.login.max_clock_skew_secs, 300);
        assert_eq!(config.audit.path, PathBuf::from("/var/log/gateway/audit.log"));
        assert_eq!(config.audit.queue_capacity, 1024);
    }

    #[test]
    fn test_missing_signing_key_rejected() {
        let config = GatewayConfig::from_json("{}").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_signing_key_override() {
        let mut config = GatewayConfig::from_json("{}").unwrap();
        config.apply_overrides(Some("from-env".to_string()));
        assert_eq!(config.token.signing_key, "from-env");
        assert!(config.validate().is_ok());

        config.apply_overrides(Some(String::new()));
        assert_eq!(config.token.signing_key, "from-env");
    }

    #[test]
    fn test_pipe_in_client_id_rejected() {
        let config = GatewayConfig::from_json(
            r#"{
                "token": {"signing_key": "k"},
                "clients": {"C0|01": {"public_key_path": "a.pem", "shared_secret": "s"}}
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_shared_secret_rejected() {
        let config = GatewayConfig::from_json(
            r#"{
                "token": {"signing_key": "k"},
                "clients": {"C00001": {"public_key_path": "a.pem", "shared_secret": ""}}
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_missing_file() {
        let result = GatewayConfig::from_file("/nonexistent/path/config.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();

        let result = GatewayConfig::from_file(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = GatewayConfig::from_json(FULL).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-for-client-001"));
        assert!(!rendered.contains("test-signing-key"));
    }
}
