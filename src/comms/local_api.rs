use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Query, State},
    http::{HeaderMap, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::comms::guards::{bearer_token, header_str, integrity_guard, require_bearer};
use crate::error::GatewayError;
use crate::gateway::config::GatewayConfig;
use crate::gateway::proxy::{GatewayProxy, ProxyError};
use crate::gateway::registry::ClientRegistry;
use crate::security::audit_log::{
    AuditLogger, AuditRecord, AuditSink, FanoutAuditSink, FileAuditSink, TracingAuditSink,
    PROCESS_GENERATE_SIGNATURE, PROCESS_LOGIN, PROCESS_PROXY_REQUEST, PROCESS_PROXY_RESPONSE, PROCESS_REFRESH,
};
use crate::security::credential::{
    within_window, CredentialVerifier, LoginAttempt, VerifyError, HEADER_CLIENT_KEY, HEADER_PRODUCT_ID,
};
use crate::security::login_signer::{generate_signed_login, SignedLogin};
use crate::security::replay::{ReplayGuard, ReplayVerdict};
use crate::security::token::{Claims, IssuedToken, TokenIssuer, TokenKind, TokenVerifier};

pub type SharedState = Arc<AppState>;

const INVALID_SIGNATURE: &str = "Invalid Signature";
const TIMESTAMP_OUT_OF_WINDOW: &str = "Request timestamp is too old or too far in the future.";

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ClientRegistry>,
    pub verifier: CredentialVerifier,
    pub replay: ReplayGuard,
    pub issuer: TokenIssuer,
    pub tokens: TokenVerifier,
    pub proxy: GatewayProxy,
    pub audit: AuditLogger,
}

impl AppState {
    pub fn new(config: GatewayConfig, registry: ClientRegistry, audit: AuditLogger) -> Result<Self> {
        let registry = Arc::new(registry);
        let proxy = GatewayProxy::new(config.proxy_timeout())?;
        Ok(Self {
            verifier: CredentialVerifier::new(registry.clone()),
            replay: ReplayGuard::new(config.replay.policy()),
            issuer: TokenIssuer::new(&config.token),
            tokens: TokenVerifier::new(&config.token),
            proxy,
            audit,
            registry,
            config: Arc::new(config),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenInfo {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub response_code: String,
    pub response_message: String,
    pub additional_info: AccessTokenInfo,
}

impl LoginResponse {
    fn issued(access: IssuedToken, refresh: Option<IssuedToken>, expires_in_hint: u64) -> Self {
        Self {
            response_code: "200".to_string(),
            response_message: "Successful".to_string(),
            additional_info: AccessTokenInfo {
                access_token: access.token,
                token_type: "Bearer".to_string(),
                expires_in: expires_in_hint.to_string(),
                refresh_token: refresh.map(|t| t.token),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PayloadRequest {
    pub client_id: String,
    #[serde(default, alias = "product")]
    pub redirect: String,
}

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub target: Option<String>,
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn login_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LoginResponse>, GatewayError> {
    let audit = &state.audit;
    let attempt = LoginAttempt::from_headers(&headers).map_err(|e| {
        audit.auth_failure(
            PROCESS_LOGIN,
            header_str(&headers, HEADER_CLIENT_KEY),
            header_str(&headers, HEADER_PRODUCT_ID),
            &e.to_string(),
        );
        GatewayError::validation(e.to_string())
    })?;
    let client = attempt.client_id.as_str();
    let product = attempt.product_id.as_str();

    if let Err(e) = serde_json::from_slice::<serde::de::IgnoredAny>(&body) {
        audit.auth_failure(PROCESS_LOGIN, Some(client), Some(product), &format!("invalid request body: {e}"));
        return Err(GatewayError::validation("Invalid request body"));
    }

    let timestamp = attempt.parsed_timestamp().map_err(|e| {
        audit.auth_failure(PROCESS_LOGIN, Some(client), Some(product), &e.to_string());
        GatewayError::validation(e.to_string())
    })?;
    let now = Utc::now();
    if !within_window(timestamp, now, state.config.login.max_clock_skew_secs) {
        let skew_ms = (now - timestamp.with_timezone(&Utc)).num_milliseconds();
        audit.auth_failure(
            PROCESS_LOGIN,
            Some(client),
            Some(product),
            &format!("timestamp {} outside window ({skew_ms}ms skew)", attempt.timestamp),
        );
        return Err(GatewayError::Unauthorized(TIMESTAMP_OUT_OF_WINDOW));
    }

    if let Err(e) = state.verifier.verify(client, &attempt.signed_string(), &attempt.signature) {
        match &e {
            VerifyError::UnknownClient(_) => audit.auth_failure(PROCESS_LOGIN, Some(client), Some(product), &e.to_string()),
            VerifyError::KeyLoad(_) | VerifyError::InvalidSignature(_) => {
                audit.signature_invalid(PROCESS_LOGIN, client, product, &e.to_string())
            }
        }
        debug!(client_id = %client, error = %e, "login signature rejected");
        return Err(GatewayError::Unauthorized(INVALID_SIGNATURE));
    }

    if state.replay.check_and_reserve(&attempt.external_id).await == ReplayVerdict::Replayed {
        warn!(client_id = %client, external_id = %attempt.external_id, "external id reused");
        audit.replay_detected(client, product, &attempt.external_id);
        return Err(GatewayError::unauthorized());
    }

    let issued = state
        .issuer
        .issue(client, TokenKind::Access)
        .and_then(|access| Ok((access, state.issuer.issue(client, TokenKind::Refresh)?)));
    let (access, refresh) = issued.map_err(|e| {
        error!(client_id = %client, error = %e, "token issuance failed");
        audit.internal_error(PROCESS_LOGIN, Some(client), Some(product), &e.to_string());
        GatewayError::Configuration(e.to_string())
    })?;

    audit.auth_success(PROCESS_LOGIN, client, product, "Access token issued");
    info!(client_id = %client, product_id = %product, "login succeeded");
    Ok(Json(LoginResponse::issued(
        access,
        Some(refresh),
        state.config.login.expires_in_hint_secs,
    )))
}

async fn refresh_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<LoginResponse>, GatewayError> {
    let product = header_str(&headers, HEADER_PRODUCT_ID);
    let token = bearer_token(&headers).map_err(|e| {
        state.audit.auth_failure(PROCESS_REFRESH, None, product, &e.to_string());
        GatewayError::unauthorized()
    })?;

    let claims = state.tokens.verify(token).map_err(|e| {
        state
            .audit
            .auth_failure(PROCESS_REFRESH, None, product, &format!("refresh {e}"));
        GatewayError::unauthorized()
    })?;
    if claims.kind() != TokenKind::Refresh {
        state
            .audit
            .auth_failure(PROCESS_REFRESH, Some(&claims.sub), product, "access token presented for refresh");
        return Err(GatewayError::unauthorized());
    }
    if state.registry.get(&claims.sub).is_none() {
        state
            .audit
            .auth_failure(PROCESS_REFRESH, Some(&claims.sub), product, "client no longer registered");
        return Err(GatewayError::unauthorized());
    }

    let access = state.issuer.issue(&claims.sub, TokenKind::Access).map_err(|e| {
        state
            .audit
            .internal_error(PROCESS_REFRESH, Some(&claims.sub), product, &e.to_string());
        GatewayError::Configuration(e.to_string())
    })?;
    state
        .audit
        .auth_success(PROCESS_REFRESH, &claims.sub, product.unwrap_or(""), "Access token refreshed");
    Ok(Json(LoginResponse::issued(access, None, state.config.login.expires_in_hint_secs)))
}

async fn generate_signature_handler(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<SignedLogin>, GatewayError> {
    let req: PayloadRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::validation(format!("Invalid request body: {e}")))?;
    if req.client_id.is_empty() {
        return Err(GatewayError::validation("client_id is required"));
    }

    let registration = state
        .registry
        .get(&req.client_id)
        .ok_or_else(|| GatewayError::NotFound(format!("Configuration for client_id '{}' not found", req.client_id)))?;
    let Some(key_path) = registration.private_key_path.clone() else {
        state.audit.internal_error(
            PROCESS_GENERATE_SIGNATURE,
            Some(&req.client_id),
            Some(&req.redirect),
            "no private key configured",
        );
        return Err(GatewayError::Configuration(format!("{}: no private key configured", req.client_id)));
    };

    let link_base = state.config.helper.secure_page_base.clone();
    let client_id = req.client_id.clone();
    let redirect = req.redirect.clone();
    let signed = tokio::task::spawn_blocking(move || generate_signed_login(&client_id, &key_path, &redirect, &link_base))
        .await
        .map_err(|e| GatewayError::Configuration(e.to_string()))?
        .map_err(|e| {
            error!(client_id = %req.client_id, error = %e, "failed to generate login signature");
            state
                .audit
                .internal_error(PROCESS_GENERATE_SIGNATURE, Some(&req.client_id), Some(&req.redirect), &e.to_string());
            GatewayError::Configuration(e.to_string())
        })?;

    state.audit.auth_success(
        PROCESS_GENERATE_SIGNATURE,
        &req.client_id,
        &req.redirect,
        &format!("signed login generated for externalId {}", signed.external_id),
    );
    Ok(Json(signed))
}

async fn secure_proxy(
    State(state): State<SharedState>,
    Query(query): Query<ProxyQuery>,
    Extension(claims): Extension<Claims>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let Some(target) = query.target.filter(|t| !t.is_empty()) else {
        return Err(GatewayError::validation("Missing 'target' query parameter"));
    };
    let client_id = claims.sub;
    let product_id = header_str(&headers, HEADER_PRODUCT_ID).unwrap_or("").to_string();

    state.audit.record(AuditRecord::new(
        PROCESS_PROXY_REQUEST,
        client_id.as_str(),
        product_id.as_str(),
        format!("{method} {target} body={}", String::from_utf8_lossy(&body)),
    ));

    let audit = state.audit.clone();
    let on_complete = Box::new(move |captured: Bytes| {
        audit.record(AuditRecord::new(
            PROCESS_PROXY_RESPONSE,
            client_id,
            product_id,
            String::from_utf8_lossy(&captured).into_owned(),
        ));
    });

    match state.proxy.forward(method, &target, &headers, body, on_complete).await {
        Ok(response) => Ok(response),
        Err(ProxyError::InvalidTarget(reason)) => Err(GatewayError::validation(format!("Invalid 'target' query parameter: {reason}"))),
        Err(e) => Err(GatewayError::Upstream(e.to_string())),
    }
}

pub fn create_router(state: SharedState) -> Router {
    let body_limit = state.config.proxy.max_body_bytes;

    // Layers run bottom-up: bearer verification before the integrity check.
    let secure = Router::new()
        .route("/secure/{*path}", any(secure_proxy))
        .route_layer(middleware::from_fn_with_state(state.clone(), integrity_guard))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/healthz", get(health))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/generateJWT", post(generate_signature_handler))
        .merge(secure)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("received shutdown signal, draining connections");
}

pub async fn serve(config: GatewayConfig, port: Option<u16>) -> Result<()> {
    let registry = ClientRegistry::from_config(&config);
    info!(clients = registry.len(), "client registry loaded");

    let sinks: Vec<Arc<dyn AuditSink>> = vec![
        Arc::new(TracingAuditSink),
        Arc::new(FileAuditSink::new(config.audit.path.clone())),
    ];
    let fallback = FileAuditSink::new(config.audit.fallback_path.clone());
    let (audit, writer) = AuditLogger::spawn(config.audit.queue_capacity, Arc::new(FanoutAuditSink::new(sinks)), fallback);
    info!(path = %config.audit.path.display(), fallback = %config.audit.fallback_path.display(), "audit trail ready");

    let host = config.server.host.clone();
    let port = port.unwrap_or(config.server.port);
    let sweep_interval = Duration::from_secs(config.replay.sweep_interval_secs.max(1));

    let state = Arc::new(AppState::new(config, registry, audit)?);
    let sweeper = state.replay.spawn_sweeper(sweep_interval);

    let app = create_router(state.clone());
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    sweeper.abort();
    // Dropping the last logger closes the queue so the writer drains and exits.
    drop(state);
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        warn!("audit writer did not drain before shutdown");
    }
    Ok(())
}
