use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};

use crate::comms::local_api::SharedState;
use crate::error::GatewayError;
use crate::security::audit_log::PROCESS_SECURE;
use crate::security::credential::{HEADER_PRODUCT_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::security::request_signer::{parse_bearer, verify_signature, IntegrityError, SigningMaterial};
use crate::security::token::{peek_subject, TokenError, TokenKind};

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str, IntegrityError> {
    let value = header_str(headers, header::AUTHORIZATION.as_str()).ok_or(IntegrityError::MissingHeader("Authorization"))?;
    parse_bearer(value).ok_or(IntegrityError::MalformedAuthorization)
}

pub(crate) fn token_failure_reason(err: &TokenError) -> &'static str {
    match err {
        TokenError::Expired => "access token expired",
        TokenError::SignatureInvalid => "access token signature invalid",
        TokenError::Malformed | TokenError::Signing(_) => "access token malformed",
    }
}

/// Full bearer verification for protected routes. Verified claims are
/// stored in request extensions for the handlers behind it.
pub async fn require_bearer(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let product = header_str(req.headers(), HEADER_PRODUCT_ID).map(str::to_string);
    let token = match bearer_token(req.headers()) {
        Ok(token) => token.to_string(),
        Err(e) => {
            state.audit.auth_failure(PROCESS_SECURE, None, product.as_deref(), &e.to_string());
            return Err(GatewayError::unauthorized());
        }
    };

    let claims = match state.tokens.verify(&token) {
        Ok(claims) => claims,
        Err(e) => {
            let reason = token_failure_reason(&e);
            debug!(reason, "bearer rejected");
            let subject = peek_subject(&token).ok();
            state.audit.auth_failure(PROCESS_SECURE, subject.as_deref(), product.as_deref(), reason);
            return Err(GatewayError::unauthorized());
        }
    };

    if claims.kind() != TokenKind::Access {
        state
            .audit
            .auth_failure(PROCESS_SECURE, Some(&claims.sub), product.as_deref(), "refresh token used as access token");
        return Err(GatewayError::unauthorized());
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Checks the per-request HMAC over method, path, token, body digest and
/// timestamp. The body is buffered and put back for the handler.
pub async fn integrity_guard(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let (parts, body) = req.into_parts();
    let headers = &parts.headers;
    let product = header_str(headers, HEADER_PRODUCT_ID);

    let token = match bearer_token(headers) {
        Ok(token) => token,
        Err(e) => {
            state.audit.auth_failure(PROCESS_SECURE, None, product, &e.to_string());
            return Err(GatewayError::unauthorized());
        }
    };
    let (Some(timestamp), Some(signature)) = (header_str(headers, HEADER_TIMESTAMP), header_str(headers, HEADER_SIGNATURE)) else {
        return Err(GatewayError::validation("Missing required headers (X-TIMESTAMP, X-SIGNATURE)"));
    };

    let bytes = to_bytes(body, state.config.proxy.max_body_bytes)
        .await
        .map_err(|e| {
            warn!(error = %e, "failed to buffer request body");
            GatewayError::validation("Failed to read request body")
        })?;

    let client_id = match peek_subject(token) {
        Ok(sub) => sub,
        Err(_) => {
            state
                .audit
                .auth_failure(PROCESS_SECURE, None, product, &IntegrityError::MalformedToken.to_string());
            return Err(GatewayError::unauthorized());
        }
    };
    let Some(secret) = state.registry.shared_secret(&client_id) else {
        let reason = IntegrityError::UnknownClient(client_id.clone()).to_string();
        state.audit.auth_failure(PROCESS_SECURE, Some(&client_id), product, &reason);
        return Err(GatewayError::unauthorized());
    };

    // Partners sign the decoded path, so `/a%20b` is signed as `/a b`.
    let path = percent_decode_str(parts.uri.path()).decode_utf8().map_err(|_| {
        state
            .audit
            .auth_failure(PROCESS_SECURE, Some(&client_id), product, "request path is not valid UTF-8");
        GatewayError::validation("Invalid request path")
    })?;
    let material = SigningMaterial::new(parts.method.as_str(), &path, token, &bytes, timestamp);
    if let Err(e) = verify_signature(secret, &material.signing_string(), signature) {
        state
            .audit
            .signature_invalid(PROCESS_SECURE, &client_id, product.unwrap_or(""), &e.to_string());
        return Err(GatewayError::Unauthorized("Invalid Signature"));
    }
    debug!(client_id = %client_id, path = %path, "request integrity verified");

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}
