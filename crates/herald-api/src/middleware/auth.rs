//! Credential check for the webhook and dead-letter routes.
//!
//! Accepts `Authorization: Bearer <token>` against the configured tokens,
//! or `Authorization: Basic <base64(user:password)>` against the configured
//! pair. Every request is first checked against the rate limiter under its
//! source key; failures count towards a ban, a success clears the key.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::prelude::*;
use herald_core::{events::emit_detached, DispatchEvent};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    config::AuthSettings,
    handlers::error_response,
    rate_limit::source_key,
    AppState,
};

/// Credentials presented by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

/// Parses the `Authorization` header.
fn extract_credentials(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())?;

    if let Some(token) = value.strip_prefix("Bearer ") {
        return Some(Credentials::Bearer(token.trim().to_string()));
    }

    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials::Basic { username: username.to_string(), password: password.to_string() })
}

/// Compares digests rather than raw secrets.
fn secrets_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

fn verify(settings: &AuthSettings, credentials: &Credentials) -> bool {
    match credentials {
        Credentials::Bearer(token) => settings.bearer_tokens.iter().any(|expected| secrets_match(token, expected)),
        Credentials::Basic { username, password } => match (&settings.username, &settings.password) {
            (Some(expected_user), Some(expected_password)) => {
                secrets_match(username, expected_user) & secrets_match(password, expected_password)
            },
            _ => false,
        },
    }
}

/// Errors that can occur during authentication.
#[derive(Debug)]
pub enum AuthError {
    /// The source is banned after repeated failures.
    RateLimited,
    /// The `Authorization` header is missing or unparseable.
    MissingCredentials,
    /// The credentials do not match.
    InvalidCredentials,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::RateLimited => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many failed authentication attempts")
            },
            Self::MissingCredentials => {
                (StatusCode::UNAUTHORIZED, "missing_credentials", "Missing or malformed Authorization header")
            },
            Self::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials", "Invalid credentials"),
        };

        let mut response = error_response(status, code, message);
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer, Basic realm=\"herald\""));
        }
        response
    }
}

/// Axum middleware that authenticates requests and throttles failures.
///
/// With no credentials configured every request passes untouched.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let settings = &state.config().auth;
    if !settings.is_enabled() {
        return Ok(next.run(req).await);
    }

    let remote = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0.to_string());
    let source = source_key(req.headers(), remote.as_deref());
    let limiter = state.rate_limiter();

    if !limiter.is_allowed(&source) {
        warn!(source = %source, "request refused, source is banned");
        emit_detached(state.events(), DispatchEvent::AuthAttempt { source, allowed: false, success: false });
        return Err(AuthError::RateLimited);
    }

    let outcome = match extract_credentials(req.headers()) {
        None => Err(AuthError::MissingCredentials),
        Some(credentials) if verify(settings, &credentials) => Ok(()),
        Some(_) => Err(AuthError::InvalidCredentials),
    };

    emit_detached(
        state.events(),
        DispatchEvent::AuthAttempt { source: source.clone(), allowed: true, success: outcome.is_ok() },
    );

    match outcome {
        Ok(()) => {
            limiter.record_successful_attempt(&source);
            debug!(source = %source, "request authenticated");
            Ok(next.run(req).await)
        },
        Err(e) => {
            warn!(source = %source, reason = ?e, "authentication failed");
            limiter.record_failed_attempt(&source);
            Err(e)
        },
    }
}
