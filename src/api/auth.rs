//! Credentials check for mutating requests
//!
//! Reads pass through. Writes must carry `Authorization: Bearer <token>`
//! (a configured token or the stored `APIToken`) or Basic credentials of a
//! configured user. With nothing configured the API runs open.

use super::AppState;
use crate::config::AuthConfig;
use crate::core::error::Error;
use axum::extract::{Request, State};
use axum::http::{Method, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::warn;

/// Parsed `Authorization` header
#[derive(Debug, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { user: String, password: String },
}

impl Credentials {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, value) = header.trim().split_once(' ')?;
        let value = value.trim();
        if scheme.eq_ignore_ascii_case("bearer") {
            return (!value.is_empty()).then(|| Self::Bearer(value.to_string()));
        }
        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = STANDARD.decode(value).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (user, password) = decoded.split_once(':')?;
            return Some(Self::Basic {
                user: user.to_string(),
                password: password.to_string(),
            });
        }
        None
    }
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Whether `credentials` are accepted by `auth` or match `api_token`.
pub fn authorize(credentials: &Credentials, auth: &AuthConfig, api_token: &str) -> bool {
    match credentials {
        Credentials::Bearer(token) => {
            let configured = auth
                .tokens
                .iter()
                .any(|t| constant_time_eq(t.as_bytes(), token.as_bytes()));
            configured
                || (!api_token.is_empty()
                    && constant_time_eq(api_token.as_bytes(), token.as_bytes()))
        }
        Credentials::Basic { user, password } => auth
            .users
            .get(user)
            .is_some_and(|p| constant_time_eq(p.as_bytes(), password.as_bytes())),
    }
}

fn is_read(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if is_read(request.method()) || state.auth.is_empty() {
        return next.run(request).await;
    }

    let credentials = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(Credentials::parse);

    let Some(credentials) = credentials else {
        warn!(method = %request.method(), path = %request.uri().path(), "Missing credentials");
        return Error::Auth.into_response();
    };

    let api_token = state.store.token().await;
    if !authorize(&credentials, &state.auth, &api_token) {
        warn!(method = %request.method(), path = %request.uri().path(), "Rejected credentials");
        return Error::Auth.into_response();
    }
    next.run(request).await
}
