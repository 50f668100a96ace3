//! Inbound auth: bearer tokens for `/v1/*` traffic, HTTP Basic for
//! `/admin/api/*`. Both are plain `axum::middleware::from_fn_with_state`
//! layers, matching the teacher crate's preference for function middleware
//! over trait-based extractors for this kind of header check.

use crate::app::AppState;
use crate::error::GatewayError;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use std::sync::Arc;

/// Default admin credentials, overridable via `GATEWAY_ADMIN_USER` /
/// `GATEWAY_ADMIN_PASS`. Documented as insecure: operators deploying beyond
/// a trusted network must override both.
const DEFAULT_ADMIN_USER: &str = "admin";
const DEFAULT_ADMIN_PASS: &str = "admin";

fn admin_user() -> String {
    std::env::var("GATEWAY_ADMIN_USER").unwrap_or_else(|_| DEFAULT_ADMIN_USER.to_string())
}

fn admin_pass() -> String {
    std::env::var("GATEWAY_ADMIN_PASS").unwrap_or_else(|_| DEFAULT_ADMIN_PASS.to_string())
}

/// Key name of the authenticated caller, stashed in request extensions for
/// the forwarding engine to record on the trace.
#[derive(Debug, Clone)]
pub struct AuthenticatedKey(pub String);

pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::AuthMissing)?;

    let token = header.strip_prefix("Bearer ").ok_or(GatewayError::AuthMissing)?;

    let name = state
        .config
        .authenticate(token)
        .ok_or(GatewayError::AuthInvalid)?;

    req.extensions_mut().insert(AuthenticatedKey(name));
    Ok(next.run(req).await)
}

pub async fn require_basic_admin(req: Request, next: Next) -> Result<Response, GatewayError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::AuthMissing)?;

    let encoded = header.strip_prefix("Basic ").ok_or(GatewayError::AuthMissing)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| GatewayError::AuthInvalid)?;
    let decoded = String::from_utf8(decoded).map_err(|_| GatewayError::AuthInvalid)?;
    let (user, pass) = decoded.split_once(':').ok_or(GatewayError::AuthInvalid)?;

    if user == admin_user() && pass == admin_pass() {
        Ok(next.run(req).await)
    } else {
        Err(GatewayError::AuthInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_credentials_default_when_env_unset() {
        std::env::remove_var("GATEWAY_ADMIN_USER");
        std::env::remove_var("GATEWAY_ADMIN_PASS");
        assert_eq!(admin_user(), DEFAULT_ADMIN_USER);
        assert_eq!(admin_pass(), DEFAULT_ADMIN_PASS);
    }
}
