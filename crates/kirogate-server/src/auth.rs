use std::sync::Arc;

use axum::Json;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use kirogate_core::TenantSelector;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

/// Authenticate callers against the gateway API key
///
/// Accepts `Bearer <key>` for the default tenant and
/// `Bearer <key>:<refresh token>` for a caller-supplied tenant. The
/// selected tenant is stored as a request extension.
pub async fn auth_middleware(api_key: Arc<SecretString>, mut request: Request, next: Next) -> Response {
    let bearer = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(selector) = bearer.and_then(|value| select_tenant(value, api_key.expose_secret())) else {
        tracing::warn!(path = %request.uri().path(), "rejected request with invalid API key");
        return unauthorized();
    };

    request.extensions_mut().insert(selector);
    next.run(request).await
}

/// Tenant selected by a bearer value, if it carries the gateway key
fn select_tenant(bearer: &str, api_key: &str) -> Option<TenantSelector> {
    let (bearer, key) = (bearer.as_bytes(), api_key.as_bytes());
    if key.is_empty() {
        return None;
    }

    if bool::from(bearer.ct_eq(key)) {
        return Some(TenantSelector::Default);
    }

    // `<key>:<refresh token>`; the key itself may contain ':'
    let (prefix, rest) = bearer.split_at_checked(key.len())?;
    let refresh_token = rest.strip_prefix(b":").filter(|token| !token.is_empty())?;
    if !bool::from(prefix.ct_eq(key)) {
        return None;
    }

    let refresh_token = std::str::from_utf8(refresh_token).ok()?;
    Some(TenantSelector::RefreshToken(SecretString::from(refresh_token.to_owned())))
}

fn unauthorized() -> Response {
    let body = serde_json::json!({
        "error": {
            "message": "invalid or missing API key",
            "type": "authentication_error",
            "code": null,
        }
    });

    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
