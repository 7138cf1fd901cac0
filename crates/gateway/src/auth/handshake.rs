use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::Deserialize;

use super::AuthError;

/// Query string accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// Pull the credential out of a handshake.
///
/// An `Authorization: Bearer` header wins over the `token` query parameter.
pub fn extract_credential<'a>(
    headers: &'a HeaderMap,
    params: &'a HandshakeParams,
) -> Result<&'a str, AuthError> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        return Ok(token);
    }

    params
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}
