//! HTTP basic authentication for the admin routes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use tracing::warn;

use crate::config::AdminConfig;
use crate::error::GsmError;

const REALM: &str = "Basic realm=\"gsm-admin\"";

/// Split an `Authorization: Basic ...` value into user and password.
pub fn decode_basic_auth(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Same-length comparison that does not stop at the first mismatch.
fn credentials_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    given.len() == expected.len()
        && given
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

pub async fn require_admin(
    State(admin): State<Arc<AdminConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected_password) = admin.password.as_deref() else {
        warn!(path = %request.uri().path(), "Admin request rejected: no admin password configured");
        return challenge("admin access is disabled");
    };

    let credentials = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(decode_basic_auth);

    match credentials {
        Some((user, password))
            if credentials_match(&user, &admin.username)
                && credentials_match(&password, expected_password) =>
        {
            next.run(request).await
        }
        Some((user, _)) => {
            warn!(user = %user, path = %request.uri().path(), "Admin credentials rejected");
            challenge("invalid credentials")
        }
        None => challenge("authentication required"),
    }
}

fn challenge(message: &'static str) -> Response {
    let mut response = GsmError::unauthorized(message).into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic_auth() {
        let header = format!("Basic {}", STANDARD.encode("admin:s3cret:with-colon"));
        assert_eq!(
            decode_basic_auth(&header),
            Some(("admin".to_string(), "s3cret:with-colon".to_string()))
        );
        assert_eq!(decode_basic_auth("Bearer abc"), None);
        assert_eq!(decode_basic_auth("Basic !!!"), None);
    }

    #[test]
    fn test_credentials_match() {
        assert!(credentials_match("admin", "admin"));
        assert!(!credentials_match("admin", "admin2"));
        assert!(!credentials_match("admim", "admin"));
    }
}
