use axum::{
    extract::{FromRequestParts, Query},
    http::{request::Parts, StatusCode},
};
use serde::Deserialize;

use super::SharedIdentity;
use crate::db::models::UserId;

/// Authenticated caller of a REST endpoint.
///
/// The token is read from `Authorization: Bearer <jwt>`, falling back to a
/// `?token=` query parameter so browser clients can reuse the websocket URL style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

/// Identity provider stored in request extensions for the AuthUser extractor
#[derive(Clone)]
pub struct IdentityExt(pub SharedIdentity);

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if let Some(value) = header {
        // Scheme is case-insensitive
        if value.len() > 7 && value[..7].eq_ignore_ascii_case("bearer ") {
            return Some(value[7..].trim().to_string());
        }
        return Some(value.trim().to_string());
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.token)
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(StatusCode::UNAUTHORIZED)?;

        // Set by middleware layer
        let identity = parts
            .extensions
            .get::<IdentityExt>()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

        identity
            .0
            .authenticate(&token)
            .map(AuthUser)
            .map_err(|_| StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn test_bearer_header_any_case() {
        let p = parts(
            Request::builder()
                .uri("/api/chat/contacts")
                .header("Authorization", "BEARER abc.def")
                .body(())
                .unwrap(),
        );
        assert_eq!(bearer_token(&p).as_deref(), Some("abc.def"));
    }

    #[test]
    fn test_raw_header_and_query_fallback() {
        let raw = parts(
            Request::builder()
                .uri("/x")
                .header("Authorization", "abc.def")
                .body(())
                .unwrap(),
        );
        assert_eq!(bearer_token(&raw).as_deref(), Some("abc.def"));

        let query = parts(
            Request::builder()
                .uri("/x?target_id=3&token=tok")
                .body(())
                .unwrap(),
        );
        assert_eq!(bearer_token(&query).as_deref(), Some("tok"));

        let encoded = parts(
            Request::builder()
                .uri("/x?token=abc%2Edef%2Bghi")
                .body(())
                .unwrap(),
        );
        assert_eq!(bearer_token(&encoded).as_deref(), Some("abc.def+ghi"));

        let none = parts(Request::builder().uri("/x").body(()).unwrap());
        assert_eq!(bearer_token(&none), None);
    }
}
