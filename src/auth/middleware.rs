//! Axum middleware that authenticates a request and, where the route
//! demands it, checks the caller's role against the action being taken.

use crate::auth::{jwt::JwtHandler, models::Claims, models::UserRole};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Validate the bearer token on a request and attach its `Claims` for
/// downstream handlers. Accepts the token either as `Authorization: Bearer
/// <token>` or as a `token=` query parameter, the latter so that WebSocket
/// upgrades (which can't set headers from a browser) can still authenticate.
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = token_from_query(req.uri().query())
        .or_else(|| token_from_header(&req))
        .ok_or(AuthError::MissingToken)?;

    let claims = jwt_handler.validate_token(&token).map_err(|e| {
        warn!(path = %req.uri().path(), error = %e, "rejected request with invalid token");
        AuthError::InvalidToken
    })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Same as `auth_middleware` but never rejects: requests without a valid
/// token proceed unauthenticated, with no `Claims` in the extensions.
pub async fn optional_auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(token) = token_from_header(&req) {
        if let Ok(claims) = jwt_handler.validate_token(&token) {
            req.extensions_mut().insert(claims);
        }
    }
    next.run(req).await
}

/// Gate a route behind the `Trader` role, rejecting `Viewer` callers. Must
/// run after `auth_middleware` has populated `Claims` on the request.
pub async fn require_trading_access(req: Request, next: Next) -> Result<Response, AuthError> {
    let role = req
        .extensions()
        .get::<Claims>()
        .map(|c| c.role)
        .ok_or(AuthError::MissingToken)?;

    if !role.satisfies(UserRole::Trader) {
        warn!(path = %req.uri().path(), role = role.as_str(), "viewer blocked from trading route");
        return Err(AuthError::Forbidden);
    }

    Ok(next.run(req).await)
}

fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}

fn token_from_header(req: &Request) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Extract `Claims` from a request that already passed `auth_middleware`.
pub fn extract_claims(req: &Request) -> Option<&Claims> {
    req.extensions().get::<Claims>()
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    InvalidToken,
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "missing authorization token"),
            AuthError::InvalidFormat => (
                StatusCode::UNAUTHORIZED,
                "invalid authorization format, expected Bearer <token>",
            ),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid or expired token"),
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "role does not permit this action"),
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::{User, UserRole};
    use axum::{body::Body, http::Request as HttpRequest};
    use uuid::Uuid;

    fn create_test_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "testuser".to_string(),
            password_hash: "hash".to_string(),
            role: UserRole::Trader,
            api_key: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_auth_error_responses() {
        let missing = AuthError::MissingToken.into_response();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let invalid_format = AuthError::InvalidFormat.into_response();
        assert_eq!(invalid_format.status(), StatusCode::UNAUTHORIZED);

        let invalid_token = AuthError::InvalidToken.into_response();
        assert_eq!(invalid_token.status(), StatusCode::UNAUTHORIZED);

        let forbidden = AuthError::Forbidden.into_response();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_extract_claims_from_request() {
        let mut req = HttpRequest::new(Body::empty());
        assert!(extract_claims(&req).is_none());

        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            username: "test".to_string(),
            role: UserRole::Trader,
            exp: 1234567890,
        };
        req.extensions_mut().insert(claims.clone());

        let extracted = extract_claims(&req);
        assert!(extracted.is_some());
        assert_eq!(extracted.unwrap().username, "test");
    }

    #[test]
    fn test_role_satisfies_trading_access_threshold() {
        assert!(!UserRole::Viewer.satisfies(UserRole::Trader));
        assert!(UserRole::Trader.satisfies(UserRole::Trader));
        assert!(UserRole::Admin.satisfies(UserRole::Trader));
    }

    #[test]
    fn test_token_from_header_strips_bearer_prefix() {
        let mut req = HttpRequest::new(Body::empty());
        req.headers_mut().insert(
            "Authorization",
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(token_from_header(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_token_from_query_finds_token_param() {
        assert_eq!(
            token_from_query(Some("foo=bar&token=xyz")).as_deref(),
            Some("xyz")
        );
        assert_eq!(token_from_query(Some("foo=bar")), None);
        assert_eq!(token_from_query(None), None);
    }
}
