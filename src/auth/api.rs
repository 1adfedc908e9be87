//! Authentication API Endpoints
//! Mission: Provide login and user management endpoints

use crate::auth::{
    jwt::JwtHandler,
    middleware::extract_claims,
    models::{
        ApiKeyResponse, Claims, CreateApiKeyRequest, LoginRequest, LoginResponse, User,
        UserResponse, UserRole,
    },
    user_store::UserStore,
};
use axum::{
    extract::{Extension, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared auth state.
#[derive(Clone)]
pub struct AuthState {
    pub user_store: Arc<UserStore>,
    pub jwt_handler: Arc<JwtHandler>,
    pub default_api_key_rate_limit: usize,
}

impl AuthState {
    pub fn new(
        user_store: Arc<UserStore>,
        jwt_handler: Arc<JwtHandler>,
        default_api_key_rate_limit: usize,
    ) -> Self {
        Self {
            user_store,
            jwt_handler,
            default_api_key_rate_limit,
        }
    }
}

/// Login endpoint - POST /api/v1/auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthApiError> {
    info!(username = %payload.username, "login attempt");

    let valid = state
        .user_store
        .verify_password(&payload.username, &payload.password)
        .map_err(|_| AuthApiError::InternalError)?;

    if !valid {
        warn!(username = %payload.username, "failed login attempt");
        return Err(AuthApiError::InvalidCredentials);
    }

    let user = state
        .user_store
        .get_user_by_username(&payload.username)
        .map_err(|_| AuthApiError::InternalError)?
        .ok_or(AuthApiError::InvalidCredentials)?;

    let (token, expires_in) = state
        .jwt_handler
        .generate_token(&user)
        .map_err(|_| AuthApiError::InternalError)?;

    info!(username = %user.username, role = user.role.as_str(), "login successful");

    Ok(Json(LoginResponse {
        token,
        expires_in,
        role: user.role.clone(),
        user: UserResponse::from_user(&user),
    }))
}

/// Get current user info - GET /api/v1/auth/me
pub async fn get_current_user(req: Request) -> Result<Json<LoginResponse>, AuthApiError> {
    let claims = extract_claims(&req).ok_or(AuthApiError::Unauthorized)?;

    Ok(Json(LoginResponse {
        token: String::new(),
        expires_in: 0,
        role: claims.role.clone(),
        user: UserResponse {
            id: claims.sub.clone(),
            username: claims.username.clone(),
            role: claims.role.clone(),
            created_at: String::new(),
        },
    }))
}

/// List all users - GET /api/v1/admin/users (Admin only)
pub async fn list_users(
    State(state): State<AuthState>,
    req: Request,
) -> Result<Json<Vec<UserResponse>>, AuthApiError> {
    let claims = extract_claims(&req).ok_or(AuthApiError::Unauthorized)?;
    if claims.role != UserRole::Admin {
        return Err(AuthApiError::Forbidden);
    }

    let users = state
        .user_store
        .list_users()
        .map_err(|_| AuthApiError::InternalError)?;

    Ok(Json(users.iter().map(UserResponse::from_user).collect()))
}

/// Create user - POST /api/v1/admin/users (Admin only)
pub async fn create_user(
    State(state): State<AuthState>,
    claims_ext: Option<Extension<Claims>>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<Json<UserResponse>, AuthApiError> {
    let claims = claims_ext
        .map(|Extension(c)| c)
        .ok_or(AuthApiError::Unauthorized)?;
    if claims.role != UserRole::Admin {
        return Err(AuthApiError::Forbidden);
    }

    if payload.password.len() < 8 {
        return Err(AuthApiError::WeakPassword);
    }

    let user = state
        .user_store
        .create_user(&payload.username, &payload.password, payload.role)
        .map_err(|e| {
            warn!(error = %e, "failed to create user");
            AuthApiError::UserAlreadyExists
        })?;

    info!(username = %user.username, role = user.role.as_str(), "user created");

    Ok(Json(UserResponse::from_user(&user)))
}

/// Delete user - DELETE /api/v1/admin/users/:id (Admin only)
pub async fn delete_user(
    State(state): State<AuthState>,
    claims_ext: Option<Extension<Claims>>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AuthApiError> {
    let claims = claims_ext
        .map(|Extension(c)| c)
        .ok_or(AuthApiError::Unauthorized)?;
    if claims.role != UserRole::Admin {
        return Err(AuthApiError::Forbidden);
    }

    let uuid = Uuid::parse_str(&user_id).map_err(|_| AuthApiError::InvalidUserId)?;
    if uuid.to_string() == claims.sub {
        return Err(AuthApiError::CannotDeleteSelf);
    }

    state
        .user_store
        .delete_user(&uuid)
        .map_err(|_| AuthApiError::UserNotFound)?;

    info!(user_id = %user_id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Create an API key for the authenticated user - POST /api/v1/auth/api-keys
pub async fn create_api_key(
    State(state): State<AuthState>,
    claims_ext: Option<Extension<Claims>>,
    Json(payload): Json<CreateApiKeyRequest>,
) -> Result<Json<ApiKeyResponse>, AuthApiError> {
    let claims = claims_ext
        .map(|Extension(c)| c)
        .ok_or(AuthApiError::Unauthorized)?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthApiError::InvalidUserId)?;

    let rate_limit = payload.rate_limit.unwrap_or(state.default_api_key_rate_limit);
    let key = state
        .user_store
        .create_api_key(&user_id, &payload.name, rate_limit)
        .map_err(|_| AuthApiError::InternalError)?;

    Ok(Json(ApiKeyResponse {
        id: key.id,
        key: key.key,
        name: key.name,
        rate_limit: key.rate_limit,
        created_at: key.created_at,
    }))
}

/// List the authenticated user's API keys - GET /api/v1/auth/api-keys
pub async fn list_api_keys(
    State(state): State<AuthState>,
    req: Request,
) -> Result<Json<Vec<ApiKeyResponse>>, AuthApiError> {
    let claims = extract_claims(&req).ok_or(AuthApiError::Unauthorized)?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthApiError::InvalidUserId)?;

    let keys = state
        .user_store
        .list_api_keys(&user_id)
        .map_err(|_| AuthApiError::InternalError)?;

    Ok(Json(
        keys.into_iter()
            .map(|k| ApiKeyResponse {
                id: k.id,
                key: mask_key(&k.key),
                name: k.name,
                rate_limit: k.rate_limit,
                created_at: k.created_at,
            })
            .collect(),
    ))
}

/// Revoke an API key - DELETE /api/v1/auth/api-keys/:id
pub async fn revoke_api_key(
    State(state): State<AuthState>,
    claims_ext: Option<Extension<Claims>>,
    Path(key_id): Path<String>,
) -> Result<StatusCode, AuthApiError> {
    let claims = claims_ext
        .map(|Extension(c)| c)
        .ok_or(AuthApiError::Unauthorized)?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthApiError::InvalidUserId)?;
    let key_id = Uuid::parse_str(&key_id).map_err(|_| AuthApiError::InvalidUserId)?;

    let revoked = state
        .user_store
        .revoke_api_key(&user_id, &key_id)
        .map_err(|_| AuthApiError::InternalError)?;

    if revoked {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AuthApiError::UserNotFound)
    }
}

fn mask_key(key: &str) -> String {
    let tail_len = 4.min(key.len());
    format!("{}...{}", &key[..key.len().saturating_sub(tail_len).min(8)], &key[key.len() - tail_len..])
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub role: UserRole,
}

#[derive(Debug)]
pub enum AuthApiError {
    InvalidCredentials,
    Unauthorized,
    Forbidden,
    UserNotFound,
    UserAlreadyExists,
    WeakPassword,
    InvalidUserId,
    CannotDeleteSelf,
    InternalError,
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthApiError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid username or password")
            }
            AuthApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthApiError::Forbidden => (StatusCode::FORBIDDEN, "Insufficient permissions"),
            AuthApiError::UserNotFound => (StatusCode::NOT_FOUND, "User not found"),
            AuthApiError::UserAlreadyExists => (StatusCode::CONFLICT, "Username already exists"),
            AuthApiError::WeakPassword => (
                StatusCode::BAD_REQUEST,
                "Password must be at least 8 characters",
            ),
            AuthApiError::InvalidUserId => (StatusCode::BAD_REQUEST, "Invalid user ID format"),
            AuthApiError::CannotDeleteSelf => {
                (StatusCode::BAD_REQUEST, "Cannot delete your own account")
            }
            AuthApiError::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::User;

    #[test]
    fn test_user_response_from_user() {
        let user = User {
            id: Uuid::new_v4(),
            username: "testuser".to_string(),
            password_hash: "hash123".to_string(),
            role: UserRole::Trader,
            api_key: None,
            created_at: "2025-01-01T00:00:00Z".to_string(),
        };

        let response = UserResponse::from_user(&user);
        assert_eq!(response.username, "testuser");
        assert_eq!(response.role, UserRole::Trader);
    }

    #[test]
    fn test_auth_api_error_responses() {
        let invalid_creds = AuthApiError::InvalidCredentials.into_response();
        assert_eq!(invalid_creds.status(), StatusCode::UNAUTHORIZED);

        let forbidden = AuthApiError::Forbidden.into_response();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let not_found = AuthApiError::UserNotFound.into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let conflict = AuthApiError::UserAlreadyExists.into_response();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn mask_key_preserves_only_a_short_tail() {
        let masked = mask_key("cp_live_0123456789abcdef");
        assert!(masked.ends_with("cdef"));
        assert!(!masked.contains("0123456789ab"));
    }
}
