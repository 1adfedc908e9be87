//! JWT-based authentication and role-gated access to the control-plane API.

pub mod api;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod user_store;

pub use api::AuthState;
pub use jwt::JwtHandler;
pub use middleware::{auth_middleware, require_trading_access};
pub use user_store::UserStore;
