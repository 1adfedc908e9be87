//! A versioned HTTP API over the domain modules.

pub mod dto;
pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::FromRef,
    middleware as axum_mw,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::alerts::AlertSink;
use crate::auth::{self, AuthState};
use crate::broadcaster::Broadcaster;
pub use crate::broker::BrokerFactory;
use crate::config::Config;
use crate::db::Store;
use crate::middleware::rate_limit::rate_limit_middleware;
use crate::middleware::{request_logging, RateLimitConfig, RateLimitLayer};
use crate::safe_switch::SafeSwitch;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<Config>,
    pub alerts: Arc<AlertSink>,
    pub safe_switch: Arc<SafeSwitch>,
    pub broadcaster: Arc<Broadcaster>,
    pub broker_factory: BrokerFactory,
    pub auth: AuthState,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

pub fn router(state: AppState) -> Router {
    let jwt_handler = state.auth.jwt_handler.clone();

    let trading_gate = || axum_mw::from_fn(auth::require_trading_access);

    let instances = Router::new()
        .route("/", get(handlers::list_instances))
        .route("/:id", get(handlers::get_instance))
        .route("/:id/pnl", get(handlers::instance_pnl))
        .merge(
            Router::new()
                .route("/", post(handlers::create_instance))
                .route(
                    "/:id",
                    put(handlers::update_instance).delete(handlers::delete_instance),
                )
                .route("/:id/refresh", post(handlers::refresh_instance))
                .route("/:id/health", post(handlers::instance_health))
                .route("/:id/analyzer/toggle", post(handlers::toggle_analyzer))
                .route("/test/connection", post(handlers::test_connection))
                .route("/test/apikey", post(handlers::test_apikey))
                .route_layer(trading_gate()),
        );

    let watchlists = Router::new()
        .route("/", get(handlers::list_watchlists))
        .route("/:id", get(handlers::get_watchlist))
        .route("/:id/symbols", get(handlers::list_symbols))
        .route("/:id/instances", get(handlers::list_bound_instances))
        .merge(
            Router::new()
                .route("/", post(handlers::create_watchlist))
                .route(
                    "/:id",
                    put(handlers::update_watchlist).delete(handlers::delete_watchlist),
                )
                .route("/:id/clone", post(handlers::clone_watchlist))
                .route("/:id/symbols", post(handlers::create_symbol))
                .route("/:id/symbols/:sid", delete(handlers::delete_symbol))
                .route(
                    "/:id/instances",
                    post(handlers::bind_instances).delete(handlers::unbind_instances),
                )
                .route("/:id/place-orders", post(handlers::place_orders))
                .route_layer(trading_gate()),
        );

    let orders = Router::new().route("/", get(handlers::list_orders)).merge(
        Router::new()
            .route("/:id/cancel", post(handlers::cancel_order))
            .route("/cancel-all", post(handlers::cancel_all_orders))
            .route_layer(trading_gate()),
    );

    let positions = Router::new()
        .route("/aggregate/pnl", get(handlers::aggregate_pnl))
        .route("/:instance_id", get(handlers::list_positions))
        .merge(
            Router::new()
                .route("/:instance_id/close", post(handlers::close_position))
                .route_layer(trading_gate()),
        );

    let polling = Router::new().route("/status", get(handlers::polling_status));

    let auth_routes = Router::new()
        .route("/login", post(auth::api::login))
        .route("/me", get(auth::api::get_current_user))
        .route(
            "/api-keys",
            get(auth::api::list_api_keys).post(auth::api::create_api_key),
        )
        .route("/api-keys/:id", delete(auth::api::revoke_api_key))
        .route_layer(axum_mw::from_fn_with_state(jwt_handler.clone(), auth::auth_middleware));

    let admin_routes = Router::new()
        .route("/users", get(auth::api::list_users).post(auth::api::create_user))
        .route("/users/:id", delete(auth::api::delete_user))
        .route_layer(axum_mw::from_fn_with_state(jwt_handler.clone(), auth::auth_middleware));

    let protected = Router::new()
        .nest("/instances", instances)
        .nest("/watchlists", watchlists)
        .nest("/orders", orders)
        .nest("/positions", positions)
        .nest("/polling", polling)
        .route_layer(axum_mw::from_fn_with_state(jwt_handler, auth::auth_middleware));

    let rate_limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: state.config.rate_limit_per_minute,
        window: std::time::Duration::from_secs(60),
        burst: (state.config.rate_limit_per_minute / 4).max(1),
    });

    let api_v1 = Router::new()
        .merge(protected)
        .nest("/auth", auth_routes)
        .nest("/admin", admin_routes)
        .layer(axum_mw::from_fn_with_state(rate_limiter, rate_limit_middleware));

    let cors = if state.config.cors_origin == "*" {
        CorsLayer::permissive()
    } else {
        CorsLayer::new().allow_origin(
            state
                .config
                .cors_origin
                .parse::<axum::http::HeaderValue>()
                .unwrap_or_else(|_| axum::http::HeaderValue::from_static("*")),
        )
    };

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_v1)
        .layer(axum_mw::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
