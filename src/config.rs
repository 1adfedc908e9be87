//! Environment-driven startup configuration.
//!
//! Loaded once at startup via `Config::from_env()`: `dotenv` for local
//! `.env` loading, then explicit
//! `env::var(...).unwrap_or_else(...).parse().unwrap_or(...)` chains rather
//! than a derive-macro config crate. Fields that are required in production
//! (`APP_ENV=production`) fail fast instead of silently defaulting.

use anyhow::{bail, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub port: u16,
    pub base_url: String,

    pub db_path: String,
    pub auth_db_path: String,

    pub upstream_request_timeout: Duration,
    pub upstream_max_retries: u32,
    pub upstream_retry_delay_ms: u64,

    pub order_status_polling_interval_ms: u64,
    pub instance_health_check_interval_secs: u64,
    pub instance_pnl_refresh_interval_secs: u64,

    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub session_max_age_ms: i64,

    pub rate_limit_per_minute: u32,
    pub bounded_parallelism: usize,

    pub cors_origin: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let is_production = app_env == "production";

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let base_url = match env::var("BASE_URL") {
            Ok(v) => v,
            Err(_) if is_production => {
                bail!("BASE_URL is required when APP_ENV=production")
            }
            Err(_) => format!("http://localhost:{port}"),
        };

        let db_path =
            env::var("DB_PATH").unwrap_or_else(|_| "./control_plane.db".to_string());
        let auth_db_path =
            env::var("AUTH_DB_PATH").unwrap_or_else(|_| "./control_plane_auth.db".to_string());

        let upstream_request_timeout_ms: u64 = env::var("UPSTREAM_REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "15000".to_string())
            .parse()
            .unwrap_or(15000);

        let upstream_max_retries = env::var("UPSTREAM_MAX_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let upstream_retry_delay_ms = env::var("UPSTREAM_RETRY_DELAY_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .unwrap_or(2000);

        let order_status_polling_interval_ms = env::var("ORDER_STATUS_POLLING_INTERVAL_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        let instance_health_check_interval_secs = env::var("HEALTH_CHECK_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let instance_pnl_refresh_interval_secs = env::var("PNL_REFRESH_INTERVAL_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .unwrap_or(120);

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(v) => v,
            Err(_) if is_production => {
                bail!("JWT_SECRET is required when APP_ENV=production")
            }
            Err(_) => "dev-only-insecure-secret".to_string(),
        };

        let jwt_expiry_hours: i64 = env::var("JWT_EXPIRY_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .unwrap_or(24);

        let session_max_age_ms = env::var("SESSION_MAX_AGE_MS")
            .unwrap_or_else(|_| (jwt_expiry_hours * 3_600_000).to_string())
            .parse()
            .unwrap_or(jwt_expiry_hours * 3_600_000);

        let rate_limit_per_minute = env::var("RATE_LIMIT_PER_MINUTE")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .unwrap_or(120);

        let bounded_parallelism = env::var("BOUNDED_PARALLELISM")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .unwrap_or(16);

        let cors_origin = env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".to_string());
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        if is_production && jwt_secret == "dev-only-insecure-secret" {
            bail!("refusing to start in production with the default JWT_SECRET");
        }

        Ok(Self {
            app_env,
            port,
            base_url,
            db_path,
            auth_db_path,
            upstream_request_timeout: Duration::from_millis(upstream_request_timeout_ms),
            upstream_max_retries,
            upstream_retry_delay_ms,
            order_status_polling_interval_ms,
            instance_health_check_interval_secs,
            instance_pnl_refresh_interval_secs,
            jwt_secret,
            jwt_expiry_hours,
            session_max_age_ms,
            rate_limit_per_minute,
            bounded_parallelism,
            cors_origin,
            log_level,
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_without_env_in_development() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("APP_ENV");
        env::remove_var("BASE_URL");
        env::remove_var("JWT_SECRET");
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.bounded_parallelism, 16);
        assert!(!config.is_production());
    }

    #[test]
    fn production_without_jwt_secret_fails_fast() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("APP_ENV", "production");
        env::set_var("BASE_URL", "https://control.example.com");
        env::remove_var("JWT_SECRET");
        let result = Config::from_env();
        env::remove_var("APP_ENV");
        env::remove_var("BASE_URL");
        assert!(result.is_err());
    }
}
