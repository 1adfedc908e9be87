//! Control-plane server entrypoint.
//!
//! Wires persistence, the broker-client factory, the business-logic
//! components (alerts, safe-switch, broadcaster, reconciler, orchestrator)
//! and the REST surface together, then serves until a shutdown signal
//! arrives. Shutdown is cooperative: stop accepting new connections, tell
//! the orchestrator to stop its per-instance loops, and give in-flight work
//! a bounded grace period before exiting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use control_plane::alerts::{AlertSink, LoggingGateway};
use control_plane::api::{self, AppState};
use control_plane::auth::{AuthState, JwtHandler, UserStore};
use control_plane::broadcaster::Broadcaster;
use control_plane::broker::{BrokerHandle, HttpBrokerClient};
use control_plane::config::Config;
use control_plane::db::Store;
use control_plane::domain::Instance;
use control_plane::orchestrator::{Orchestrator, OrchestratorConfig};
use control_plane::reconciler::Reconciler;
use control_plane::safe_switch::SafeSwitch;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn broker_for(instance: &Instance, config: &Config) -> BrokerHandle {
    Arc::new(HttpBrokerClient::new(
        instance.host_url.clone(),
        instance.api_key.clone(),
        config.upstream_request_timeout,
        config.upstream_max_retries,
        config.upstream_retry_delay_ms,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(app_env = %config.app_env, port = config.port, "starting control-plane");

    let store = Store::open(&config.db_path)?;
    let user_store = Arc::new(UserStore::new(&config.auth_db_path)?);
    let jwt_handler = Arc::new(JwtHandler::with_expiry(
        config.jwt_secret.clone(),
        config.jwt_expiry_hours,
    ));
    let auth = AuthState::new(
        user_store,
        jwt_handler,
        config.rate_limit_per_minute as usize,
    );

    let config = Arc::new(config);
    let broker_factory: api::BrokerFactory = {
        let config = config.clone();
        Arc::new(move |instance: &Instance| broker_for(instance, &config))
    };

    let alerts = Arc::new(AlertSink::new(store.clone(), Arc::new(LoggingGateway)));
    let safe_switch = Arc::new(SafeSwitch::new(store.clone(), alerts.clone()));
    let broadcaster = Arc::new(Broadcaster::new(
        store.clone(),
        alerts.clone(),
        config.bounded_parallelism,
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        alerts.clone(),
        broadcaster.clone(),
        broker_factory.clone(),
    ));

    let orchestrator_config = OrchestratorConfig {
        health_check_interval: Duration::from_secs(config.instance_health_check_interval_secs),
        pnl_refresh_interval: Duration::from_secs(config.instance_pnl_refresh_interval_secs),
        reconciliation_interval: Duration::from_millis(config.order_status_polling_interval_ms),
    };
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        alerts.clone(),
        safe_switch.clone(),
        reconciler.clone(),
        orchestrator_config,
    ));

    let mut instance_tasks = Vec::new();
    for instance in store.list_instances(None)? {
        let instance_id = instance.id;
        let config_for_loop = config.clone();
        let handle = orchestrator.spawn_instance(instance_id, move || {
            broker_for(&instance, &config_for_loop)
        });
        instance_tasks.push(handle);
    }
    info!(count = instance_tasks.len(), "spawned orchestrator loops for existing instances");

    let state = AppState {
        store,
        config: config.clone(),
        alerts,
        safe_switch,
        broadcaster,
        broker_factory,
        auth,
    };

    let router = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        error!(error = %e, "server exited with error");
    }

    info!("shutting down orchestrator loops");
    orchestrator.shutdown();
    let drain = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(instance_tasks)).await;
    if drain.is_err() {
        warn!("orchestrator loops did not finish within the shutdown grace period");
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
