//! Instance Orchestrator.
//!
//! Spawns three periodic loops per registered instance: health (5 min),
//! P&L refresh (2 min) and order reconciliation (5 s, delegated to the reconciler).
//! Loops for one instance are serialized against each other (driven off a
//! single `tokio::select!` per instance) but instances run concurrently.
//! Shutdown is cooperative: a `watch` channel signals cancellation and each
//! loop finishes its in-flight request before exiting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::alerts::AlertSink;
use crate::broker::BrokerHandle;
use crate::db::Store;
use crate::domain::{HealthStatus, Instance};
use crate::pnl;
use crate::reconciler::Reconciler;
use crate::safe_switch::SafeSwitch;

pub struct OrchestratorConfig {
    pub health_check_interval: Duration,
    pub pnl_refresh_interval: Duration,
    pub reconciliation_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(300),
            pnl_refresh_interval: Duration::from_secs(120),
            reconciliation_interval: Duration::from_secs(5),
        }
    }
}

const DEFAULT_TARGET_PROFIT: f64 = 5000.0;
const DEFAULT_TARGET_LOSS: f64 = 2000.0;

pub struct Orchestrator {
    store: Store,
    alerts: Arc<AlertSink>,
    safe_switch: Arc<SafeSwitch>,
    reconciler: Arc<Reconciler>,
    config: OrchestratorConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        alerts: Arc<AlertSink>,
        safe_switch: Arc<SafeSwitch>,
        reconciler: Arc<Reconciler>,
        config: OrchestratorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            alerts,
            safe_switch,
            reconciler,
            config,
            shutdown_tx,
        }
    }

    /// Spawn the three loops for one instance, keyed off `broker_for`. The
    /// caller owns the returned join handle set; dropping them without
    /// awaiting abandons the tasks (use `shutdown` first).
    pub fn spawn_instance(
        &self,
        instance_id: i64,
        broker_for: impl Fn() -> BrokerHandle + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let alerts = self.alerts.clone();
        let safe_switch = self.safe_switch.clone();
        let reconciler = self.reconciler.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let health_period = self.config.health_check_interval;
        let pnl_period = self.config.pnl_refresh_interval;
        let reconcile_period = self.config.reconciliation_interval;

        tokio::spawn(async move {
            let mut health_tick = interval(health_period);
            health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut pnl_tick = interval(pnl_period);
            pnl_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut reconcile_tick = interval(reconcile_period);
            reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = health_tick.tick() => {
                        let broker = broker_for();
                        run_health_check(&store, &alerts, instance_id, broker.as_ref()).await;
                    }
                    _ = pnl_tick.tick() => {
                        let broker = broker_for();
                        run_pnl_refresh(&store, &safe_switch, instance_id, broker).await;
                    }
                    _ = reconcile_tick.tick() => {
                        let broker = broker_for();
                        if let Err(e) = reconciler.reconcile_instance(instance_id, broker.as_ref()).await {
                            warn!(instance_id, error = %e, "reconciliation pass failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!(instance_id, "orchestrator loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_health_check(store: &Store, alerts: &AlertSink, instance_id: i64, broker: &dyn crate::broker::BrokerClient) {
    let now = chrono::Utc::now();
    match broker.ping().await {
        Ok(()) => {
            if let Err(e) = store.update_instance_health(instance_id, HealthStatus::Healthy, now, None) {
                warn!(instance_id, error = %e, "failed to persist health check");
            }
        }
        Err(e) => {
            warn!(instance_id, error = %e, "health check failed, marking unhealthy");
            if let Err(db_err) =
                store.update_instance_health(instance_id, HealthStatus::Unhealthy, now, Some(false))
            {
                warn!(instance_id, error = %db_err, "failed to persist health check failure");
            }
            let _ = alerts
                .raise(
                    "INSTANCE_OFFLINE",
                    crate::domain::AlertSeverity::Warning,
                    "instance offline",
                    &format!("instance {instance_id} failed ping: {e}"),
                    None,
                    Some(instance_id),
                    None,
                )
                .await;
        }
    }
}

async fn run_pnl_refresh(
    store: &Store,
    safe_switch: &Arc<SafeSwitch>,
    instance_id: i64,
    broker: BrokerHandle,
) {
    let Ok(Some(instance)) = store.get_instance(instance_id) else {
        return;
    };

    let funds = match broker.funds().await {
        Ok(f) => f,
        Err(e) => {
            warn!(instance_id, error = %e, "funds call failed, suppressing threshold evaluation");
            let _ = store.update_instance_health(
                instance_id,
                HealthStatus::Unhealthy,
                chrono::Utc::now(),
                None,
            );
            return;
        }
    };

    let trades = broker.tradebook().await.ok();
    let positions = broker.positionbook().await.ok();
    let report = pnl::aggregate(trades.as_deref(), positions.as_deref());

    if let Err(e) = store.update_instance_pnl(
        instance_id,
        funds.availablecash,
        report.totals.realized,
        report.totals.unrealized,
    ) {
        warn!(instance_id, error = %e, "failed to persist P&L refresh");
        return;
    }

    evaluate_thresholds(store, safe_switch, &instance, report.totals.total, broker).await;
}

async fn evaluate_thresholds(
    _store: &Store,
    safe_switch: &Arc<SafeSwitch>,
    instance: &Instance,
    total_pnl: f64,
    broker: BrokerHandle,
) {
    if instance.is_analyzer_mode {
        return;
    }

    let target_profit = if instance.target_profit > 0.0 {
        instance.target_profit
    } else {
        DEFAULT_TARGET_PROFIT
    };
    let target_loss = if instance.target_loss > 0.0 {
        instance.target_loss
    } else {
        DEFAULT_TARGET_LOSS
    };

    let reason = if total_pnl >= target_profit {
        Some("TARGET_PROFIT")
    } else if total_pnl <= -target_loss.abs() {
        Some("MAX_LOSS")
    } else {
        None
    };

    if let Some(reason) = reason {
        if let Err(e) = safe_switch.engage(instance, broker.as_ref(), reason).await {
            warn!(instance_id = instance.id, error = %e, "safe-switch engagement failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSink;
    use crate::broker::*;
    use crate::db::Store;
    use async_trait::async_trait;
    use parking_lot::Mutex as PMutex;

    struct FlatBroker {
        toggled: Arc<PMutex<bool>>,
    }

    #[async_trait]
    impl BrokerClient for FlatBroker {
        async fn ping(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn funds(&self) -> Result<FundsData, BrokerError> {
            Ok(FundsData::default())
        }
        async fn orderbook(&self) -> Result<OrderbookResponse, BrokerError> {
            Ok(vec![])
        }
        async fn tradebook(&self) -> Result<TradebookResponse, BrokerError> {
            Ok(vec![])
        }
        async fn positionbook(&self) -> Result<PositionbookResponse, BrokerError> {
            Ok(vec![])
        }
        async fn analyzer(&self) -> Result<AnalyzerState, BrokerError> {
            Ok(AnalyzerState { mode: "analyze".to_string() })
        }
        async fn toggle_analyzer(&self, _mode: bool) -> Result<(), BrokerError> {
            *self.toggled.lock() = true;
            Ok(())
        }
        async fn place_smart_order(
            &self,
            _req: PlaceSmartOrderRequest,
        ) -> Result<PlaceSmartOrderResponse, BrokerError> {
            unimplemented!()
        }
        async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn cancel_all_order(&self, _strategy: Option<&str>) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn close_position(
            &self,
            _strategy: Option<&str>,
            _symbol: Option<&str>,
        ) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn test_instance(target_profit: f64, target_loss: f64) -> Instance {
        Instance {
            id: 1,
            name: "i".to_string(),
            host_url: "http://host".to_string(),
            api_key: "k".to_string(),
            strategy_tag: None,
            target_profit,
            target_loss,
            is_active: true,
            is_analyzer_mode: false,
            order_placement_disabled: false,
            health_status: HealthStatus::Healthy,
            last_health_check: None,
            current_balance: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_pnl: 0.0,
            market_data_role: crate::domain::MarketDataRole::None,
            last_updated: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn pnl_at_or_above_target_profit_engages_safe_switch() {
        let store = Store::open_in_memory().unwrap();
        let instance = store.create_instance(&test_instance(5000.0, 2000.0)).unwrap();
        let alerts = Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let safe_switch = Arc::new(SafeSwitch::new(store.clone(), alerts));
        let broker: BrokerHandle = Arc::new(FlatBroker { toggled: Arc::new(PMutex::new(false)) });

        evaluate_thresholds(&store, &safe_switch, &instance, 5000.0, broker).await;

        let refreshed = store.get_instance(instance.id).unwrap().unwrap();
        assert!(refreshed.is_analyzer_mode);
    }

    #[tokio::test]
    async fn pnl_at_or_below_max_loss_engages_safe_switch() {
        let store = Store::open_in_memory().unwrap();
        let instance = store.create_instance(&test_instance(5000.0, 2000.0)).unwrap();
        let alerts = Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let safe_switch = Arc::new(SafeSwitch::new(store.clone(), alerts));
        let broker: BrokerHandle = Arc::new(FlatBroker { toggled: Arc::new(PMutex::new(false)) });

        evaluate_thresholds(&store, &safe_switch, &instance, -2000.0, broker).await;

        let refreshed = store.get_instance(instance.id).unwrap().unwrap();
        assert!(refreshed.is_analyzer_mode);
    }

    #[tokio::test]
    async fn pnl_within_bounds_does_not_engage() {
        let store = Store::open_in_memory().unwrap();
        let instance = store.create_instance(&test_instance(5000.0, 2000.0)).unwrap();
        let alerts = Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let safe_switch = Arc::new(SafeSwitch::new(store.clone(), alerts));
        let broker: BrokerHandle = Arc::new(FlatBroker { toggled: Arc::new(PMutex::new(false)) });

        evaluate_thresholds(&store, &safe_switch, &instance, 100.0, broker).await;

        let refreshed = store.get_instance(instance.id).unwrap().unwrap();
        assert!(!refreshed.is_analyzer_mode);
    }

    #[tokio::test]
    async fn analyzer_mode_instance_is_never_re_evaluated() {
        let store = Store::open_in_memory().unwrap();
        let mut raw = test_instance(5000.0, 2000.0);
        raw.is_analyzer_mode = true;
        let instance = store.create_instance(&raw).unwrap();
        let alerts = Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let safe_switch = Arc::new(SafeSwitch::new(store.clone(), alerts));
        let toggled = Arc::new(PMutex::new(false));
        let broker: BrokerHandle = Arc::new(FlatBroker { toggled: toggled.clone() });

        evaluate_thresholds(&store, &safe_switch, &instance, 999_999.0, broker).await;

        assert!(!*toggled.lock());
    }
}
