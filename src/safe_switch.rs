//! Safe-Switch: the LIVE→ANALYZER flattening state machine.
//!
//! Five steps, run in order, each idempotent so a retried invocation never
//! double-executes a side effect: close any open position, cancel any
//! resting orders, verify flat via positionbook, toggle analyzer mode on,
//! verify the toggle stuck by reading analyzer state back. Concurrent
//! invocations for the same instance coalesce into one in-flight run
//! (single-flight), guarded by a `parking_lot::Mutex` over a small in-flight
//! set rather than per-instance locks.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::alerts::AlertSink;
use crate::broker::{BrokerClient, BrokerError};
use crate::db::Store;
use crate::domain::{AlertSeverity, Instance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeSwitchStep {
    ClosePosition,
    CancelAllOrders,
    VerifyFlat,
    ToggleAnalyzer,
    VerifyAnalyzerMode,
}

#[derive(Debug)]
pub struct SafeSwitchError {
    pub step: SafeSwitchStep,
    pub message: String,
}

impl std::fmt::Display for SafeSwitchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "safe-switch failed at {:?}: {}", self.step, self.message)
    }
}

pub struct SafeSwitch {
    store: Store,
    alerts: Arc<AlertSink>,
    in_flight: Mutex<HashSet<i64>>,
}

impl SafeSwitch {
    pub fn new(store: Store, alerts: Arc<AlertSink>) -> Self {
        Self {
            store,
            alerts,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run the 5-step flattening sequence for `instance` against `broker`.
    /// `reason` names the trigger (`"TARGET_PROFIT"`, `"MAX_LOSS"`, `"MANUAL"`,
    /// ...) and is carried on the success alert. Returns `Ok(true)` if this
    /// call executed the sequence, `Ok(false)` if another invocation was
    /// already in flight for this instance and this call was a no-op.
    pub async fn engage(
        &self,
        instance: &Instance,
        broker: &dyn BrokerClient,
        reason: &str,
    ) -> Result<bool, SafeSwitchError> {
        if instance.is_analyzer_mode {
            info!(instance_id = instance.id, "instance already in analyzer mode, skipping");
            return Ok(false);
        }

        {
            let mut guard = self.in_flight.lock();
            if !guard.insert(instance.id) {
                info!(instance_id = instance.id, "safe-switch already in flight, skipping");
                return Ok(false);
            }
        }

        let result = self.run_steps(instance, broker).await;

        self.in_flight.lock().remove(&instance.id);

        match result {
            Ok(()) => {
                let _ = self
                    .alerts
                    .raise(
                        "ANALYZER_AUTO_SWITCH",
                        AlertSeverity::Info,
                        "switched to analyzer mode",
                        &format!("instance {} switched to analyzer mode ({reason})", instance.id),
                        None,
                        Some(instance.id),
                        None,
                    )
                    .await;
                Ok(true)
            }
            Err(e) => {
                warn!(instance_id = instance.id, error = %e, "safe-switch failed");
                let severity = match e.step {
                    SafeSwitchStep::ClosePosition | SafeSwitchStep::CancelAllOrders => {
                        AlertSeverity::Warning
                    }
                    _ => AlertSeverity::Error,
                };
                let _ = self
                    .alerts
                    .raise(
                        "SAFE_SWITCH_FAILED",
                        severity,
                        "safe-switch failed",
                        &e.to_string(),
                        None,
                        Some(instance.id),
                        None,
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        instance: &Instance,
        broker: &dyn BrokerClient,
    ) -> Result<(), SafeSwitchError> {
        let strategy = instance.strategy_tag_trimmed();

        broker
            .close_position(strategy, None)
            .await
            .map_err(|e| step_error(SafeSwitchStep::ClosePosition, e))?;

        broker
            .cancel_all_order(strategy)
            .await
            .map_err(|e| step_error(SafeSwitchStep::CancelAllOrders, e))?;

        let positions = broker
            .positionbook()
            .await
            .map_err(|e| step_error(SafeSwitchStep::VerifyFlat, e))?;
        let still_open = positions.iter().any(|p| p.netqty != 0.0);
        if still_open {
            return Err(SafeSwitchError {
                step: SafeSwitchStep::VerifyFlat,
                message: "positionbook still reports a non-zero net quantity".to_string(),
            });
        }

        broker
            .toggle_analyzer(true)
            .await
            .map_err(|e| step_error(SafeSwitchStep::ToggleAnalyzer, e))?;

        let state = broker
            .analyzer()
            .await
            .map_err(|e| step_error(SafeSwitchStep::VerifyAnalyzerMode, e))?;
        if state.mode.to_lowercase() != "analyze" {
            return Err(SafeSwitchError {
                step: SafeSwitchStep::VerifyAnalyzerMode,
                message: format!("analyzer reports mode={}, expected analyze", state.mode),
            });
        }

        self.store
            .set_instance_analyzer_mode(instance.id, true)
            .map_err(|e| SafeSwitchError {
                step: SafeSwitchStep::VerifyAnalyzerMode,
                message: e.to_string(),
            })?;

        info!(instance_id = instance.id, "safe-switch completed");
        Ok(())
    }
}

fn step_error(step: SafeSwitchStep, err: BrokerError) -> SafeSwitchError {
    SafeSwitchError {
        step,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex as PMutex;

    struct FakeBroker {
        flat_after_close: bool,
        analyzer_mode_after_toggle: String,
        calls: PMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl BrokerClient for FakeBroker {
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
            self.calls.lock().push("positionbook");
            if self.flat_after_close {
                Ok(vec![])
            } else {
                Ok(vec![PositionbookEntry {
                    symbol: "SBIN".to_string(),
                    netqty: 10.0,
                    pnl: None,
                }])
            }
        }
        async fn analyzer(&self) -> Result<AnalyzerState, BrokerError> {
            Ok(AnalyzerState {
                mode: self.analyzer_mode_after_toggle.clone(),
            })
        }
        async fn toggle_analyzer(&self, _mode: bool) -> Result<(), BrokerError> {
            self.calls.lock().push("toggle_analyzer");
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
            self.calls.lock().push("cancel_all_order");
            Ok(())
        }
        async fn close_position(
            &self,
            _strategy: Option<&str>,
            _symbol: Option<&str>,
        ) -> Result<(), BrokerError> {
            self.calls.lock().push("close_position");
            Ok(())
        }
    }

    fn test_instance(id: i64) -> Instance {
        Instance {
            id,
            name: "i".to_string(),
            host_url: format!("http://host-{id}"),
            api_key: "k".to_string(),
            strategy_tag: None,
            target_profit: 1.0,
            target_loss: 1.0,
            is_active: true,
            is_analyzer_mode: false,
            order_placement_disabled: false,
            health_status: crate::domain::HealthStatus::Healthy,
            last_health_check: None,
            current_balance: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_pnl: 0.0,
            market_data_role: crate::domain::MarketDataRole::None,
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn happy_path_runs_all_steps_and_persists_analyzer_mode() {
        let store = Store::open_in_memory().unwrap();
        let instance = store.create_instance(&test_instance(1)).unwrap();
        let alerts = Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let switch = SafeSwitch::new(store.clone(), alerts);

        let broker = FakeBroker {
            flat_after_close: true,
            analyzer_mode_after_toggle: "analyze".to_string(),
            calls: PMutex::new(Vec::new()),
        };

        let executed = switch.engage(&instance, &broker, "TARGET_PROFIT").await.unwrap();
        assert!(executed);
        assert_eq!(
            *broker.calls.lock(),
            vec!["close_position", "cancel_all_order", "positionbook", "toggle_analyzer"]
        );
        let refreshed = store.get_instance(instance.id).unwrap().unwrap();
        assert!(refreshed.is_analyzer_mode);
    }

    #[tokio::test]
    async fn engage_on_already_analyzer_mode_instance_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        let mut instance = test_instance(3);
        instance.is_analyzer_mode = true;
        let instance = store.create_instance(&instance).unwrap();
        let alerts = Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let switch = SafeSwitch::new(store.clone(), alerts);

        let broker = FakeBroker {
            flat_after_close: true,
            analyzer_mode_after_toggle: "analyze".to_string(),
            calls: PMutex::new(Vec::new()),
        };

        let executed = switch.engage(&instance, &broker, "MANUAL").await.unwrap();
        assert!(!executed);
        assert!(broker.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn verify_flat_failure_aborts_before_toggling() {
        let store = Store::open_in_memory().unwrap();
        let instance = store.create_instance(&test_instance(2)).unwrap();
        let alerts = Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let switch = SafeSwitch::new(store.clone(), alerts);

        let broker = FakeBroker {
            flat_after_close: false,
            analyzer_mode_after_toggle: "analyze".to_string(),
            calls: PMutex::new(Vec::new()),
        };

        let result = switch.engage(&instance, &broker, "MAX_LOSS").await;
        assert!(result.is_err());
        assert!(!broker.calls.lock().contains(&"toggle_analyzer"));
        let refreshed = store.get_instance(instance.id).unwrap().unwrap();
        assert!(!refreshed.is_analyzer_mode);
    }
}
