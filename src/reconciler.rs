//! Order/Position Reconciler.
//!
//! Polls one `orderbook` per instance, maps upstream order status onto the
//! local `OrderStatus` taxonomy, drives order/position transitions, and
//! evaluates trailing-stop activation and exit triggers. Exit triggers are
//! evaluated in a fixed order per position: target, then stop-loss, then
//! trailing stop — the first one that fires wins for that tick.

use std::sync::Arc;

use tracing::{info, warn};

use crate::alerts::AlertSink;
use crate::broadcaster::{Broadcaster, PlaceOrdersRequest};
use crate::broker::{BrokerClient, BrokerFactory, OrderbookEntry};
use crate::db::Store;
use crate::domain::{
    AlertSeverity, Direction, ExitReason, OrderAction, OrderStatus, PositionStatus, TargetType,
    TrailingActivationType, WatchlistOrder, WatchlistPosition,
};

pub struct Reconciler {
    store: Store,
    alerts: Arc<AlertSink>,
    broadcaster: Arc<Broadcaster>,
    broker_factory: BrokerFactory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    Target,
    StopLoss,
    TrailingStop,
}

impl Reconciler {
    pub fn new(
        store: Store,
        alerts: Arc<AlertSink>,
        broadcaster: Arc<Broadcaster>,
        broker_factory: BrokerFactory,
    ) -> Self {
        Self {
            store,
            alerts,
            broadcaster,
            broker_factory,
        }
    }

    /// Reconcile all non-terminal orders for one instance against its
    /// upstream orderbook, then re-evaluate exit triggers on open positions
    /// against a fresh LTP.
    pub async fn reconcile_instance(
        &self,
        instance_id: i64,
        broker: &dyn BrokerClient,
    ) -> anyhow::Result<()> {
        let open_orders = self.store.list_open_orders_by_instance(instance_id)?;
        if !open_orders.is_empty() {
            let orderbook = broker.orderbook().await?;
            for order in open_orders {
                self.reconcile_order(&order, &orderbook).await?;
            }
        }

        for mut position in self.store.list_open_positions_by_instance(instance_id)? {
            let Some(symbol) = self.store.get_symbol(position.symbol_id)? else {
                warn!(position_id = position.id, "symbol missing for open position, skipping exit evaluation");
                continue;
            };
            let Some(market_data) = self
                .store
                .get_latest_market_data(&symbol.exchange, &symbol.symbol)?
            else {
                continue;
            };

            let trigger = self.update_trailing_and_evaluate(
                &mut position,
                market_data.ltp,
                symbol.ts_type,
                symbol.ts_value,
                symbol.trailing_activation_type,
                symbol.trailing_activation_value,
            )?;

            if let Some(trigger) = trigger {
                self.issue_exit(&mut position, trigger).await;
            }
        }

        Ok(())
    }

    /// Record the trigger's reason on the position and broadcast an EXIT for
    /// its symbol. The position itself transitions to `Closed` once the
    /// resulting order fills, via `apply_fill_to_position`.
    async fn issue_exit(&self, position: &mut WatchlistPosition, trigger: ExitTrigger) {
        position.exit_reason = Some(exit_reason_for(trigger));
        if let Err(e) = self.store.update_position(position) {
            warn!(position_id = position.id, error = %e, "failed to persist exit trigger reason");
        }

        let req = PlaceOrdersRequest {
            watchlist_id: position.watchlist_id,
            symbol_ids: vec![position.symbol_id],
            action: OrderAction::Exit,
            option_type: None,
            product_type_override: None,
            order_type_override: None,
            price_override: None,
        };

        let broker_factory = self.broker_factory.clone();
        match self
            .broadcaster
            .place_orders(req, move |instance| (broker_factory)(instance))
            .await
        {
            Ok(result) => {
                info!(
                    position_id = position.id,
                    trigger = ?trigger,
                    legs = result.summary.total,
                    "exit trigger broadcast"
                );
            }
            Err(e) => {
                warn!(position_id = position.id, trigger = ?trigger, error = %e, "failed to broadcast exit trigger");
            }
        }
    }

    async fn reconcile_order(
        &self,
        order: &WatchlistOrder,
        orderbook: &[OrderbookEntry],
    ) -> anyhow::Result<()> {
        let Some(order_id) = order.order_id.as_deref() else {
            return Ok(());
        };
        let Some(upstream) = orderbook.iter().find(|e| e.orderid == order_id) else {
            warn!(order_id, "order missing from upstream orderbook, marking cancelled");
            let mut updated = order.clone();
            updated.status = OrderStatus::Cancelled;
            updated.updated_at = chrono::Utc::now();
            self.store.update_order(&updated)?;
            return Ok(());
        };

        let new_status = OrderStatus::from_upstream(&upstream.status);
        if new_status == order.status {
            return Ok(());
        }

        let mut updated = order.clone();
        updated.status = new_status;
        updated.filled_quantity = upstream.fillshares as i64;
        updated.average_price = upstream.avgprice;
        updated.updated_at = chrono::Utc::now();
        self.store.update_order(&updated)?;

        match new_status {
            OrderStatus::Complete => {
                info!(order_id, "order filled");
                self.apply_fill_to_position(&updated).await?;
            }
            OrderStatus::Rejected => {
                self.apply_rejection_to_position(&updated).await?;
                self.alerts
                    .raise(
                        "ORDER_REJECTED",
                        AlertSeverity::Error,
                        "order rejected",
                        &format!("order {order_id} rejected by broker"),
                        None,
                        Some(order.instance_id),
                        Some(order.watchlist_id),
                    )
                    .await?;
            }
            _ => {}
        }

        Ok(())
    }

    async fn apply_fill_to_position(&self, order: &WatchlistOrder) -> anyhow::Result<()> {
        let Some(position_id) = order.position_id else {
            return Ok(());
        };
        let Some(mut position) = self.store.get_position(position_id)? else {
            return Ok(());
        };

        if order.action == OrderAction::Exit || order.action == OrderAction::Cover {
            let exit_price = order.average_price;
            let pnl = match position.direction {
                Direction::Long => (exit_price - position.entry_price) * position.quantity as f64,
                Direction::Short => (position.entry_price - exit_price) * position.quantity as f64,
            };
            let reason = position.exit_reason.unwrap_or(ExitReason::Manual);
            close_position_record(&mut position, exit_price, reason);
            self.store.update_position(&position)?;
            self.alerts
                .raise(
                    "ORDER_COMPLETED",
                    AlertSeverity::Info,
                    "order filled",
                    &format!("exit order filled at {exit_price}, pnl={pnl:.2}"),
                    None,
                    Some(order.instance_id),
                    Some(order.watchlist_id),
                )
                .await?;
            self.alerts
                .raise(
                    "POSITION_CLOSED",
                    AlertSeverity::Info,
                    "position closed",
                    &format!("position {position_id} closed via manual exit"),
                    None,
                    Some(order.instance_id),
                    Some(order.watchlist_id),
                )
                .await?;
        } else {
            position.entry_price = order.average_price;
            position.current_price = order.average_price;
            position.highest_price_seen = order.average_price;
            position.lowest_price_seen = order.average_price;
            position.status = PositionStatus::Open;
            self.store.update_position(&position)?;
            self.alerts
                .raise(
                    "ORDER_COMPLETED",
                    AlertSeverity::Info,
                    "order filled",
                    &format!("entry order filled at {}", order.average_price),
                    None,
                    Some(order.instance_id),
                    Some(order.watchlist_id),
                )
                .await?;
        }

        Ok(())
    }

    async fn apply_rejection_to_position(&self, order: &WatchlistOrder) -> anyhow::Result<()> {
        let Some(position_id) = order.position_id else {
            return Ok(());
        };
        let Some(mut position) = self.store.get_position(position_id)? else {
            return Ok(());
        };
        if order.action != OrderAction::Exit {
            position.status = PositionStatus::Failed;
            position.exit_reason = Some(ExitReason::OrderRejected);
            self.store.update_position(&position)?;
        }
        Ok(())
    }

    /// Update trailing-stop state for a position given a fresh LTP, then
    /// evaluate exit triggers target -> stop-loss -> trailing stop.
    pub fn update_trailing_and_evaluate(
        &self,
        position: &mut WatchlistPosition,
        ltp: f64,
        ts_type: TargetType,
        ts_value: Option<f64>,
        activation_type: TrailingActivationType,
        activation_value: Option<f64>,
    ) -> anyhow::Result<Option<ExitTrigger>> {
        position.current_price = ltp;
        match position.direction {
            Direction::Long => {
                if ltp > position.highest_price_seen {
                    position.highest_price_seen = ltp;
                }
            }
            Direction::Short => {
                if position.lowest_price_seen == 0.0 || ltp < position.lowest_price_seen {
                    position.lowest_price_seen = ltp;
                }
            }
        }

        if let (Some(ts_value), false) = (ts_value, ts_type == TargetType::None) {
            self.maybe_activate_trailing(position, ts_value, activation_type, activation_value);
            self.maybe_advance_trailing(position, ts_type, ts_value);
        }

        self.store.update_position(position)?;
        let trigger = self.check_exit_triggers(position);
        Ok(trigger)
    }

    fn maybe_activate_trailing(
        &self,
        position: &mut WatchlistPosition,
        ts_value: f64,
        activation_type: TrailingActivationType,
        activation_value: Option<f64>,
    ) {
        if position.trailing_activated {
            return;
        }

        let activated = match activation_type {
            TrailingActivationType::Immediate => true,
            TrailingActivationType::AfterTarget => position
                .target_price
                .map(|target| match position.direction {
                    Direction::Long => position.current_price >= target,
                    Direction::Short => position.current_price <= target,
                })
                .unwrap_or(false),
            TrailingActivationType::AfterMove => {
                let Some(activation_value) = activation_value else {
                    return;
                };
                let moved = match position.direction {
                    Direction::Long => position.current_price - position.entry_price,
                    Direction::Short => position.entry_price - position.current_price,
                };
                // The 100-threshold rule: values under 100 are a percentage of
                // entry price, values >= 100 are absolute points.
                let required_move = if activation_value < 100.0 {
                    position.entry_price * (activation_value / 100.0)
                } else {
                    activation_value
                };
                moved >= required_move
            }
        };

        if activated {
            position.trailing_activated = true;
            position.trailing_stop_price = Some(initial_trailing_stop(position, ts_value));
        }
    }

    fn maybe_advance_trailing(
        &self,
        position: &mut WatchlistPosition,
        ts_type: TargetType,
        ts_value: f64,
    ) {
        if !position.trailing_activated {
            return;
        }
        let candidate = trailing_stop_from_extreme(position, ts_type, ts_value);

        let should_adopt = match (position.direction, position.trailing_stop_price) {
            (Direction::Long, Some(current)) => candidate > current,
            (Direction::Short, Some(current)) => candidate < current,
            (_, None) => true,
        };

        if should_adopt {
            position.trailing_stop_price = Some(candidate);
        }
    }

    fn check_exit_triggers(&self, position: &WatchlistPosition) -> Option<ExitTrigger> {
        if let Some(target) = position.target_price {
            let hit = match position.direction {
                Direction::Long => position.current_price >= target,
                Direction::Short => position.current_price <= target,
            };
            if hit {
                return Some(ExitTrigger::Target);
            }
        }

        if let Some(sl) = position.sl_price {
            let hit = match position.direction {
                Direction::Long => position.current_price <= sl,
                Direction::Short => position.current_price >= sl,
            };
            if hit {
                return Some(ExitTrigger::StopLoss);
            }
        }

        if position.trailing_activated {
            if let Some(ts) = position.trailing_stop_price {
                let hit = match position.direction {
                    Direction::Long => position.current_price <= ts,
                    Direction::Short => position.current_price >= ts,
                };
                if hit {
                    return Some(ExitTrigger::TrailingStop);
                }
            }
        }

        None
    }
}

fn initial_trailing_stop(position: &WatchlistPosition, ts_value: f64) -> f64 {
    match position.direction {
        Direction::Long => position.highest_price_seen - ts_value,
        Direction::Short => position.lowest_price_seen + ts_value,
    }
}

fn trailing_stop_from_extreme(position: &WatchlistPosition, ts_type: TargetType, ts_value: f64) -> f64 {
    let offset = match ts_type {
        TargetType::Percentage => match position.direction {
            Direction::Long => position.highest_price_seen * (ts_value / 100.0),
            Direction::Short => position.lowest_price_seen * (ts_value / 100.0),
        },
        _ => ts_value,
    };
    match position.direction {
        Direction::Long => position.highest_price_seen - offset,
        Direction::Short => position.lowest_price_seen + offset,
    }
}

pub fn exit_reason_for(trigger: ExitTrigger) -> ExitReason {
    match trigger {
        ExitTrigger::Target => ExitReason::TargetHit,
        ExitTrigger::StopLoss => ExitReason::StopLoss,
        ExitTrigger::TrailingStop => ExitReason::TrailingStop,
    }
}

pub fn close_position_record(position: &mut WatchlistPosition, exit_price: f64, reason: ExitReason) {
    position.exit_price = Some(exit_price);
    position.status = PositionStatus::Closed;
    position.is_closed = true;
    position.exit_reason = Some(reason);
    position.exited_at = Some(chrono::Utc::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// A reconciler whose broadcaster/broker_factory are never exercised by
    /// tests that only call `update_trailing_and_evaluate`/`check_exit_triggers`
    /// directly.
    fn test_reconciler(store: Store, alerts: Arc<AlertSink>) -> Reconciler {
        let broadcaster = Arc::new(Broadcaster::new(store.clone(), alerts.clone(), 4));
        let broker_factory: BrokerFactory = Arc::new(|_: &crate::domain::Instance| {
            panic!("broker_factory should not be invoked by this test")
        });
        Reconciler::new(store, alerts, broadcaster, broker_factory)
    }

    fn long_position() -> WatchlistPosition {
        WatchlistPosition {
            id: 1,
            watchlist_id: 1,
            instance_id: 1,
            symbol_id: 1,
            direction: Direction::Long,
            quantity: 10,
            entry_price: 100.0,
            current_price: 100.0,
            exit_price: None,
            target_price: Some(120.0),
            sl_price: Some(90.0),
            trailing_stop_price: None,
            trailing_activated: false,
            highest_price_seen: 100.0,
            lowest_price_seen: 100.0,
            status: PositionStatus::Open,
            is_closed: false,
            exit_reason: None,
            entered_at: Utc::now(),
            exited_at: None,
        }
    }

    #[test]
    fn target_checked_before_trailing_stop() {
        let store = Store::open_in_memory().unwrap();
        let alerts = std::sync::Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let reconciler = test_reconciler(store, alerts);

        let mut position = long_position();
        position.trailing_activated = true;
        position.trailing_stop_price = Some(125.0); // would also fire
        position.current_price = 121.0;

        let trigger = reconciler.check_exit_triggers(&position);
        assert_eq!(trigger, Some(ExitTrigger::Target));
    }

    #[test]
    fn immediate_activation_sets_trailing_stop_on_first_tick() {
        let store = Store::open_in_memory().unwrap();
        let alerts = std::sync::Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let reconciler = test_reconciler(store, alerts);

        let mut position = long_position();
        let trigger = reconciler
            .update_trailing_and_evaluate(
                &mut position,
                110.0,
                TargetType::Points,
                Some(5.0),
                TrailingActivationType::Immediate,
                None,
            )
            .unwrap();

        assert!(position.trailing_activated);
        assert_eq!(position.trailing_stop_price, Some(105.0));
        assert!(trigger.is_none());
    }

    #[test]
    fn long_trailing_stop_only_ratchets_upward() {
        let store = Store::open_in_memory().unwrap();
        let alerts = std::sync::Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let reconciler = test_reconciler(store, alerts);

        let mut position = long_position();
        position.trailing_activated = true;
        position.trailing_stop_price = Some(108.0);
        position.highest_price_seen = 110.0;

        // LTP drops; highest_price_seen should stay, candidate ts is lower,
        // and the monotonicity rule must refuse to move the stop down.
        reconciler
            .update_trailing_and_evaluate(
                &mut position,
                107.0,
                TargetType::Points,
                Some(5.0),
                TrailingActivationType::Immediate,
                None,
            )
            .unwrap();

        assert_eq!(position.trailing_stop_price, Some(108.0));
    }

    #[test]
    fn after_move_activation_honors_100_threshold_as_percent_below_100() {
        let store = Store::open_in_memory().unwrap();
        let alerts = std::sync::Arc::new(AlertSink::with_logging_gateway(store.clone()));
        let reconciler = test_reconciler(store, alerts);

        let mut position = long_position();
        // 5 => 5% of entry_price(100) = 5 points of move required.
        reconciler
            .update_trailing_and_evaluate(
                &mut position,
                104.0,
                TargetType::Points,
                Some(2.0),
                TrailingActivationType::AfterMove,
                Some(5.0),
            )
            .unwrap();
        assert!(!position.trailing_activated);

        reconciler
            .update_trailing_and_evaluate(
                &mut position,
                106.0,
                TargetType::Points,
                Some(2.0),
                TrailingActivationType::AfterMove,
                Some(5.0),
            )
            .unwrap();
        assert!(position.trailing_activated);
    }
}
