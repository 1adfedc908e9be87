//! Order Broadcaster.
//!
//! Resolves target instances for a watchlist, resolves a per-leg quantity,
//! and fans a single logical order out to every target concurrently (bounded
//! parallelism, default one task per target, capped at `Config.bounded_parallelism`).
//! A failed leg never cancels its siblings; each leg is persisted
//! individually so a partial fan-out is durable.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::warn;

use crate::alerts::AlertSink;
use crate::broker::{BrokerClient, BrokerHandle, PlaceSmartOrderRequest};
use crate::db::Store;
use crate::domain::{
    AlertSeverity, Instance, OrderAction, OrderStatus, OrderType, ProductType, Rounding,
    WatchlistOrder, WatchlistSymbol,
};
use crate::error::AppError;

pub struct PlaceOrdersRequest {
    pub watchlist_id: i64,
    pub symbol_ids: Vec<i64>,
    pub action: OrderAction,
    pub option_type: Option<String>,
    pub product_type_override: Option<ProductType>,
    pub order_type_override: Option<OrderType>,
    pub price_override: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LegResult {
    pub instance_id: i64,
    pub symbol_id: i64,
    pub success: bool,
    pub order_id: Option<i64>,
    pub broker_order_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastSummary {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastResult {
    pub legs: Vec<LegResult>,
    pub summary: BroadcastSummary,
}

/// External collaborator resolving an options contract symbol from
/// `{underlying, option_type, strike_offset}` — stubbed for the
/// exchanges this deployment does not yet integrate.
pub trait ContractResolver: Send + Sync {
    fn resolve_option_contract(
        &self,
        underlying: &str,
        option_type: &str,
        strike_offset: &str,
    ) -> Result<String, String>;
}

pub struct UnsupportedContractResolver;

impl ContractResolver for UnsupportedContractResolver {
    fn resolve_option_contract(
        &self,
        underlying: &str,
        _option_type: &str,
        _strike_offset: &str,
    ) -> Result<String, String> {
        Err(format!(
            "no options contract resolver configured for {underlying}"
        ))
    }
}

pub struct Broadcaster {
    store: Store,
    alerts: Arc<AlertSink>,
    contracts: Arc<dyn ContractResolver>,
    bounded_parallelism: usize,
}

impl Broadcaster {
    pub fn new(store: Store, alerts: Arc<AlertSink>, bounded_parallelism: usize) -> Self {
        Self {
            store,
            alerts,
            contracts: Arc::new(UnsupportedContractResolver),
            bounded_parallelism: bounded_parallelism.max(1),
        }
    }

    pub fn with_contract_resolver(mut self, resolver: Arc<dyn ContractResolver>) -> Self {
        self.contracts = resolver;
        self
    }

    pub async fn place_orders(
        &self,
        req: PlaceOrdersRequest,
        broker_for: impl Fn(&Instance) -> BrokerHandle,
    ) -> Result<BroadcastResult, AppError> {
        let targets = self.resolve_targets(req.watchlist_id, req.action)?;
        if targets.is_empty() {
            return Ok(BroadcastResult {
                legs: vec![],
                summary: BroadcastSummary {
                    successful: 0,
                    failed: 0,
                    total: 0,
                },
            });
        }

        let mut tasks = Vec::new();
        for instance in &targets {
            for &symbol_id in &req.symbol_ids {
                let symbol = self
                    .store
                    .get_symbol(symbol_id)?
                    .ok_or_else(|| AppError::NotFound("symbol".to_string()))?;
                let broker = broker_for(instance);
                let instance = instance.clone();
                let action = req.action;
                let option_type = req.option_type.clone();
                let product_override = req.product_type_override;
                let order_type_override = req.order_type_override;
                let price_override = req.price_override;
                let store = self.store.clone();
                let contracts = self.contracts.clone();
                tasks.push(async move {
                    place_one_leg(
                        &store,
                        broker.as_ref(),
                        contracts.as_ref(),
                        &instance,
                        &symbol,
                        action,
                        option_type.as_deref(),
                        product_override,
                        order_type_override,
                        price_override,
                    )
                    .await
                });
            }
        }

        // Bounded concurrency: dispatch in batches of bounded_parallelism.
        let mut legs = Vec::with_capacity(tasks.len());
        let mut remaining = tasks;
        while !remaining.is_empty() {
            let batch_len = remaining.len().min(self.bounded_parallelism);
            let batch: Vec<_> = remaining.drain(..batch_len).collect();
            let results = join_all(batch).await;
            legs.extend(results);
        }

        let successful = legs.iter().filter(|l| l.success).count();
        let failed = legs.len() - successful;

        if failed > 0 && successful > 0 {
            self.alerts
                .raise(
                    "PARTIAL_ORDER_FAILURE",
                    AlertSeverity::Warning,
                    "partial order fan-out failure",
                    &format!("{failed} of {} legs failed", legs.len()),
                    None,
                    None,
                    Some(req.watchlist_id),
                )
                .await
                .map_err(AppError::from)?;
        }

        let total = legs.len();
        Ok(BroadcastResult {
            legs,
            summary: BroadcastSummary {
                successful,
                failed,
                total,
            },
        })
    }

    fn resolve_targets(&self, watchlist_id: i64, action: OrderAction) -> Result<Vec<Instance>, AppError> {
        let bound = self.store.list_bound_instances(watchlist_id)?;
        Ok(bound
            .into_iter()
            .filter(|i| i.is_active)
            .filter(|i| action == OrderAction::Exit || !i.is_analyzer_mode)
            .filter(|i| !i.order_placement_disabled)
            .collect())
    }
}

#[allow(clippy::too_many_arguments)]
async fn place_one_leg(
    store: &Store,
    broker: &dyn BrokerClient,
    contracts: &dyn ContractResolver,
    instance: &Instance,
    symbol: &WatchlistSymbol,
    action: OrderAction,
    option_type: Option<&str>,
    product_override: Option<ProductType>,
    order_type_override: Option<OrderType>,
    price_override: Option<f64>,
) -> LegResult {
    let resolved_symbol = match option_type {
        Some(opt) if symbol.can_trade_options => {
            let offset = symbol
                .options_strike_offset
                .map(|o| o.as_str().to_string())
                .unwrap_or_else(|| "ATM".to_string());
            match contracts.resolve_option_contract(&symbol.symbol, opt, &offset) {
                Ok(resolved) => resolved,
                Err(e) => {
                    return LegResult {
                        instance_id: instance.id,
                        symbol_id: symbol.id,
                        success: false,
                        order_id: None,
                        broker_order_id: None,
                        error: Some(e),
                    };
                }
            }
        }
        _ => symbol.symbol.clone(),
    };

    let quantity = match resolve_quantity(store, instance, symbol) {
        Ok(q) => q,
        Err(e) => {
            return LegResult {
                instance_id: instance.id,
                symbol_id: symbol.id,
                success: false,
                order_id: None,
                broker_order_id: None,
                error: Some(e.to_string()),
            };
        }
    };

    let mut order = WatchlistOrder {
        id: 0,
        watchlist_id: symbol.watchlist_id,
        instance_id: instance.id,
        symbol_id: symbol.id,
        action,
        quantity,
        order_type: order_type_override.unwrap_or(symbol.order_type),
        product_type: product_override.unwrap_or(symbol.product_type),
        price: price_override,
        trigger_price: None,
        status: OrderStatus::Pending,
        order_id: None,
        filled_quantity: 0,
        average_price: 0.0,
        position_id: None,
        message: None,
        placed_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };

    let persisted = match store.create_order(&order) {
        Ok(p) => p,
        Err(e) => {
            return LegResult {
                instance_id: instance.id,
                symbol_id: symbol.id,
                success: false,
                order_id: None,
                broker_order_id: None,
                error: Some(e.to_string()),
            };
        }
    };
    order.id = persisted.id;

    let dispatch_result = if action == OrderAction::Exit {
        broker
            .close_position(None, Some(&resolved_symbol))
            .await
            .map(|_| None)
    } else {
        broker
            .place_smart_order(PlaceSmartOrderRequest {
                symbol: resolved_symbol.clone(),
                exchange: symbol.exchange.clone(),
                action: action.as_str().to_string(),
                quantity,
                price_type: order.order_type.as_str().to_string(),
                product: order.product_type.as_str().to_string(),
                price: order.price,
                trigger_price: order.trigger_price,
                strategy: instance.strategy_tag_trimmed().map(str::to_string),
            })
            .await
            .map(|resp| Some(resp.orderid))
    };

    match dispatch_result {
        Ok(broker_order_id) => {
            order.status = OrderStatus::Open;
            order.order_id = broker_order_id.clone();
            order.updated_at = chrono::Utc::now();
            if let Err(e) = store.update_order(&order) {
                warn!(error = %e, "failed to persist order after successful dispatch");
            }
            LegResult {
                instance_id: instance.id,
                symbol_id: symbol.id,
                success: true,
                order_id: Some(order.id),
                broker_order_id,
                error: None,
            }
        }
        Err(e) => {
            order.status = OrderStatus::Rejected;
            order.message = Some(e.to_string());
            order.updated_at = chrono::Utc::now();
            if let Err(persist_err) = store.update_order(&order) {
                warn!(error = %persist_err, "failed to persist order after failed dispatch");
            }
            LegResult {
                instance_id: instance.id,
                symbol_id: symbol.id,
                success: false,
                order_id: Some(order.id),
                broker_order_id: None,
                error: Some(e.to_string()),
            }
        }
    }
}

fn resolve_quantity(store: &Store, instance: &Instance, symbol: &WatchlistSymbol) -> Result<i64, AppError> {
    use crate::domain::QtyMode;

    let raw = match symbol.qty_mode {
        QtyMode::Fixed => {
            return Ok(match symbol.qty_units {
                Some(crate::domain::QtyUnits::Lots) => {
                    (symbol.qty_value * symbol.lot_size as f64).round() as i64
                }
                _ => symbol.qty_value.round() as i64,
            });
        }
        QtyMode::Capital => {
            let ltp = latest_ltp(store, symbol)?;
            symbol.qty_value / ltp
        }
        QtyMode::FundsPercent => {
            let ltp = latest_ltp(store, symbol)?;
            (symbol.qty_value / 100.0) * instance.current_balance / ltp
        }
    };

    let clamped = clamp_quantity(raw, symbol.min_qty_per_click, symbol.max_qty_per_click);
    Ok(symbol.rounding.apply(clamped, symbol.lot_size))
}

fn latest_ltp(store: &Store, symbol: &WatchlistSymbol) -> Result<f64, AppError> {
    store
        .get_latest_market_data(&symbol.exchange, &symbol.symbol)
        .map_err(AppError::from)?
        .map(|row| row.ltp)
        .ok_or_else(|| AppError::LtpUnavailable(symbol.symbol.clone()))
}

fn clamp_quantity(raw: f64, min: Option<i64>, max: Option<i64>) -> f64 {
    let mut q = raw;
    if let Some(min) = min {
        q = q.max(min as f64);
    }
    if let Some(max) = max {
        q = q.min(max as f64);
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_symbol() -> WatchlistSymbol {
        WatchlistSymbol {
            id: 1,
            watchlist_id: 1,
            exchange: "NSE".to_string(),
            symbol: "SBIN".to_string(),
            token: None,
            lot_size: 1,
            qty_mode: crate::domain::QtyMode::Fixed,
            qty_value: 10.0,
            qty_units: Some(crate::domain::QtyUnits::Units),
            min_qty_per_click: None,
            max_qty_per_click: None,
            capital_ceiling_per_trade: None,
            contract_multiplier: 1.0,
            rounding: Rounding::FloorToLot,
            product_type: ProductType::Mis,
            order_type: OrderType::Market,
            can_trade_equity: true,
            can_trade_futures: false,
            can_trade_options: false,
            options_strike_offset: None,
            options_expiry_mode: None,
            target_type: crate::domain::TargetType::None,
            target_value: None,
            sl_type: crate::domain::TargetType::None,
            sl_value: None,
            ts_type: crate::domain::TargetType::None,
            ts_value: None,
            trailing_activation_type: crate::domain::TrailingActivationType::Immediate,
            trailing_activation_value: None,
            max_position_size: None,
            max_instances: None,
            is_enabled: true,
        }
    }

    #[test]
    fn fixed_units_quantity_resolves_directly() {
        let store = Store::open_in_memory().unwrap();
        let instance = Instance {
            id: 1,
            name: "i".into(),
            host_url: "http://h".into(),
            api_key: "k".into(),
            strategy_tag: None,
            target_profit: 0.0,
            target_loss: 0.0,
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
            last_updated: chrono::Utc::now(),
        };
        let symbol = test_symbol();
        let qty = resolve_quantity(&store, &instance, &symbol).unwrap();
        assert_eq!(qty, 10);
    }

    #[test]
    fn capital_mode_without_ltp_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let instance = Instance {
            id: 1,
            name: "i".into(),
            host_url: "http://h".into(),
            api_key: "k".into(),
            strategy_tag: None,
            target_profit: 0.0,
            target_loss: 0.0,
            is_active: true,
            is_analyzer_mode: false,
            order_placement_disabled: false,
            health_status: crate::domain::HealthStatus::Healthy,
            last_health_check: None,
            current_balance: 10000.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_pnl: 0.0,
            market_data_role: crate::domain::MarketDataRole::None,
            last_updated: chrono::Utc::now(),
        };
        let mut symbol = test_symbol();
        symbol.qty_mode = crate::domain::QtyMode::Capital;
        let result = resolve_quantity(&store, &instance, &symbol);
        assert!(matches!(result, Err(AppError::LtpUnavailable(_))));
    }
}
