//! REST surface handlers.
//!
//! Every write is validated against request DTOs (`dto.rs`); every response
//! either returns `Json<ApiResponse<T>>` on success or `AppError` (which
//! renders the `{error: {...}}` envelope itself).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;

use crate::api::dto::*;
use crate::api::AppState;
use crate::domain::*;
use crate::error::{AppError, FieldError};

fn validation(field: &str, message: &str) -> AppError {
    AppError::Validation {
        fields: vec![FieldError::new(field, message)],
    }
}

// --------------------------------------------------------------- instances

pub async fn list_instances(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<InstanceView>>>, AppError> {
    let instances = state.store.list_instances(q.is_active)?;
    Ok(Json(ApiResponse::new(instances)))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<InstanceView>>, AppError> {
    let instance = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    Ok(Json(ApiResponse::new(instance)))
}

pub async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<Json<ApiResponse<InstanceView>>, AppError> {
    if req.name.trim().is_empty() {
        return Err(validation("name", "name must not be empty"));
    }
    if req.host_url.trim().is_empty() {
        return Err(validation("host_url", "host_url must not be empty"));
    }

    let instance = Instance {
        id: 0,
        name: req.name,
        host_url: req.host_url,
        api_key: req.api_key,
        strategy_tag: req.strategy_tag,
        target_profit: req.target_profit.unwrap_or(5000.0),
        target_loss: req.target_loss.unwrap_or(2000.0),
        is_active: true,
        is_analyzer_mode: false,
        order_placement_disabled: false,
        health_status: HealthStatus::Unknown,
        last_health_check: None,
        current_balance: 0.0,
        realized_pnl: 0.0,
        unrealized_pnl: 0.0,
        total_pnl: 0.0,
        market_data_role: MarketDataRole::None,
        last_updated: Utc::now(),
    };

    let created = state.store.create_instance(&instance).map_err(|e| {
        if e.to_string().contains("UNIQUE") {
            AppError::Conflict("an instance with this host_url already exists".to_string())
        } else {
            AppError::from(e)
        }
    })?;
    Ok(Json(ApiResponse::new(created)))
}

pub async fn update_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateInstanceRequest>,
) -> Result<Json<ApiResponse<InstanceView>>, AppError> {
    let mut instance = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;

    if let Some(name) = req.name {
        instance.name = name;
    }
    if let Some(host_url) = req.host_url {
        instance.host_url = host_url;
    }
    if let Some(api_key) = req.api_key {
        instance.api_key = api_key;
    }
    if req.strategy_tag.is_some() {
        instance.strategy_tag = req.strategy_tag;
    }
    if let Some(tp) = req.target_profit {
        instance.target_profit = tp;
    }
    if let Some(tl) = req.target_loss {
        instance.target_loss = tl;
    }
    if let Some(active) = req.is_active {
        instance.is_active = active;
    }
    if let Some(disabled) = req.order_placement_disabled {
        instance.order_placement_disabled = disabled;
    }
    instance.last_updated = Utc::now();

    state.store.update_instance(&instance)?;
    Ok(Json(ApiResponse::new(instance)))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.store.delete_instance(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn refresh_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<InstanceView>>, AppError> {
    let instance = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    let broker = (state.broker_factory)(&instance);

    let funds = broker.funds().await?;
    let trades = broker.tradebook().await.ok();
    let positions = broker.positionbook().await.ok();
    let report = crate::pnl::aggregate(trades.as_deref(), positions.as_deref());
    state.store.update_instance_pnl(
        id,
        funds.availablecash,
        report.totals.realized,
        report.totals.unrealized,
    )?;
    state
        .store
        .update_instance_health(id, HealthStatus::Healthy, Utc::now(), Some(true))?;

    let refreshed = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    Ok(Json(ApiResponse::new(refreshed)))
}

pub async fn instance_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<InstanceView>>, AppError> {
    let instance = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    let broker = (state.broker_factory)(&instance);

    let (status, active) = match broker.ping().await {
        Ok(()) => (HealthStatus::Healthy, None),
        Err(_) => (HealthStatus::Unhealthy, Some(false)),
    };
    state
        .store
        .update_instance_health(id, status, Utc::now(), active)?;

    let refreshed = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    Ok(Json(ApiResponse::new(refreshed)))
}

pub async fn instance_pnl(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<crate::pnl::PnlReport>>, AppError> {
    let instance = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    let broker = (state.broker_factory)(&instance);
    let trades = broker.tradebook().await.ok();
    let positions = broker.positionbook().await.ok();
    let report = crate::pnl::aggregate(trades.as_deref(), positions.as_deref());
    Ok(Json(ApiResponse::new(report)))
}

pub async fn toggle_analyzer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ToggleAnalyzerBody>,
) -> Result<Json<ApiResponse<InstanceView>>, AppError> {
    let instance = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    let broker = (state.broker_factory)(&instance);
    broker.toggle_analyzer(body.mode).await?;
    state.store.set_instance_analyzer_mode(id, body.mode)?;

    let refreshed = state
        .store
        .get_instance(id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    Ok(Json(ApiResponse::new(refreshed)))
}

pub async fn test_connection(
    State(state): State<AppState>,
    Json(req): Json<TestConnectionRequest>,
) -> Result<Json<ApiResponse<TestConnectionResponse>>, AppError> {
    let probe = Instance {
        id: 0,
        name: "probe".to_string(),
        host_url: req.host_url,
        api_key: req.api_key,
        strategy_tag: None,
        target_profit: 0.0,
        target_loss: 0.0,
        is_active: true,
        is_analyzer_mode: false,
        order_placement_disabled: false,
        health_status: HealthStatus::Unknown,
        last_health_check: None,
        current_balance: 0.0,
        realized_pnl: 0.0,
        unrealized_pnl: 0.0,
        total_pnl: 0.0,
        market_data_role: MarketDataRole::None,
        last_updated: Utc::now(),
    };
    let broker = (state.broker_factory)(&probe);
    let result = match broker.ping().await {
        Ok(()) => TestConnectionResponse {
            reachable: true,
            message: "ping succeeded".to_string(),
        },
        Err(e) => TestConnectionResponse {
            reachable: false,
            message: e.to_string(),
        },
    };
    Ok(Json(ApiResponse::new(result)))
}

pub async fn test_apikey(
    State(state): State<AppState>,
    Json(req): Json<TestConnectionRequest>,
) -> Result<Json<ApiResponse<TestConnectionResponse>>, AppError> {
    let probe = Instance {
        id: 0,
        name: "probe".to_string(),
        host_url: req.host_url,
        api_key: req.api_key,
        strategy_tag: None,
        target_profit: 0.0,
        target_loss: 0.0,
        is_active: true,
        is_analyzer_mode: false,
        order_placement_disabled: false,
        health_status: HealthStatus::Unknown,
        last_health_check: None,
        current_balance: 0.0,
        realized_pnl: 0.0,
        unrealized_pnl: 0.0,
        total_pnl: 0.0,
        market_data_role: MarketDataRole::None,
        last_updated: Utc::now(),
    };
    let broker = (state.broker_factory)(&probe);
    let result = match broker.funds().await {
        Ok(_) => TestConnectionResponse {
            reachable: true,
            message: "api key accepted".to_string(),
        },
        Err(e) => TestConnectionResponse {
            reachable: false,
            message: e.to_string(),
        },
    };
    Ok(Json(ApiResponse::new(result)))
}

// -------------------------------------------------------------- watchlists

pub async fn list_watchlists(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Watchlist>>>, AppError> {
    Ok(Json(ApiResponse::new(state.store.list_watchlists()?)))
}

pub async fn get_watchlist(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Watchlist>>, AppError> {
    let w = state
        .store
        .get_watchlist(id)?
        .ok_or_else(|| AppError::NotFound("watchlist".to_string()))?;
    Ok(Json(ApiResponse::new(w)))
}

pub async fn create_watchlist(
    State(state): State<AppState>,
    Json(req): Json<CreateWatchlistRequest>,
) -> Result<Json<ApiResponse<Watchlist>>, AppError> {
    if req.name.trim().is_empty() {
        return Err(validation("name", "name must not be empty"));
    }
    let watchlist = Watchlist {
        id: 0,
        name: req.name,
        description: req.description,
        is_active: true,
    };
    let created = state.store.create_watchlist(&watchlist)?;
    Ok(Json(ApiResponse::new(created)))
}

pub async fn update_watchlist(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateWatchlistRequest>,
) -> Result<Json<ApiResponse<Watchlist>>, AppError> {
    let mut w = state
        .store
        .get_watchlist(id)?
        .ok_or_else(|| AppError::NotFound("watchlist".to_string()))?;
    if let Some(name) = req.name {
        w.name = name;
    }
    if req.description.is_some() {
        w.description = req.description;
    }
    if let Some(active) = req.is_active {
        w.is_active = active;
    }
    state.store.update_watchlist(&w)?;
    Ok(Json(ApiResponse::new(w)))
}

pub async fn delete_watchlist(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.store.delete_watchlist(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clone_watchlist(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CloneWatchlistRequest>,
) -> Result<Json<ApiResponse<Watchlist>>, AppError> {
    if req.new_name.trim().is_empty() {
        return Err(validation("new_name", "new_name must not be empty"));
    }
    let cloned = state.store.clone_watchlist(id, &req.new_name)?;
    Ok(Json(ApiResponse::new(cloned)))
}

// ------------------------------------------------------------------ symbols

pub async fn list_symbols(
    State(state): State<AppState>,
    Path(watchlist_id): Path<i64>,
) -> Result<Json<ApiResponse<Vec<WatchlistSymbol>>>, AppError> {
    Ok(Json(ApiResponse::new(state.store.list_symbols(watchlist_id)?)))
}

pub async fn create_symbol(
    State(state): State<AppState>,
    Path(watchlist_id): Path<i64>,
    Json(mut symbol): Json<WatchlistSymbol>,
) -> Result<Json<ApiResponse<WatchlistSymbol>>, AppError> {
    symbol.id = 0;
    symbol.watchlist_id = watchlist_id;
    if let Err(reason) = symbol.validate_fixed_qty() {
        return Err(validation("qty_value", &reason));
    }
    let created = state.store.create_symbol(&symbol)?;
    Ok(Json(ApiResponse::new(created)))
}

pub async fn delete_symbol(
    State(state): State<AppState>,
    Path((_watchlist_id, symbol_id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    state.store.delete_symbol(symbol_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------- bindings

pub async fn bind_instances(
    State(state): State<AppState>,
    Path(watchlist_id): Path<i64>,
    Json(req): Json<BindInstancesRequest>,
) -> Result<StatusCode, AppError> {
    state.store.bind_instances(watchlist_id, &req.instance_ids)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unbind_instances(
    State(state): State<AppState>,
    Path(watchlist_id): Path<i64>,
    Json(req): Json<BindInstancesRequest>,
) -> Result<StatusCode, AppError> {
    state.store.unbind_instances(watchlist_id, &req.instance_ids)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_bound_instances(
    State(state): State<AppState>,
    Path(watchlist_id): Path<i64>,
) -> Result<Json<ApiResponse<Vec<InstanceView>>>, AppError> {
    Ok(Json(ApiResponse::new(state.store.list_bound_instances(watchlist_id)?)))
}

// -------------------------------------------------------------------- orders

pub async fn place_orders(
    State(state): State<AppState>,
    Path(watchlist_id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ApiResponse<crate::broadcaster::BroadcastResult>>, AppError> {
    let symbol_ids: Vec<i64> = body
        .get("symbol_ids")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default();
    let action = body
        .get("action")
        .and_then(|v| v.as_str())
        .and_then(OrderAction::from_str)
        .ok_or_else(|| validation("action", "action must be one of BUY, SELL, SHORT, COVER, EXIT"))?;
    let option_type = body
        .get("option_type")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let req = crate::broadcaster::PlaceOrdersRequest {
        watchlist_id,
        symbol_ids,
        action,
        option_type,
        product_type_override: None,
        order_type_override: None,
        price_override: body.get("price").and_then(|v| v.as_f64()),
    };

    let broker_factory = state.broker_factory.clone();
    let result = state
        .broadcaster
        .place_orders(req, move |instance| (broker_factory)(instance))
        .await?;
    Ok(Json(ApiResponse::new(result)))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(q): Query<OrdersQuery>,
) -> Result<Json<ApiResponse<Vec<WatchlistOrder>>>, AppError> {
    let status = q.status.as_deref().and_then(OrderStatus::from_str);
    Ok(Json(ApiResponse::new(
        state.store.list_orders(status, q.instance_id)?,
    )))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let mut order = state
        .store
        .get_order(id)?
        .ok_or_else(|| AppError::NotFound("order".to_string()))?;
    let instance = state
        .store
        .get_instance(order.instance_id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    let broker = (state.broker_factory)(&instance);

    if let Some(order_id) = order.order_id.clone() {
        broker.cancel_order(&order_id).await?;
    }
    order.status = OrderStatus::Cancelled;
    order.updated_at = Utc::now();
    state.store.update_order(&order)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_all_orders(
    State(state): State<AppState>,
    Json(req): Json<CancelAllOrdersRequest>,
) -> Result<StatusCode, AppError> {
    let instance = state
        .store
        .get_instance(req.instance_id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    let broker = (state.broker_factory)(&instance);
    broker.cancel_all_order(req.strategy.as_deref()).await?;

    for mut order in state.store.list_open_orders_by_instance(req.instance_id)? {
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        state.store.update_order(&order)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------- positions

pub async fn list_positions(
    State(state): State<AppState>,
    Path(instance_id): Path<i64>,
) -> Result<Json<ApiResponse<Vec<WatchlistPosition>>>, AppError> {
    Ok(Json(ApiResponse::new(
        state.store.list_positions_by_instance(instance_id)?,
    )))
}

pub async fn close_position(
    State(state): State<AppState>,
    Path(instance_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let instance = state
        .store
        .get_instance(instance_id)?
        .ok_or_else(|| AppError::NotFound("instance".to_string()))?;
    let broker = (state.broker_factory)(&instance);
    broker.close_position(instance.strategy_tag_trimmed(), None).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn aggregate_pnl(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<crate::pnl::AccountTotals>>, AppError> {
    let instances = state.store.list_instances(None)?;
    let totals = crate::pnl::AccountTotals {
        realized: instances.iter().map(|i| i.realized_pnl).sum(),
        unrealized: instances.iter().map(|i| i.unrealized_pnl).sum(),
        total: instances.iter().map(|i| i.total_pnl).sum(),
    };
    Ok(Json(ApiResponse::new(totals)))
}

// -------------------------------------------------------------------- system

pub async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(serde::Serialize)]
pub struct PollingStatus {
    pub running: bool,
    pub reconciliation_interval_ms: u64,
}

pub async fn polling_status(
    State(state): State<AppState>,
) -> Json<ApiResponse<PollingStatus>> {
    Json(ApiResponse::new(PollingStatus {
        running: true,
        reconciliation_interval_ms: state.config.order_status_polling_interval_ms,
    }))
}
