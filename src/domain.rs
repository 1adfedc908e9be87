//! Core domain entities and value enums.
//!
//! These types mirror the persisted rows exactly: the `db` module reads and
//! writes them without any intermediate DTO layer, and the REST layer
//! serializes them directly (after stripping secrets).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of an instance as last observed by the orchestrator's health loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Whether an instance plays a role in supplying last-traded-price market data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketDataRole {
    None,
    Primary,
    Secondary,
}

impl MarketDataRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketDataRole::None => "none",
            MarketDataRole::Primary => "primary",
            MarketDataRole::Secondary => "secondary",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "primary" => MarketDataRole::Primary,
            "secondary" => MarketDataRole::Secondary,
            _ => MarketDataRole::None,
        }
    }
}

/// A registered upstream broker-API endpoint.
///
/// `api_key` is write-only from the operator boundary: it is loaded from the
/// database for outbound broker calls but must never be serialized back to a
/// REST response (see `api::dto::InstanceView`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    pub host_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub strategy_tag: Option<String>,
    pub target_profit: f64,
    pub target_loss: f64,
    pub is_active: bool,
    pub is_analyzer_mode: bool,
    pub order_placement_disabled: bool,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub current_balance: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub market_data_role: MarketDataRole,
    pub last_updated: DateTime<Utc>,
}

impl Instance {
    /// `strategy_tag` trimmed of whitespace, empty treated as absent (used by
    /// Safe-Switch steps 1-2, which only include `strategy` when non-empty).
    pub fn strategy_tag_trimmed(&self) -> Option<&str> {
        self.strategy_tag
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watchlist {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QtyMode {
    Fixed,
    Capital,
    FundsPercent,
}

impl QtyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QtyMode::Fixed => "fixed",
            QtyMode::Capital => "capital",
            QtyMode::FundsPercent => "funds_percent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(QtyMode::Fixed),
            "capital" => Some(QtyMode::Capital),
            "funds_percent" => Some(QtyMode::FundsPercent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QtyUnits {
    Units,
    Lots,
}

impl QtyUnits {
    pub fn as_str(&self) -> &'static str {
        match self {
            QtyUnits::Units => "units",
            QtyUnits::Lots => "lots",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "units" => Some(QtyUnits::Units),
            "lots" => Some(QtyUnits::Lots),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    FloorToLot,
    NearestLot,
    CeilToLot,
}

impl Rounding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rounding::FloorToLot => "floor_to_lot",
            Rounding::NearestLot => "nearest_lot",
            Rounding::CeilToLot => "ceil_to_lot",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "floor_to_lot" => Some(Rounding::FloorToLot),
            "nearest_lot" => Some(Rounding::NearestLot),
            "ceil_to_lot" => Some(Rounding::CeilToLot),
            _ => None,
        }
    }

    /// Apply the rounding rule against a lot size, returning a quantity that
    /// is a non-negative multiple of `lot_size`.
    pub fn apply(&self, raw: f64, lot_size: i64) -> i64 {
        let lot_size = lot_size.max(1) as f64;
        let lots = raw / lot_size;
        let rounded_lots = match self {
            Rounding::FloorToLot => lots.floor(),
            Rounding::NearestLot => lots.round(),
            Rounding::CeilToLot => lots.ceil(),
        };
        ((rounded_lots.max(0.0)) * lot_size).round() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductType {
    Mis,
    Cnc,
    Nrml,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Mis => "MIS",
            ProductType::Cnc => "CNC",
            ProductType::Nrml => "NRML",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MIS" => Some(ProductType::Mis),
            "CNC" => Some(ProductType::Cnc),
            "NRML" => Some(ProductType::Nrml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Sl,
    #[serde(rename = "SL-M")]
    SlM,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Sl => "SL",
            OrderType::SlM => "SL-M",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            "SL" => Some(OrderType::Sl),
            "SL-M" => Some(OrderType::SlM),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionsStrikeOffset {
    Itm2,
    Itm1,
    Atm,
    Otm1,
    Otm2,
}

impl OptionsStrikeOffset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionsStrikeOffset::Itm2 => "ITM2",
            OptionsStrikeOffset::Itm1 => "ITM1",
            OptionsStrikeOffset::Atm => "ATM",
            OptionsStrikeOffset::Otm1 => "OTM1",
            OptionsStrikeOffset::Otm2 => "OTM2",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ITM2" => Some(OptionsStrikeOffset::Itm2),
            "ITM1" => Some(OptionsStrikeOffset::Itm1),
            "ATM" => Some(OptionsStrikeOffset::Atm),
            "OTM1" => Some(OptionsStrikeOffset::Otm1),
            "OTM2" => Some(OptionsStrikeOffset::Otm2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    None,
    Percentage,
    Points,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::None => "NONE",
            TargetType::Percentage => "PERCENTAGE",
            TargetType::Points => "POINTS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(TargetType::None),
            "PERCENTAGE" => Some(TargetType::Percentage),
            "POINTS" => Some(TargetType::Points),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrailingActivationType {
    Immediate,
    AfterTarget,
    AfterMove,
}

impl TrailingActivationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrailingActivationType::Immediate => "IMMEDIATE",
            TrailingActivationType::AfterTarget => "AFTER_TARGET",
            TrailingActivationType::AfterMove => "AFTER_MOVE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IMMEDIATE" => Some(TrailingActivationType::Immediate),
            "AFTER_TARGET" => Some(TrailingActivationType::AfterTarget),
            "AFTER_MOVE" => Some(TrailingActivationType::AfterMove),
            _ => None,
        }
    }
}

/// A tradable symbol within a watchlist, with per-symbol sizing and exit rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistSymbol {
    pub id: i64,
    pub watchlist_id: i64,
    pub exchange: String,
    pub symbol: String,
    pub token: Option<String>,
    pub lot_size: i64,
    pub qty_mode: QtyMode,
    pub qty_value: f64,
    pub qty_units: Option<QtyUnits>,
    pub min_qty_per_click: Option<i64>,
    pub max_qty_per_click: Option<i64>,
    pub capital_ceiling_per_trade: Option<f64>,
    pub contract_multiplier: f64,
    pub rounding: Rounding,
    pub product_type: ProductType,
    pub order_type: OrderType,
    pub can_trade_equity: bool,
    pub can_trade_futures: bool,
    pub can_trade_options: bool,
    pub options_strike_offset: Option<OptionsStrikeOffset>,
    pub options_expiry_mode: Option<String>,
    pub target_type: TargetType,
    pub target_value: Option<f64>,
    pub sl_type: TargetType,
    pub sl_value: Option<f64>,
    pub ts_type: TargetType,
    pub ts_value: Option<f64>,
    pub trailing_activation_type: TrailingActivationType,
    pub trailing_activation_value: Option<f64>,
    pub max_position_size: Option<i64>,
    pub max_instances: Option<i64>,
    pub is_enabled: bool,
}

impl WatchlistSymbol {
    /// F&O exchanges require `qty_units` to be respected when `qty_mode=fixed`
    /// (units must be a multiple of `lot_size`; lots must be a positive integer).
    pub fn is_derivative_exchange(&self) -> bool {
        matches!(self.exchange.as_str(), "NFO" | "BFO" | "MCX")
    }

    /// Validates the fixed-quantity/lot-size invariant. Returns a
    /// human-readable reason on violation.
    pub fn validate_fixed_qty(&self) -> Result<(), String> {
        if !self.is_derivative_exchange() || self.qty_mode != QtyMode::Fixed {
            return Ok(());
        }
        match self.qty_units {
            Some(QtyUnits::Units) => {
                if self.lot_size <= 0 || (self.qty_value % self.lot_size as f64).abs() > 1e-9 {
                    return Err(format!(
                        "qty_value {} is not a multiple of lot_size {} for {}",
                        self.qty_value, self.lot_size, self.symbol
                    ));
                }
                Ok(())
            }
            Some(QtyUnits::Lots) => {
                if self.qty_value <= 0.0 || self.qty_value.fract().abs() > 1e-9 {
                    return Err(format!(
                        "qty_value {} must be a positive integer number of lots for {}",
                        self.qty_value, self.symbol
                    ));
                }
                Ok(())
            }
            None => Err(format!(
                "qty_units is required for fixed-quantity derivative symbol {}",
                self.symbol
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatchlistInstanceBinding {
    pub watchlist_id: i64,
    pub instance_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    Buy,
    Sell,
    Short,
    Cover,
    Exit,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "BUY",
            OrderAction::Sell => "SELL",
            OrderAction::Short => "SHORT",
            OrderAction::Cover => "COVER",
            OrderAction::Exit => "EXIT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderAction::Buy),
            "SELL" => Some(OrderAction::Sell),
            "SHORT" => Some(OrderAction::Short),
            "COVER" => Some(OrderAction::Cover),
            "EXIT" => Some(OrderAction::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    Complete,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::Complete => "complete",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "open" => Some(OrderStatus::Open),
            "complete" => Some(OrderStatus::Complete),
            "rejected" => Some(OrderStatus::Rejected),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Map an upstream orderbook status string to a local `OrderStatus`, per
    /// the reconciler's status-mapping table.
    pub fn from_upstream(s: &str) -> Self {
        match s {
            "pending" => OrderStatus::Pending,
            "open" => OrderStatus::Open,
            "complete" => OrderStatus::Complete,
            "rejected" => OrderStatus::Rejected,
            "cancelled" => OrderStatus::Cancelled,
            "trigger pending" => OrderStatus::Pending,
            other => OrderStatus::from_str(&other.to_lowercase()).unwrap_or(OrderStatus::Pending),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Complete | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

/// One per-instance leg of a fan-out order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistOrder {
    pub id: i64,
    pub watchlist_id: i64,
    pub instance_id: i64,
    pub symbol_id: i64,
    pub action: OrderAction,
    pub quantity: i64,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub status: OrderStatus,
    pub order_id: Option<String>,
    pub filled_quantity: i64,
    pub average_price: f64,
    pub position_id: Option<i64>,
    pub message: Option<String>,
    pub placed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Manual,
    TargetHit,
    StopLoss,
    TrailingStop,
    OrderRejected,
    SystemAuto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistPosition {
    pub id: i64,
    pub watchlist_id: i64,
    pub instance_id: i64,
    pub symbol_id: i64,
    pub direction: Direction,
    pub quantity: i64,
    pub entry_price: f64,
    pub current_price: f64,
    pub exit_price: Option<f64>,
    pub target_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub trailing_stop_price: Option<f64>,
    pub trailing_activated: bool,
    pub highest_price_seen: f64,
    pub lowest_price_seen: f64,
    pub status: PositionStatus,
    pub is_closed: bool,
    pub exit_reason: Option<ExitReason>,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataRow {
    pub exchange: String,
    pub symbol: String,
    pub token: Option<String>,
    pub ltp: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
    pub bid_price: Option<f64>,
    pub bid_qty: Option<i64>,
    pub ask_price: Option<f64>,
    pub ask_qty: Option<i64>,
    pub last_updated: DateTime<Utc>,
    pub data_source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAlert {
    pub id: i64,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub instance_id: Option<i64>,
    pub watchlist_id: Option<i64>,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}
