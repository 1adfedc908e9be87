//! Wire types for the upstream broker API envelope `{status, data?, error?, message?}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerEnvelope<T> {
    pub status: String,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> BrokerEnvelope<T> {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    pub fn failure_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "broker reported status=error".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FundsData {
    #[serde(default)]
    pub availablecash: f64,
    #[serde(default)]
    pub collateral: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradebookEntry {
    pub symbol: String,
    pub action: String,
    pub price: f64,
    pub quantity: f64,
}

pub type TradebookResponse = Vec<TradebookEntry>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PositionbookEntry {
    pub symbol: String,
    pub netqty: f64,
    #[serde(default)]
    pub pnl: Option<f64>,
}

pub type PositionbookResponse = Vec<PositionbookEntry>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderbookEntry {
    pub orderid: String,
    pub status: String,
    #[serde(default)]
    pub fillshares: f64,
    #[serde(default)]
    pub avgprice: f64,
}

pub type OrderbookResponse = Vec<OrderbookEntry>;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AnalyzerState {
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceSmartOrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub action: String,
    pub quantity: i64,
    pub price_type: String,
    pub product: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PlaceSmartOrderResponse {
    pub orderid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelAllOrderRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClosePositionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToggleAnalyzerRequest {
    pub mode: bool,
}
