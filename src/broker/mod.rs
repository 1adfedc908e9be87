//! Broker Client.
//!
//! One client binds to one instance. Every upstream call goes through the
//! uniform envelope `{status, data?, error?, message?}` and the retry/backoff
//! policy below: exponential backoff from an initial delay, capped, abandoned
//! immediately on a 4xx response.

mod client;
mod envelope;

pub use client::{BrokerClient, BrokerFactory, BrokerHandle, HttpBrokerClient};
pub use envelope::{
    AnalyzerState, BrokerEnvelope, CancelAllOrderRequest, ClosePositionRequest, FundsData,
    OrderbookEntry, OrderbookResponse, PlaceSmartOrderRequest, PlaceSmartOrderResponse,
    PositionbookEntry, PositionbookResponse, ToggleAnalyzerRequest, TradebookEntry,
    TradebookResponse,
};

use thiserror::Error;

/// Failure taxonomy for upstream broker calls.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("request to broker timed out")]
    Timeout,
    #[error("network error reaching broker: {0}")]
    Network(String),
    #[error("broker rejected the request (4xx): {0}")]
    HttpClientError(String),
    #[error("broker returned a server error (5xx): {0}")]
    HttpServerError(String),
    #[error("failed to decode broker response: {0}")]
    Decode(String),
    #[error("broker reported a business-logic failure: {0}")]
    BrokerRejected(String),
}

impl BrokerError {
    /// Idempotent reads retry on every kind except a hard 4xx client error;
    /// writes never retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BrokerError::HttpClientError(_))
    }
}
