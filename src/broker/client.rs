use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::envelope::*;
use super::BrokerError;
use crate::domain::Instance;

/// Capability surface the rest of the system depends on ("ambient dynamic
/// dispatch ... becomes an interface abstraction"). A test double substitutes
/// for this trait in unit tests without touching call sites.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn ping(&self) -> Result<(), BrokerError>;
    async fn funds(&self) -> Result<FundsData, BrokerError>;
    async fn orderbook(&self) -> Result<OrderbookResponse, BrokerError>;
    async fn tradebook(&self) -> Result<TradebookResponse, BrokerError>;
    async fn positionbook(&self) -> Result<PositionbookResponse, BrokerError>;
    async fn analyzer(&self) -> Result<AnalyzerState, BrokerError>;
    async fn toggle_analyzer(&self, mode: bool) -> Result<(), BrokerError>;
    async fn place_smart_order(
        &self,
        req: PlaceSmartOrderRequest,
    ) -> Result<PlaceSmartOrderResponse, BrokerError>;
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;
    async fn cancel_all_order(&self, strategy: Option<&str>) -> Result<(), BrokerError>;
    async fn close_position(
        &self,
        strategy: Option<&str>,
        symbol: Option<&str>,
    ) -> Result<(), BrokerError>;
}

pub type BrokerHandle = Arc<dyn BrokerClient>;

/// Builds a client bound to one instance; shared across the REST surface
/// and the background reconciler so both dispatch through the same policy.
pub type BrokerFactory = Arc<dyn Fn(&Instance) -> BrokerHandle + Send + Sync>;

/// Retry policy constants (overridable via `Config`).
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 2000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// One `HttpBrokerClient` binds to one `Instance`'s `host_url`/`api_key`.
pub struct HttpBrokerClient {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
    max_retries: u32,
    initial_backoff_ms: u64,
}

impl HttpBrokerClient {
    pub fn new(
        base_url: String,
        api_key: String,
        request_timeout: Duration,
        max_retries: u32,
        initial_backoff_ms: u64,
    ) -> Self {
        let client = Client::builder()
            .user_agent("control-plane/1.0")
            .build()
            .expect("failed to build broker HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: request_timeout,
            max_retries: max_retries.max(1),
            initial_backoff_ms,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Execute a GET against `path`, retrying idempotent reads up to
    /// `max_retries` times with exponential backoff. Retries stop immediately
    /// on HTTP 4xx.
    async fn get_retrying<T: serde::de::DeserializeOwned + std::default::Default>(
        &self,
        path: &str,
    ) -> Result<BrokerEnvelope<T>, BrokerError> {
        self.execute_retrying(|| self.client.get(self.url(path)).bearer_auth(&self.api_key))
            .await
    }

    /// Execute a POST once, without retry (non-idempotent writes never retry
    /// on network ambiguity; the caller reconciles via orderbook/positionbook).
    async fn post_once<B: serde::Serialize, T: serde::de::DeserializeOwned + std::default::Default>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<BrokerEnvelope<T>, BrokerError> {
        let request = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body);
        self.send_once(request).await
    }

    async fn execute_retrying<T, F>(&self, build: F) -> Result<BrokerEnvelope<T>, BrokerError>
    where
        T: serde::de::DeserializeOwned + std::default::Default,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut backoff = self.initial_backoff_ms.max(1);
        let mut last_err = BrokerError::Network("no attempts made".to_string());

        for attempt in 0..self.max_retries {
            match self.send_once(build()).await {
                Ok(envelope) => return Ok(envelope),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(attempt = attempt + 1, error = %err, "broker call failed, retrying");
                    last_err = err;
                }
            }

            if attempt + 1 < self.max_retries {
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }

        Err(last_err)
    }

    async fn send_once<T: serde::de::DeserializeOwned + std::default::Default>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<BrokerEnvelope<T>, BrokerError> {
        let response = match timeout(self.timeout, request.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(BrokerError::Network(e.to_string())),
            Err(_) => return Err(BrokerError::Timeout),
        };

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::HttpClientError(format!("{status}: {text}")));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::HttpServerError(format!("{status}: {text}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::HttpServerError(format!("429: {text}")));
        }

        let envelope: BrokerEnvelope<T> = response
            .json()
            .await
            .map_err(|e| BrokerError::Decode(e.to_string()))?;

        if !envelope.is_success() {
            return Err(BrokerError::BrokerRejected(envelope.failure_message()));
        }

        debug!(base_url = %self.base_url, "broker call succeeded");
        Ok(envelope)
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.get_retrying::<serde_json::Value>("ping").await?;
        Ok(())
    }

    async fn funds(&self) -> Result<FundsData, BrokerError> {
        let envelope = self.get_retrying::<FundsData>("funds").await?;
        envelope.data.ok_or(BrokerError::Decode(
            "funds response missing data".to_string(),
        ))
    }

    async fn orderbook(&self) -> Result<OrderbookResponse, BrokerError> {
        let envelope = self.get_retrying::<OrderbookResponse>("orderbook").await?;
        Ok(envelope.data.unwrap_or_default())
    }

    async fn tradebook(&self) -> Result<TradebookResponse, BrokerError> {
        let envelope = self.get_retrying::<TradebookResponse>("tradebook").await?;
        Ok(envelope.data.unwrap_or_default())
    }

    async fn positionbook(&self) -> Result<PositionbookResponse, BrokerError> {
        let envelope = self
            .get_retrying::<PositionbookResponse>("positionbook")
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }

    async fn analyzer(&self) -> Result<AnalyzerState, BrokerError> {
        let envelope = self.get_retrying::<AnalyzerState>("analyzer").await?;
        envelope.data.ok_or(BrokerError::Decode(
            "analyzer response missing data".to_string(),
        ))
    }

    async fn toggle_analyzer(&self, mode: bool) -> Result<(), BrokerError> {
        self.post_once::<_, serde_json::Value>("analyzer/toggle", &ToggleAnalyzerRequest { mode })
            .await?;
        Ok(())
    }

    async fn place_smart_order(
        &self,
        req: PlaceSmartOrderRequest,
    ) -> Result<PlaceSmartOrderResponse, BrokerError> {
        let envelope = self
            .post_once::<_, PlaceSmartOrderResponse>("placesmartorder", &req)
            .await?;
        envelope.data.ok_or(BrokerError::Decode(
            "placesmartorder response missing data".to_string(),
        ))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            order_id: &'a str,
        }
        self.post_once::<_, serde_json::Value>("cancelorder", &Body { order_id })
            .await?;
        Ok(())
    }

    async fn cancel_all_order(&self, strategy: Option<&str>) -> Result<(), BrokerError> {
        self.post_once::<_, serde_json::Value>(
            "cancelallorder",
            &CancelAllOrderRequest {
                strategy: strategy.map(str::to_string),
            },
        )
        .await?;
        Ok(())
    }

    async fn close_position(
        &self,
        strategy: Option<&str>,
        symbol: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.post_once::<_, serde_json::Value>(
            "closeposition",
            &ClosePositionRequest {
                strategy: strategy.map(str::to_string),
                symbol: symbol.map(str::to_string),
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_client() -> HttpBrokerClient {
        HttpBrokerClient::new(
            "https://example.invalid".to_string(),
            "test-key".to_string(),
            Duration::from_millis(50),
            DEFAULT_MAX_RETRIES,
            DEFAULT_INITIAL_BACKOFF_MS,
        )
    }

    #[test]
    fn broker_error_retry_classification() {
        assert!(BrokerError::Timeout.is_retryable());
        assert!(BrokerError::Network("x".into()).is_retryable());
        assert!(BrokerError::HttpServerError("x".into()).is_retryable());
        assert!(!BrokerError::HttpClientError("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn unreachable_host_surfaces_network_or_timeout_error() {
        let client = make_client();
        let result = client.ping().await;
        assert!(result.is_err());
    }
}
