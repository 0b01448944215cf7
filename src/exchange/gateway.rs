// src/exchange/gateway.rs
use crate::config::GatewayConfig;
use crate::domain::errors::{ExchangeError, ExchangeResult, GatewayError, GatewayResult};
use crate::domain::models::{Candle, ExchangePosition, OrderAck, OrderRequest, OrderStatus, Ticker};
use crate::exchange::client::ExchangeClient;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Single entry point for every exchange call.
///
/// Each physical call waits out the remaining minimum spacing since the
/// previous one, then runs under a bounded retry policy. Transient failures
/// (network, rate limit, unparseable response) are retried with a fixed
/// delay that doubles after a rate-limit rejection. Business rejections and
/// validation failures surface immediately.
pub struct Gateway {
    client: Arc<dyn ExchangeClient>,
    simulated: bool,
    config: GatewayConfig,
    last_call: Mutex<Option<Instant>>,
}

impl Gateway {
    pub fn new(client: Arc<dyn ExchangeClient>, config: GatewayConfig, simulated: bool) -> Self {
        Self {
            client,
            simulated,
            config,
            last_call: Mutex::new(None),
        }
    }

    /// Whether responses are fabricated locally
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Place a new order. Parameters are validated before anything is sent.
    pub async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderAck> {
        request
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        let client = &self.client;
        self.call("place_order", move || client.place_order(request))
            .await
    }

    pub async fn cancel_order(&self, instrument: &str, order_id: &str) -> GatewayResult<()> {
        let client = &self.client;
        self.call("cancel_order", move || client.cancel_order(instrument, order_id))
            .await
    }

    pub async fn amend_stop(
        &self,
        instrument: &str,
        order_id: &str,
        stop_loss: Decimal,
    ) -> GatewayResult<()> {
        if stop_loss <= Decimal::ZERO {
            return Err(GatewayError::Validation(format!(
                "stop loss must be positive, got {}",
                stop_loss
            )));
        }

        let client = &self.client;
        self.call("amend_order", move || {
            client.amend_order(instrument, order_id, stop_loss)
        })
        .await
    }

    pub async fn set_leverage(&self, instrument: &str, leverage: Decimal) -> GatewayResult<()> {
        if leverage <= Decimal::ZERO {
            return Err(GatewayError::Validation(format!(
                "leverage must be positive, got {}",
                leverage
            )));
        }

        let client = &self.client;
        self.call("set_leverage", move || client.set_leverage(instrument, leverage))
            .await
    }

    pub async fn order_status(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> GatewayResult<Option<OrderStatus>> {
        let client = &self.client;
        self.call("get_order_status", move || {
            client.get_order_status(instrument, order_id)
        })
        .await
    }

    pub async fn positions(&self, instrument: &str) -> GatewayResult<Vec<ExchangePosition>> {
        let client = &self.client;
        self.call("get_positions", move || client.get_positions(instrument))
            .await
    }

    pub async fn wallet_balance(&self, coin: &str) -> GatewayResult<Decimal> {
        let client = &self.client;
        self.call("get_wallet_balance", move || client.get_wallet_balance(coin))
            .await
    }

    pub async fn ticker(&self, instrument: &str) -> GatewayResult<Ticker> {
        let client = &self.client;
        self.call("get_tickers", move || client.get_ticker(instrument))
            .await
    }

    pub async fn klines(
        &self,
        instrument: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: u32,
    ) -> GatewayResult<Vec<Candle>> {
        let client = &self.client;
        self.call("get_kline", move || {
            client.get_klines(instrument, interval, start, end, limit)
        })
        .await
    }

    /// Run `op` under the spacing and retry policy.
    async fn call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.wait_for_slot().await;

            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(ExchangeError::Validation(message)) => {
                    log::warn!("{} failed validation: {}", operation, message);
                    return Err(GatewayError::Validation(message));
                }
                Err(e) if !e.is_retryable() => {
                    log::error!("{} rejected by exchange: {}", operation, e);
                    return Err(GatewayError::Rejected {
                        operation,
                        message: e.to_string(),
                    });
                }
                Err(e) => e,
            };

            log::warn!(
                "{} attempt {}/{} failed: {}",
                operation,
                attempt,
                attempts,
                error
            );

            if attempt < attempts {
                let mut delay = self.config.retry_delay();
                if error.is_rate_limit() {
                    delay *= 2;
                }
                sleep(delay).await;
            }
            last_error = error.to_string();
        }

        log::error!(
            "{} gave up after {} attempts, outcome unknown: {}",
            operation,
            attempts,
            last_error
        );
        Err(GatewayError::Exhausted {
            operation,
            attempts,
            last_error,
        })
    }

    /// Suspend until the minimum spacing since the previous call has elapsed.
    async fn wait_for_slot(&self) {
        let spacing = self.config.min_call_spacing();
        let mut last_call = self.last_call.lock().await;

        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < spacing {
                sleep(spacing - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::OrderSide;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Replays scripted place_order outcomes and counts calls.
    struct ScriptedClient {
        outcomes: StdMutex<VecDeque<ExchangeResult<OrderAck>>>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(outcomes: Vec<ExchangeResult<OrderAck>>) -> Self {
            Self {
                outcomes: StdMutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for ScriptedClient {
        async fn place_order(&self, _request: &OrderRequest) -> ExchangeResult<OrderAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ExchangeError::Network("script exhausted".into())))
        }

        async fn cancel_order(&self, _instrument: &str, _order_id: &str) -> ExchangeResult<()> {
            Ok(())
        }

        async fn amend_order(&self, _: &str, _: &str, _: Decimal) -> ExchangeResult<()> {
            Ok(())
        }

        async fn set_leverage(&self, _: &str, _: Decimal) -> ExchangeResult<()> {
            Ok(())
        }

        async fn get_order_status(&self, _: &str, _: &str) -> ExchangeResult<Option<OrderStatus>> {
            Ok(Some(OrderStatus::Filled))
        }

        async fn get_positions(&self, _: &str) -> ExchangeResult<Vec<ExchangePosition>> {
            Ok(Vec::new())
        }

        async fn get_wallet_balance(&self, _: &str) -> ExchangeResult<Decimal> {
            Ok(dec!(1000))
        }

        async fn get_ticker(&self, instrument: &str) -> ExchangeResult<Ticker> {
            Ok(Ticker {
                instrument: instrument.to_string(),
                last_price: dec!(100),
                timestamp: chrono::Utc::now(),
            })
        }

        async fn get_klines(
            &self,
            _: &str,
            _: &str,
            _: Option<i64>,
            _: Option<i64>,
            _: u32,
        ) -> ExchangeResult<Vec<Candle>> {
            Ok(Vec::new())
        }
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            min_call_spacing_ms: 0,
            max_retries: 3,
            retry_delay_ms: 1,
        }
    }

    fn ack() -> OrderAck {
        OrderAck {
            order_id: "abc".to_string(),
            status: OrderStatus::New,
            avg_price: None,
        }
    }

    fn request() -> OrderRequest {
        OrderRequest {
            instrument: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(0.01),
            price: None,
            stop_loss: None,
            take_profit: None,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ExchangeError::Network("reset".into())),
            Err(ExchangeError::RateLimit("slow down".into())),
            Ok(ack()),
        ]));
        let gateway = Gateway::new(client.clone(), fast_config(), false);

        let result = gateway.place_order(&request()).await.unwrap();
        assert_eq!(result.order_id, "abc");
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_doubles_retry_delay() {
        let config = GatewayConfig {
            min_call_spacing_ms: 0,
            max_retries: 2,
            retry_delay_ms: 30,
        };

        let client = Arc::new(ScriptedClient::new(vec![
            Err(ExchangeError::RateLimit("slow down".into())),
            Ok(ack()),
        ]));
        let gateway = Gateway::new(client, config.clone(), false);
        let started = std::time::Instant::now();
        gateway.place_order(&request()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));

        let client = Arc::new(ScriptedClient::new(vec![
            Err(ExchangeError::Network("reset".into())),
            Ok(ack()),
        ]));
        let gateway = Gateway::new(client, config, false);
        let started = std::time::Instant::now();
        gateway.place_order(&request()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_set_leverage_rejects_non_positive() {
        let client = Arc::new(ScriptedClient::new(Vec::new()));
        let gateway = Gateway::new(client, fast_config(), false);
        let err = gateway.set_leverage("BTCUSDT", dec!(0)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(gateway.set_leverage("BTCUSDT", dec!(3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_unknown_outcome() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let gateway = Gateway::new(client.clone(), fast_config(), false);

        let err = gateway.place_order(&request()).await.unwrap_err();
        assert!(err.is_outcome_unknown());
        assert!(matches!(err, GatewayError::Exhausted { attempts: 3, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_rejection_is_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ExchangeError::Rejected {
            code: 110007,
            message: "insufficient margin".into(),
        })]));
        let gateway = Gateway::new(client.clone(), fast_config(), false);

        let err = gateway.place_order(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { operation: "place_order", .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_exchange() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(ack())]));
        let gateway = Gateway::new(client.clone(), fast_config(), false);

        let mut bad = request();
        bad.quantity = dec!(-1);
        let err = gateway.place_order(&bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_calls_are_spaced() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let config = GatewayConfig {
            min_call_spacing_ms: 40,
            ..fast_config()
        };
        let gateway = Gateway::new(client, config, false);

        let started = std::time::Instant::now();
        gateway.ticker("BTCUSDT").await.unwrap();
        gateway.ticker("BTCUSDT").await.unwrap();
        gateway.ticker("BTCUSDT").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
