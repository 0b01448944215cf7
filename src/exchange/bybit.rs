// src/exchange/bybit.rs
use crate::config::ExchangeConfig;
use crate::domain::errors::{ExchangeError, ExchangeResult};
use crate::domain::models::{
    Candle, ExchangePosition, OrderAck, OrderRequest, OrderSide, OrderStatus, Ticker,
};
use crate::exchange::client::ExchangeClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::str::FromStr;

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const CATEGORY: &str = "linear";

/// Bybit retCodes that mean "too many requests"
const RATE_LIMIT_CODES: [i64; 2] = [10006, 10018];
/// Bybit retCodes for server-side timeouts and stale requests
const TRANSIENT_CODES: [i64; 2] = [10000, 10016];
/// "leverage not modified": the requested leverage is already set
const LEVERAGE_UNCHANGED: i64 = 110043;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

/// Bybit v5 REST client for USDT linear perpetuals
pub struct BybitClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    recv_window: u64,
    http: Client<HttpsConnector<HttpConnector>>,
}

impl BybitClient {
    /// Create a new client from exchange configuration
    pub fn new(config: &ExchangeConfig) -> Self {
        let base_url = if config.testnet {
            TESTNET_URL
        } else {
            MAINNET_URL
        };

        Self {
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: base_url.to_string(),
            recv_window: config.recv_window_ms,
            http: Client::builder().build::<_, Body>(HttpsConnector::new()),
        }
    }

    /// Hex HMAC-SHA256 of `timestamp + api_key + recv_window + payload`
    fn sign(&self, timestamp: i64, payload: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Validation(format!("HMAC init failed: {}", e)))?;

        mac.update(
            format!("{}{}{}{}", timestamp, self.api_key, self.recv_window, payload).as_bytes(),
        );
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn get(&self, path: &str, query: &str, signed: bool) -> ExchangeResult<Value> {
        self.send(Method::GET, path, query, None, signed).await
    }

    async fn post(&self, path: &str, body: Value) -> ExchangeResult<Value> {
        self.send(Method::POST, path, "", Some(body.to_string()), true)
            .await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &str,
        body: Option<String>,
        signed: bool,
    ) -> ExchangeResult<Value> {
        let uri = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json");

        if signed {
            let timestamp = Utc::now().timestamp_millis();
            let payload = body.as_deref().unwrap_or(query);
            let signature = self.sign(timestamp, payload)?;
            builder = builder
                .header("X-BAPI-API-KEY", self.api_key.as_str())
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-SIGN", signature)
                .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string());
        }

        let request = builder
            .body(Body::from(body.unwrap_or_default()))
            .map_err(|e| ExchangeError::Validation(format!("Invalid request: {}", e)))?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimit(format!("HTTP {}", status)));
        }
        if status.is_server_error() {
            return Err(ExchangeError::Network(format!("HTTP {}", status)));
        }

        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| ExchangeError::Parse(format!("{} (HTTP {})", e, status)))?;

        Self::classify(envelope)
    }

    fn classify(envelope: Envelope) -> ExchangeResult<Value> {
        match envelope.ret_code {
            0 => Ok(envelope.result),
            code if RATE_LIMIT_CODES.contains(&code) => {
                Err(ExchangeError::RateLimit(envelope.ret_msg))
            }
            code if TRANSIENT_CODES.contains(&code) => Err(ExchangeError::Network(format!(
                "retCode {}: {}",
                code, envelope.ret_msg
            ))),
            code => Err(ExchangeError::Rejected {
                code,
                message: envelope.ret_msg,
            }),
        }
    }

    fn list(result: &Value) -> ExchangeResult<&Vec<Value>> {
        result["list"]
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("missing result.list".to_string()))
    }

    fn parse_status(raw: &str) -> OrderStatus {
        match raw {
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            _ => OrderStatus::New,
        }
    }

    fn parse_candle(row: &Value) -> ExchangeResult<Candle> {
        let fields = row
            .as_array()
            .filter(|f| f.len() >= 6)
            .ok_or_else(|| ExchangeError::Parse(format!("malformed kline row: {}", row)))?;

        let start_ms: i64 = str_field(&fields[0])?
            .parse()
            .map_err(|e| ExchangeError::Parse(format!("kline start time: {}", e)))?;
        let timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(start_ms)
            .ok_or_else(|| ExchangeError::Parse(format!("kline start time {}", start_ms)))?;

        Ok(Candle {
            timestamp,
            open: decimal(&fields[1])?,
            high: decimal(&fields[2])?,
            low: decimal(&fields[3])?,
            close: decimal(&fields[4])?,
            volume: decimal(&fields[5])?,
        })
    }
}

fn str_field(value: &Value) -> ExchangeResult<&str> {
    value
        .as_str()
        .ok_or_else(|| ExchangeError::Parse(format!("expected string, got {}", value)))
}

/// Bybit encodes numbers as strings; an empty string means zero.
fn decimal(value: &Value) -> ExchangeResult<Decimal> {
    let raw = str_field(value)?;
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(raw).map_err(|e| ExchangeError::Parse(format!("'{}': {}", raw, e)))
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let kind = request.kind();
        let mut body = json!({
            "category": CATEGORY,
            "symbol": request.instrument,
            "side": request.side.as_str(),
            "orderType": kind.as_str(),
            "qty": request.quantity.normalize().to_string(),
            "timeInForce": if request.price.is_some() { "GTC" } else { "IOC" },
            "reduceOnly": request.reduce_only,
        });
        if let Some(price) = request.price {
            body["price"] = json!(price.normalize().to_string());
        }
        if let Some(stop_loss) = request.stop_loss {
            body["stopLoss"] = json!(stop_loss.normalize().to_string());
        }
        if let Some(take_profit) = request.take_profit {
            body["takeProfit"] = json!(take_profit.normalize().to_string());
        }

        let result = self.post("/v5/order/create", body).await?;
        let order_id = str_field(&result["orderId"])?.to_string();
        log::info!(
            "Order placed on Bybit: {} {} {} {} (id {})",
            request.side,
            kind.as_str(),
            request.quantity,
            request.instrument,
            order_id
        );

        Ok(OrderAck {
            order_id,
            status: OrderStatus::New,
            avg_price: None,
        })
    }

    async fn cancel_order(&self, instrument: &str, order_id: &str) -> ExchangeResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": instrument,
            "orderId": order_id,
        });
        self.post("/v5/order/cancel", body).await?;
        Ok(())
    }

    async fn amend_order(
        &self,
        instrument: &str,
        order_id: &str,
        stop_loss: Decimal,
    ) -> ExchangeResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": instrument,
            "orderId": order_id,
            "stopLoss": stop_loss.normalize().to_string(),
        });
        self.post("/v5/order/amend", body).await?;
        Ok(())
    }

    async fn set_leverage(&self, instrument: &str, leverage: Decimal) -> ExchangeResult<()> {
        let leverage = leverage.normalize().to_string();
        let body = json!({
            "category": CATEGORY,
            "symbol": instrument,
            "buyLeverage": leverage,
            "sellLeverage": leverage,
        });
        match self.post("/v5/position/set-leverage", body).await {
            Err(ExchangeError::Rejected { code, .. }) if code == LEVERAGE_UNCHANGED => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn get_order_status(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> ExchangeResult<Option<OrderStatus>> {
        let query = format!(
            "category={}&symbol={}&orderId={}",
            CATEGORY, instrument, order_id
        );
        let result = self.get("/v5/order/realtime", &query, true).await?;

        match Self::list(&result)?.first() {
            Some(order) => Ok(Some(Self::parse_status(str_field(&order["orderStatus"])?))),
            None => Ok(None),
        }
    }

    async fn get_positions(&self, instrument: &str) -> ExchangeResult<Vec<ExchangePosition>> {
        let query = format!("category={}&symbol={}", CATEGORY, instrument);
        let result = self.get("/v5/position/list", &query, true).await?;

        let mut positions = Vec::new();
        for item in Self::list(&result)? {
            let size = decimal(&item["size"])?;
            if size.is_zero() {
                continue;
            }
            let side = match str_field(&item["side"])? {
                "Buy" => OrderSide::Buy,
                "Sell" => OrderSide::Sell,
                _ => continue,
            };
            positions.push(ExchangePosition {
                instrument: str_field(&item["symbol"])?.to_string(),
                side,
                size,
                entry_price: decimal(&item["avgPrice"])?,
                mark_price: decimal(&item["markPrice"])?,
                unrealized_pnl: decimal(&item["unrealisedPnl"])?,
                leverage: decimal(&item["leverage"])?,
            });
        }
        Ok(positions)
    }

    async fn get_wallet_balance(&self, coin: &str) -> ExchangeResult<Decimal> {
        let query = format!("accountType=UNIFIED&coin={}", coin);
        let result = self.get("/v5/account/wallet-balance", &query, true).await?;

        let account = Self::list(&result)?
            .first()
            .ok_or_else(|| ExchangeError::Parse("empty wallet list".to_string()))?;

        let coins = account["coin"]
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("missing coin list".to_string()))?;

        match coins.iter().find(|c| c["coin"].as_str() == Some(coin)) {
            Some(entry) => decimal(&entry["walletBalance"]),
            None => {
                log::warn!("Coin {} not found in wallet", coin);
                Ok(Decimal::ZERO)
            }
        }
    }

    async fn get_ticker(&self, instrument: &str) -> ExchangeResult<Ticker> {
        let query = format!("category={}&symbol={}", CATEGORY, instrument);
        let result = self.get("/v5/market/tickers", &query, false).await?;

        let item = Self::list(&result)?
            .first()
            .ok_or_else(|| ExchangeError::Parse(format!("no ticker for {}", instrument)))?;

        Ok(Ticker {
            instrument: instrument.to_string(),
            last_price: decimal(&item["lastPrice"])?,
            timestamp: Utc::now(),
        })
    }

    async fn get_klines(
        &self,
        instrument: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        let mut query = format!(
            "category={}&symbol={}&interval={}&limit={}",
            CATEGORY, instrument, interval, limit
        );
        if let Some(start) = start {
            query.push_str(&format!("&start={}", start));
        }
        if let Some(end) = end {
            query.push_str(&format!("&end={}", end));
        }

        let result = self.get("/v5/market/kline", &query, false).await?;

        // Bybit returns newest first
        let mut candles = Self::list(&result)?
            .iter()
            .map(Self::parse_candle)
            .collect::<ExchangeResult<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }
}
