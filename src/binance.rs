// =============================================================================
// Binance reference adapter — signed REST client and aggTrade stream
// =============================================================================
//
// The one concrete venue integration shipped with the engine. Everything the
// core needs from it goes through the `VenueAdapter` and `MarketStream`
// contracts; every Binance error is mapped into the venue error taxonomy
// before it crosses that boundary.
//
// SECURITY: the secret key is only ever used for HMAC signing and is never
// logged or serialized. Signed requests carry a recvWindow of 5 000 ms to
// tolerate minor clock drift.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::execution::venue::{
    OrderAck, OrderRequest, OrderStatus, SymbolInfo, VenueAdapter, VenueError, VenuePosition,
};
use crate::ingest::{MarketStream, RawTrade};
use crate::types::{Direction, MarketType, OrderState, OrderType, PairId, Side};

type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const REST_BASE: &str = "https://api.binance.com";
const WS_BASE: &str = "wss://stream.binance.com:9443";

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    /// The API key travels only as a default header; the secret only ever
    /// feeds the HMAC.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            secret: secret.into(),
            base_url: REST_BASE.to_string(),
            client,
        }
    }

    /// HMAC-SHA256 hex signature over `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let signature = self.sign(&base);
        format!("{base}&signature={signature}")
    }

    /// Issue a request and map every failure into the venue taxonomy.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        signed: bool,
    ) -> Result<serde_json::Value, VenueError> {
        let query = if signed {
            self.signed_query(query)
        } else {
            query.to_string()
        };
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url, query = query)
        };

        let response = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    VenueError::Transient(e.to_string())
                } else {
                    VenueError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VenueError::Transient(format!("body decode failed: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        Err(classify_http_error(status.as_u16(), retry_after, &body))
    }
}

/// Map a Binance error response into the taxonomy.
fn classify_http_error(
    status: u16,
    retry_after: Option<Duration>,
    body: &serde_json::Value,
) -> VenueError {
    if status == 429 || status == 418 {
        return VenueError::RateLimit { retry_after };
    }

    let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
    let message = body
        .get("msg")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown venue error")
        .to_string();

    match code {
        -2010 | -2019 => VenueError::InsufficientBalance,
        -2011 | -2013 => VenueError::OrderNotFound(message),
        -1013 | -1111 | -1121 => VenueError::InvalidOrder(message),
        -1021 => VenueError::Transient(message), // timestamp outside recvWindow
        -1022 | -2014 | -2015 => VenueError::Permanent(format!("authentication: {message}")),
        _ if status >= 500 => VenueError::Transient(message),
        _ => VenueError::Permanent(message),
    }
}

/// Map a Binance order status string onto the order state machine.
fn map_order_status(status: &str) -> OrderState {
    match status {
        "NEW" => OrderState::Active,
        "PARTIALLY_FILLED" => OrderState::Partial,
        "FILLED" => OrderState::Filled,
        "CANCELED" | "PENDING_CANCEL" | "EXPIRED" => OrderState::Cancelled,
        "REJECTED" => OrderState::Rejected,
        _ => OrderState::Submitted,
    }
}

fn direction_param(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "BUY",
        Direction::Short => "SELL",
    }
}

#[async_trait]
impl VenueAdapter for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, VenueError> {
        let mut params = format!(
            "symbol={}&side={}&newClientOrderId={}&quantity={}",
            request.pair.symbol,
            direction_param(request.direction),
            request.client_id,
            request.quantity
        );
        match request.order_type {
            OrderType::Market => params.push_str("&type=MARKET"),
            OrderType::Limit => {
                let price = request.limit_price.unwrap_or(0.0);
                params.push_str(&format!("&type=LIMIT&timeInForce=GTC&price={price}"));
            }
            OrderType::Stop => {
                let stop = request.limit_price.unwrap_or(0.0);
                params.push_str(&format!("&type=STOP_LOSS&stopPrice={stop}"));
            }
        }

        let body = self
            .request(reqwest::Method::POST, "/api/v3/order", &params, true)
            .await?;

        let venue_order_id = body
            .get("orderId")
            .and_then(|v| v.as_u64())
            .map(|id| id.to_string())
            .ok_or_else(|| VenueError::Transient("order response missing orderId".into()))?;

        debug!(
            symbol = %request.pair.symbol,
            client_id = %request.client_id,
            venue_order_id = %venue_order_id,
            "binance order placed"
        );
        Ok(OrderAck { venue_order_id })
    }

    async fn cancel_order(&self, pair: &PairId, venue_order_id: &str) -> Result<(), VenueError> {
        let params = format!("symbol={}&orderId={venue_order_id}", pair.symbol);
        self.request(reqwest::Method::DELETE, "/api/v3/order", &params, true)
            .await?;
        Ok(())
    }

    async fn get_order(
        &self,
        pair: &PairId,
        venue_order_id: &str,
    ) -> Result<OrderStatus, VenueError> {
        let params = format!("symbol={}&orderId={venue_order_id}", pair.symbol);
        let body = self
            .request(reqwest::Method::GET, "/api/v3/order", &params, true)
            .await?;

        let state = map_order_status(body.get("status").and_then(|s| s.as_str()).unwrap_or(""));
        let filled_qty = body
            .get("executedQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let quote_filled = body
            .get("cummulativeQuoteQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let avg_fill_price = if filled_qty > 0.0 {
            quote_filled / filled_qty
        } else {
            0.0
        };

        Ok(OrderStatus {
            venue_order_id: venue_order_id.to_string(),
            state,
            filled_qty,
            avg_fill_price,
        })
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, VenueError> {
        let body = self
            .request(reqwest::Method::GET, "/api/v3/account", "", true)
            .await?;

        let free = body
            .get("balances")
            .and_then(|b| b.as_array())
            .and_then(|balances| {
                balances.iter().find(|b| {
                    b.get("asset").and_then(|a| a.as_str()) == Some(asset)
                })
            })
            .and_then(|b| b.get("free"))
            .and_then(|f| f.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(free)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        // Spot accounts carry balances, not directional positions; the
        // authoritative position list is empty by construction. A perp
        // adapter would query the futures position endpoint here.
        Ok(Vec::new())
    }

    async fn get_ticker(&self, pair: &PairId) -> Result<f64, VenueError> {
        let params = format!("symbol={}", pair.symbol);
        let body = self
            .request(reqwest::Method::GET, "/api/v3/ticker/price", &params, false)
            .await?;

        body.get("price")
            .and_then(|p| p.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| VenueError::Transient("ticker response missing price".into()))
    }

    async fn get_symbol_info(&self, pair: &PairId) -> Result<SymbolInfo, VenueError> {
        let params = format!("symbol={}", pair.symbol);
        let body = self
            .request(reqwest::Method::GET, "/api/v3/exchangeInfo", &params, false)
            .await?;

        let filters = body
            .get("symbols")
            .and_then(|s| s.as_array())
            .and_then(|s| s.first())
            .and_then(|s| s.get("filters"))
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default();

        let filter_value = |filter_type: &str, field: &str| -> f64 {
            filters
                .iter()
                .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(filter_type))
                .and_then(|f| f.get(field))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
        };

        Ok(SymbolInfo {
            min_qty: filter_value("LOT_SIZE", "minQty"),
            qty_step: filter_value("LOT_SIZE", "stepSize"),
            price_step: filter_value("PRICE_FILTER", "tickSize"),
        })
    }
}

// ---------------------------------------------------------------------------
// aggTrade stream
// ---------------------------------------------------------------------------

/// Combined aggTrade stream over every configured symbol. One connection,
/// one task; the ingestor reconnects when `run` returns.
pub struct BinanceStream {
    symbols: Vec<String>,
}

impl BinanceStream {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols }
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@aggTrade", s.to_lowercase()))
            .collect();
        format!("{WS_BASE}/stream?streams={}", streams.join("/"))
    }
}

/// Parse one combined-stream aggTrade frame into a raw trade.
///
/// Expected shape:
/// ```json
/// { "stream": "ethusdt@aggTrade",
///   "data": { "s": "ETHUSDT", "p": "3000.10", "q": "0.5",
///             "m": false, "T": 1700000000000, "a": 12345 } }
/// ```
fn parse_agg_trade(text: &str) -> Result<RawTrade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;
    let data = root.get("data").unwrap_or(&root);

    let symbol = data
        .get("s")
        .and_then(|v| v.as_str())
        .context("missing field s")?
        .to_string();

    let price: f64 = data
        .get("p")
        .and_then(|v| v.as_str())
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let quantity: f64 = data
        .get("q")
        .and_then(|v| v.as_str())
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    // Buyer-is-maker means the taker sold.
    let is_buyer_maker = data.get("m").and_then(|v| v.as_bool()).context("missing field m")?;
    let taker_side = if is_buyer_maker { Side::Sell } else { Side::Buy };

    let timestamp = data.get("T").and_then(|v| v.as_i64()).unwrap_or(0);
    let trade_id = data
        .get("a")
        .and_then(|v| v.as_i64())
        .map(|id| id.to_string())
        .unwrap_or_default();

    Ok(RawTrade {
        pair: PairId::new("binance", MarketType::Spot, symbol),
        timestamp,
        price,
        quantity,
        taker_side: Some(taker_side),
        trade_id,
    })
}

#[async_trait]
impl MarketStream for BinanceStream {
    fn venue(&self) -> &str {
        "binance"
    }

    async fn run(&self, sink: mpsc::Sender<RawTrade>) -> Result<()> {
        let url = self.stream_url();
        info!(url = %url, symbols = self.symbols.len(), "connecting to aggTrade stream");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to aggTrade stream")?;
        info!("aggTrade stream connected");

        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    match parse_agg_trade(&text) {
                        Ok(trade) => {
                            if sink.send(trade).await.is_err() {
                                return Ok(()); // ingestor went away
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to parse aggTrade frame"),
                    }
                }
                Some(Ok(_)) => {} // pings and binary frames
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
