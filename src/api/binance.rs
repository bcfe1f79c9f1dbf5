use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use std::time::Duration;

use crate::api::{
    AccountBalance, ExchangeApi, MarketHistory, OpenOrderReport, OrderAck, OrderRequest,
    PositionReport,
};
use crate::error::BotError;
use crate::models::{Candle, Interval, OrderStatus, SymbolFilters};
use crate::Result;

const MAX_KLINE_LIMIT: usize = 1500;

type HmacSha256 = Hmac<Sha256>;

/// Binance USDⓈ-M futures REST client.
///
/// Signed endpoints carry a millisecond timestamp and an HMAC-SHA256
/// signature over the query string; signatures are redacted from error logs.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceFuturesClient {
    pub fn new(
        api_key: String,
        api_secret: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&'static str, String)>,
        signed: bool,
    ) -> Result<serde_json::Value> {
        if signed {
            params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
            let query = encode_query(&params);
            let signature = self.sign(&query);
            params.push(("signature", signature));
        }

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .request(method.clone(), &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, message) = parse_exchange_error(status, &body);
            tracing::error!(
                %method,
                path,
                status = status.as_u16(),
                code,
                message = %message,
                "Binance request failed"
            );
            return Err(BotError::ExchangeRejected { code, message });
        }

        Ok(response.json().await?)
    }

    pub async fn ping(&self) -> Result<()> {
        self.request(Method::GET, "/fapi/v1/ping", Vec::new(), false)
            .await?;
        Ok(())
    }

    /// Price/lot filters for `symbol` from the exchange-info report.
    pub async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let info = self
            .request(Method::GET, "/fapi/v1/exchangeInfo", Vec::new(), false)
            .await?;

        let symbols = info["symbols"]
            .as_array()
            .ok_or_else(|| BotError::MalformedPayload("exchangeInfo missing symbols".into()))?;
        let entry = symbols
            .iter()
            .find(|s| s["symbol"].as_str() == Some(symbol))
            .ok_or_else(|| {
                BotError::Config(format!("symbol {symbol} not found in exchange info"))
            })?;

        let mut filters = SymbolFilters {
            tick_size: 0.0,
            step_size: 0.0,
            min_qty: 0.0,
            min_notional: 0.0,
        };
        for filter in entry["filters"].as_array().into_iter().flatten() {
            match filter["filterType"].as_str() {
                Some("PRICE_FILTER") => {
                    filters.tick_size = str_field_f64(filter, "tickSize");
                }
                Some("LOT_SIZE") => {
                    filters.step_size = str_field_f64(filter, "stepSize");
                    filters.min_qty = str_field_f64(filter, "minQty");
                }
                Some("MIN_NOTIONAL") => {
                    filters.min_notional = str_field_f64(filter, "notional");
                }
                _ => {}
            }
        }

        if filters.tick_size <= 0.0 || filters.step_size <= 0.0 {
            return Err(BotError::Config(format!(
                "symbol {symbol} lacks price or lot size filters"
            )));
        }
        Ok(filters)
    }

    async fn klines_request(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.clamp(1, MAX_KLINE_LIMIT).to_string()),
        ];
        if let Some(start) = start_time {
            params.push(("startTime", start.timestamp_millis().to_string()));
        }

        let rows = self
            .request(Method::GET, "/fapi/v1/klines", params, false)
            .await?;
        let rows = rows
            .as_array()
            .ok_or_else(|| BotError::MalformedPayload("klines response is not an array".into()))?;

        let now = Utc::now();
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(candle_from_kline_row(interval, row, now)?);
        }
        Ok(candles)
    }

    /// Latest mark-of-book price for the symbol.
    pub async fn symbol_price(&self, symbol: &str) -> Result<f64> {
        let data = self
            .request(
                Method::GET,
                "/fapi/v1/ticker/price",
                vec![("symbol", symbol.to_string())],
                false,
            )
            .await?;
        data["price"]
            .as_str()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| BotError::MalformedPayload("ticker price missing".into()))
    }

    /// Wallet balance snapshot for sizing.
    pub async fn account_balance(&self) -> Result<AccountBalance> {
        let account = self
            .request(Method::GET, "/fapi/v2/account", Vec::new(), true)
            .await?;
        let wallet = str_field_f64(&account, "totalWalletBalance");
        let available = if account.get("availableBalance").is_some() {
            str_field_f64(&account, "availableBalance")
        } else {
            wallet
        };
        Ok(AccountBalance {
            wallet_balance: wallet,
            available_balance: available,
            fetched_at: Utc::now(),
        })
    }

    /// Highest initial leverage offered for the symbol.
    pub async fn max_leverage(&self, symbol: &str) -> Result<u32> {
        let data = self
            .request(
                Method::GET,
                "/fapi/v1/leverageBracket",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await?;
        let brackets = data
            .get(0)
            .and_then(|entry| entry["brackets"].as_array())
            .ok_or_else(|| BotError::MalformedPayload("leverageBracket missing brackets".into()))?;
        brackets
            .iter()
            .filter_map(|b| b["initialLeverage"].as_u64())
            .max()
            .map(|v| v as u32)
            .ok_or_else(|| BotError::MalformedPayload("leverageBracket has no leverage".into()))
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.request(
            Method::POST,
            "/fapi/v1/leverage",
            vec![
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ],
            true,
        )
        .await?;
        Ok(())
    }

    /// Sets the margin mode; "no need to change" answers are tolerated.
    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<()> {
        let result = self
            .request(
                Method::POST,
                "/fapi/v1/marginType",
                vec![
                    ("symbol", symbol.to_string()),
                    ("marginType", margin_type.to_string()),
                ],
                true,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(BotError::ExchangeRejected { code: -4046, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Listen key for the user-data stream.
    pub async fn create_listen_key(&self) -> Result<String> {
        let data = self
            .request(Method::POST, "/fapi/v1/listenKey", Vec::new(), false)
            .await?;
        data["listenKey"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BotError::MalformedPayload("listenKey missing".into()))
    }

    pub async fn keepalive_listen_key(&self) -> Result<()> {
        self.request(Method::PUT, "/fapi/v1/listenKey", Vec::new(), false)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MarketHistory for BinanceFuturesClient {
    async fn klines(&self, symbol: &str, interval: Interval, limit: usize) -> Result<Vec<Candle>> {
        self.klines_request(symbol, interval, None, limit).await
    }

    async fn klines_after(
        &self,
        symbol: &str,
        interval: Interval,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let start = after + chrono::Duration::milliseconds(1);
        let candles = self
            .klines_request(symbol, interval, Some(start), limit)
            .await?;
        Ok(candles
            .into_iter()
            .filter(|c| c.open_time > after)
            .collect())
    }
}

#[async_trait]
impl ExchangeApi for BinanceFuturesClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_wire().to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];
        if let Some(qty) = request.quantity {
            params.push(("quantity", format!("{qty:.8}")));
        }
        if let Some(price) = request.price {
            params.push(("price", format!("{price:.8}")));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(stop) = request.stop_price {
            params.push(("stopPrice", format!("{stop:.8}")));
            params.push(("workingType", "MARK_PRICE".to_string()));
        }
        if request.close_position {
            params.push(("closePosition", "true".to_string()));
        } else if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let order = self
            .request(Method::POST, "/fapi/v1/order", params, true)
            .await?;

        Ok(OrderAck {
            order_id: order["orderId"].as_i64().ok_or_else(|| {
                BotError::MalformedPayload("order ack missing orderId".into())
            })?,
            client_order_id: order["clientOrderId"]
                .as_str()
                .unwrap_or(&request.client_order_id)
                .to_string(),
            status: order_status_from_wire(order["status"].as_str().unwrap_or("NEW")),
            executed_qty: str_field_f64(&order, "executedQty"),
            avg_price: order["avgPrice"]
                .as_str()
                .and_then(|p| p.parse::<f64>().ok())
                .filter(|p| *p > 0.0),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        self.request(
            Method::DELETE,
            "/fapi/v1/order",
            vec![
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ],
            true,
        )
        .await?;
        Ok(())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrderReport>> {
        let data = self
            .request(
                Method::GET,
                "/fapi/v1/openOrders",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn position_risk(&self, symbol: &str) -> Result<PositionReport> {
        let data = self
            .request(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await?;
        let positions = data
            .as_array()
            .ok_or_else(|| BotError::MalformedPayload("positionRisk not an array".into()))?;
        let entry = positions
            .iter()
            .find(|p| p["symbol"].as_str() == Some(symbol))
            .ok_or_else(|| {
                BotError::MalformedPayload(format!("no position data returned for {symbol}"))
            })?;
        Ok(PositionReport {
            position_amt: str_field_f64(entry, "positionAmt"),
            entry_price: str_field_f64(entry, "entryPrice"),
        })
    }
}

/// Maps a Binance order-status string onto the local lifecycle.
pub(crate) fn order_status_from_wire(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PARTIALLY_FILLED" => OrderStatus::Open,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

fn candle_from_kline_row(
    interval: Interval,
    row: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<Candle> {
    let row = row
        .as_array()
        .filter(|r| r.len() >= 7)
        .ok_or_else(|| BotError::MalformedPayload("kline row too short".into()))?;

    let open_time = row[0]
        .as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| BotError::MalformedPayload("kline open time invalid".into()))?;
    let close_time = row[6]
        .as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| BotError::MalformedPayload("kline close time invalid".into()))?;

    let field = |idx: usize| -> Result<f64> {
        row[idx]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BotError::MalformedPayload(format!("kline field {idx} invalid")))
    };

    Ok(Candle {
        interval,
        open_time,
        close_time,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
        // The last row of a klines response is usually the still-forming
        // candle; its close_time lies in the future.
        is_closed: close_time <= now,
    })
}

fn parse_exchange_error(status: StatusCode, body: &str) -> (i64, String) {
    #[derive(Deserialize)]
    struct WireError {
        code: i64,
        msg: String,
    }
    match serde_json::from_str::<WireError>(body) {
        Ok(e) => (e.code, e.msg),
        Err(_) => (
            i64::from(status.as_u16()),
            if body.is_empty() {
                status.to_string()
            } else {
                body.chars().take(200).collect()
            },
        ),
    }
}

fn encode_query(params: &[(&'static str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn str_field_f64(value: &serde_json::Value, key: &str) -> f64 {
    value[key]
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value[key].as_f64())
        .unwrap_or(0.0)
}

pub(crate) fn de_f64_str<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    let raw = String::deserialize(d)?;
    raw.parse().map_err(serde::de::Error::custom)
}

pub(crate) fn de_opt_f64_str<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<f64>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    match raw {
        Some(s) if !s.is_empty() => s.parse().map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
