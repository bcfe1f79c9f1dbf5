use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::api::binance::order_status_from_wire;
use crate::api::BinanceFuturesClient;
use crate::models::{OrderSide, OrderStatus, TradeDelta};
use crate::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Binance expires listen keys after 60 minutes without a keepalive.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Order/fill update pushed by the exchange.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: i64,
    pub client_order_id: String,
    pub order_type: String,
    pub status: OrderStatus,
    pub avg_price: Option<f64>,
    pub filled_qty: f64,
    pub reduce_only: bool,
    /// Present when this update carries an actual fill fragment.
    pub delta: Option<TradeDelta>,
}

/// Event consumed by `OrderMirror::reconcile`.
#[derive(Debug, Clone)]
pub enum ExecutionReport {
    OrderUpdate(OrderUpdate),
    /// Exchange-reported signed position size, used for drift detection.
    AccountPosition {
        position_amt: f64,
        entry_price: f64,
    },
}

pub(crate) enum ParsedEvent {
    Report(ExecutionReport),
    ListenKeyExpired,
    Ignored,
}

/// Supervises the user-data stream: listen-key acquisition, keepalive,
/// reconnect with jittered backoff, and parsing of order/position events.
pub struct UserStreamSupervisor {
    client: Arc<BinanceFuturesClient>,
    symbol: String,
    ws_url: String,
    tx: mpsc::Sender<ExecutionReport>,
    shutdown: watch::Receiver<bool>,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

impl UserStreamSupervisor {
    pub fn new(
        client: Arc<BinanceFuturesClient>,
        symbol: String,
        ws_url: String,
        tx: mpsc::Sender<ExecutionReport>,
        shutdown: watch::Receiver<bool>,
        reconnect_initial: Duration,
        reconnect_max: Duration,
    ) -> Self {
        Self {
            client,
            symbol,
            ws_url,
            tx,
            shutdown,
            reconnect_initial,
            reconnect_max,
        }
    }

    pub async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.connect_and_stream().await {
                Ok(()) => break,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    tracing::error!(error = %e, attempt, "user-data stream lost");
                }
            }

            let delay = self.backoff_delay(attempt);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                "reconnecting user-data stream"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        tracing::info!("user-data stream stopped");
    }

    async fn connect_and_stream(&mut self) -> Result<()> {
        let listen_key = self.client.create_listen_key().await?;
        let url = format!("{}/ws/{listen_key}", self.ws_url);
        tracing::info!("connecting to user-data stream");

        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| crate::error::BotError::Timeout("connect user-data stream".into()))??;
        let (mut write, mut read) = ws.split();

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.client.keepalive_listen_key().await {
                        tracing::warn!(error = %e, "listen-key keepalive failed");
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match parse_user_event(&text, &self.symbol) {
                                ParsedEvent::Report(report) => {
                                    if self.tx.send(report).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                ParsedEvent::ListenKeyExpired => {
                                    return Err(crate::error::BotError::Internal(
                                        "listen key expired".into(),
                                    ));
                                }
                                ParsedEvent::Ignored => {}
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(crate::error::BotError::Internal(format!(
                                "user-data stream closed by server: {frame:?}"
                            )));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(crate::error::BotError::Internal(
                                "user-data stream ended".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .reconnect_initial
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.reconnect_max);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Parses one user-data event. Malformed payloads and events for other
/// symbols come back as `Ignored`; they are dropped, never fatal.
pub(crate) fn parse_user_event(text: &str, symbol: &str) -> ParsedEvent {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::warn!(
            payload = &text[..text.len().min(120)],
            "dropping malformed user-data payload"
        );
        return ParsedEvent::Ignored;
    };

    match value["e"].as_str() {
        Some("ORDER_TRADE_UPDATE") => parse_order_update(&value["o"], symbol),
        Some("ACCOUNT_UPDATE") => parse_account_update(&value["a"], symbol),
        Some("listenKeyExpired") => ParsedEvent::ListenKeyExpired,
        _ => ParsedEvent::Ignored,
    }
}

fn parse_order_update(order: &serde_json::Value, symbol: &str) -> ParsedEvent {
    if order["s"].as_str() != Some(symbol) {
        return ParsedEvent::Ignored;
    }
    let Some(order_id) = order["i"].as_i64() else {
        return ParsedEvent::Ignored;
    };
    let side = match order["S"].as_str() {
        Some("BUY") => OrderSide::Buy,
        Some("SELL") => OrderSide::Sell,
        _ => return ParsedEvent::Ignored,
    };

    let last_fill_qty = str_f64(&order["l"]);
    let delta = (last_fill_qty > 0.0).then(|| TradeDelta {
        order_id,
        side,
        price: str_f64(&order["L"]),
        qty: last_fill_qty,
        fee: str_f64(&order["n"]),
        timestamp: order["T"]
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now),
        maker: order["m"].as_bool().unwrap_or(false),
    });

    ParsedEvent::Report(ExecutionReport::OrderUpdate(OrderUpdate {
        order_id,
        client_order_id: order["c"].as_str().unwrap_or_default().to_string(),
        order_type: order["ot"].as_str().unwrap_or_default().to_string(),
        status: order_status_from_wire(order["X"].as_str().unwrap_or_default()),
        avg_price: Some(str_f64(&order["ap"])).filter(|p| *p > 0.0),
        filled_qty: str_f64(&order["z"]),
        reduce_only: order["R"].as_bool().unwrap_or(false),
        delta,
    }))
}

fn parse_account_update(account: &serde_json::Value, symbol: &str) -> ParsedEvent {
    let positions = account["P"].as_array();
    let Some(entry) = positions
        .into_iter()
        .flatten()
        .find(|p| p["s"].as_str() == Some(symbol))
    else {
        return ParsedEvent::Ignored;
    };
    ParsedEvent::Report(ExecutionReport::AccountPosition {
        position_amt: str_f64(&entry["pa"]),
        entry_price: str_f64(&entry["ep"]),
    })
}

fn str_f64(value: &serde_json::Value) -> f64 {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value.as_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_order_fill_with_delta() {
        let text = r#"{
            "e":"ORDER_TRADE_UPDATE","E":1700000000100,
            "o":{"s":"BTCUSDC","c":"x-entry-1","S":"BUY","o":"MARKET","ot":"MARKET",
                 "X":"FILLED","i":42,"l":"0.040","z":"0.040","L":"50012.5",
                 "ap":"50012.5","n":"0.02","T":1700000000100,"m":false,"R":false}
        }"#;

        let ParsedEvent::Report(ExecutionReport::OrderUpdate(update)) =
            parse_user_event(text, "BTCUSDC")
        else {
            panic!("expected order update");
        };
        assert_eq!(update.order_id, 42);
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.filled_qty, 0.04);
        assert_eq!(update.avg_price, Some(50012.5));

        let delta = update.delta.expect("fill should carry a delta");
        assert_eq!(delta.qty, 0.04);
        assert_eq!(delta.price, 50012.5);
        assert_eq!(delta.fee, 0.02);
        assert!(!delta.maker);
    }

    #[test]
    fn test_parse_order_update_without_fill_has_no_delta() {
        let text = r#"{
            "e":"ORDER_TRADE_UPDATE","E":1,
            "o":{"s":"BTCUSDC","c":"x-sl-1","S":"SELL","ot":"STOP_MARKET",
                 "X":"NEW","i":43,"l":"0","z":"0","L":"0","ap":"0","n":"0",
                 "T":1,"m":false,"R":true}
        }"#;

        let ParsedEvent::Report(ExecutionReport::OrderUpdate(update)) =
            parse_user_event(text, "BTCUSDC")
        else {
            panic!("expected order update");
        };
        assert_eq!(update.status, OrderStatus::Open);
        assert!(update.delta.is_none());
        assert!(update.reduce_only);
    }

    #[test]
    fn test_other_symbol_ignored() {
        let text = r#"{
            "e":"ORDER_TRADE_UPDATE","E":1,
            "o":{"s":"ETHUSDC","c":"c","S":"BUY","ot":"MARKET","X":"FILLED",
                 "i":1,"l":"1","z":"1","L":"10","ap":"10","n":"0","T":1,"m":false}
        }"#;
        assert!(matches!(
            parse_user_event(text, "BTCUSDC"),
            ParsedEvent::Ignored
        ));
    }

    #[test]
    fn test_parse_account_update() {
        let text = r#"{
            "e":"ACCOUNT_UPDATE","E":1,
            "a":{"B":[],"P":[{"s":"BTCUSDC","pa":"-0.040","ep":"50100.0"}]}
        }"#;

        let ParsedEvent::Report(ExecutionReport::AccountPosition {
            position_amt,
            entry_price,
        }) = parse_user_event(text, "BTCUSDC")
        else {
            panic!("expected account position");
        };
        assert_eq!(position_amt, -0.04);
        assert_eq!(entry_price, 50100.0);
    }

    #[test]
    fn test_listen_key_expiry_detected() {
        let text = r#"{"e":"listenKeyExpired","E":1}"#;
        assert!(matches!(
            parse_user_event(text, "BTCUSDC"),
            ParsedEvent::ListenKeyExpired
        ));
    }

    #[test]
    fn test_malformed_payload_ignored() {
        assert!(matches!(
            parse_user_event("][ not json", "BTCUSDC"),
            ParsedEvent::Ignored
        ));
    }
}
