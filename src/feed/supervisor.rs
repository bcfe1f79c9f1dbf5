use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::api::MarketHistory;
use crate::feed::{CandleAggregator, CandleBuffer, RawFeedEvent};
use crate::models::{Candle, Interval};
use crate::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connection lifecycle of the market-data feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Synced,
    Streaming,
    Reconnecting,
}

/// Owns the live kline subscription and keeps the candle stream gap-free.
///
/// On every (re)connect the buffers are reconciled against REST history
/// (a full fill on bootstrap, only the gap since the last known close after
/// a reconnect) before the websocket messages are drained, so consumers see
/// one ordered, deduplicated sequence of closed candles. Reconnects retry
/// forever with jittered exponential backoff.
pub struct FeedSupervisor {
    symbol: String,
    ws_url: String,
    history: Arc<dyn MarketHistory>,
    buffer: CandleBuffer,
    tx: mpsc::Sender<Candle>,
    shutdown: watch::Receiver<bool>,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    state: FeedState,
    aggregators: HashMap<Interval, CandleAggregator>,
    bootstrapped: bool,
}

impl FeedSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        ws_url: String,
        history: Arc<dyn MarketHistory>,
        buffer: CandleBuffer,
        tx: mpsc::Sender<Candle>,
        shutdown: watch::Receiver<bool>,
        reconnect_initial: Duration,
        reconnect_max: Duration,
    ) -> Self {
        let aggregators = Interval::ALL
            .into_iter()
            .map(|i| (i, CandleAggregator::new(i)))
            .collect();
        Self {
            symbol,
            ws_url,
            history,
            buffer,
            tx,
            shutdown,
            reconnect_initial,
            reconnect_max,
            state: FeedState::Disconnected,
            aggregators,
            bootstrapped: false,
        }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    /// Runs until shutdown is signalled or every consumer is gone.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_state(if self.bootstrapped {
                FeedState::Reconnecting
            } else {
                FeedState::Connecting
            });

            match self.connect_and_stream().await {
                Ok(()) => break, // shutdown requested or consumers dropped
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    tracing::error!(error = %e, attempt, "market feed connection lost");
                }
            }

            let delay = self.backoff_delay(attempt);
            tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting market feed");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        self.set_state(FeedState::Disconnected);
        tracing::info!("market feed stopped");
    }

    async fn connect_and_stream(&mut self) -> Result<()> {
        let url = self.stream_url();
        tracing::info!(%url, "connecting to kline stream");

        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| crate::error::BotError::Timeout(format!("connect to {url}")))??;
        let (mut write, mut read) = ws.split();

        // Subscription is open; reconcile buffers against history before
        // draining live messages so nothing is missed in between.
        self.set_state(FeedState::Synced);
        self.sync_buffers().await?;
        self.set_state(FeedState::Streaming);

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_text(&text).await? {
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(crate::error::BotError::Internal(format!(
                                "kline stream closed by server: {frame:?}"
                            )));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(crate::error::BotError::Internal(
                                "kline stream ended".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Fills (bootstrap) or patches (reconnect) each interval buffer from
    /// REST history. Gap candles recovered after a reconnect are forwarded to
    /// consumers; the bootstrap fill is not.
    async fn sync_buffers(&mut self) -> Result<()> {
        for interval in Interval::ALL {
            let last_close = self.buffer.last_close_time(interval)?;
            match last_close {
                None => {
                    let capacity = self.buffer.capacity();
                    let history = self
                        .history
                        .klines(&self.symbol, interval, capacity)
                        .await?;
                    let total = self.buffer.backfill(interval, history)?;
                    tracing::info!(%interval, candles = total, "candle buffer bootstrapped");
                }
                Some(after) => {
                    let gap = self
                        .history
                        .klines_after(&self.symbol, interval, after, self.buffer.capacity())
                        .await?;
                    if gap.is_empty() {
                        continue;
                    }
                    tracing::info!(%interval, candles = gap.len(), "recovered candle gap");
                    for candle in gap {
                        self.deliver(candle).await?;
                    }
                }
            }
        }
        self.bootstrapped = true;
        Ok(())
    }

    /// Returns Ok(false) once every consumer has gone away.
    async fn handle_text(&mut self, text: &str) -> Result<bool> {
        let Some(raw) = parse_kline_message(text) else {
            tracing::warn!(
                payload = &text[..text.len().min(120)],
                "dropping malformed feed payload"
            );
            return Ok(true);
        };

        let closed = self
            .aggregators
            .get_mut(&raw.interval)
            .and_then(|agg| agg.ingest(RawFeedEvent::Kline(raw)));

        if let Some(candle) = closed {
            match self.deliver(candle).await {
                Ok(()) => return Ok(true),
                Err(crate::error::BotError::Internal(msg)) if msg.contains("consumer") => {
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Appends to the buffer and forwards to the consumer channel; duplicate
    /// keys are dropped here, which is what makes reconnect overlap safe.
    async fn deliver(&mut self, candle: Candle) -> Result<()> {
        if !self.buffer.push(candle.clone())? {
            return Ok(());
        }
        tracing::debug!(
            interval = %candle.interval,
            close = candle.close,
            close_time = %candle.close_time,
            "closed candle"
        );
        self.tx
            .send(candle)
            .await
            .map_err(|_| crate::error::BotError::Internal("feed consumer dropped".into()))
    }

    fn stream_url(&self) -> String {
        let symbol = self.symbol.to_lowercase();
        let streams = Interval::ALL
            .iter()
            .map(|i| format!("{symbol}@kline_{i}"))
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/stream?streams={streams}", self.ws_url)
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

    fn set_state(&mut self, next: FeedState) {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "feed state");
            self.state = next;
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    data: KlineEvent,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlineWire,
}

#[derive(Debug, Deserialize)]
struct KlineWire {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Parses a combined-stream (or bare) kline message; `None` for anything
/// malformed or not a kline for a tracked interval.
fn parse_kline_message(text: &str) -> Option<Candle> {
    let kline = serde_json::from_str::<StreamEnvelope>(text)
        .map(|e| e.data.kline)
        .or_else(|_| serde_json::from_str::<KlineEvent>(text).map(|e| e.kline))
        .ok()?;

    let interval = Interval::from_wire(&kline.interval)?;
    let open_time = chrono::DateTime::from_timestamp_millis(kline.open_time)?;
    let close_time = chrono::DateTime::from_timestamp_millis(kline.close_time)?;

    Some(Candle {
        interval,
        open_time,
        close_time,
        open: kline.open.parse().ok()?,
        high: kline.high.parse().ok()?,
        low: kline.low.parse().ok()?,
        close: kline.close.parse().ok()?,
        volume: kline.volume.parse().ok()?,
        is_closed: kline.is_closed,
    })
}
