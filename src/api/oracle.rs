use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use crate::error::BotError;
use crate::models::{
    Candle, Directive, Interval, MirroredPosition, OrderPurpose, TradeDelta,
};
use crate::Result;

const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Candle as the oracle sees it: epoch-millisecond timestamps, raw floats.
#[derive(Debug, Serialize)]
pub struct CandlePayload {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl From<&Candle> for CandlePayload {
    fn from(c: &Candle) -> Self {
        Self {
            open_time: c.open_time.timestamp_millis(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            close_time: c.close_time.timestamp_millis(),
        }
    }
}

/// Position/order state reported to the oracle alongside each batch.
#[derive(Debug, Default, Serialize)]
pub struct StatusPayload {
    pub active_position: ActivePositionPayload,
    pub pending_entry: PendingEntryPayload,
}

#[derive(Debug, Default, Serialize)]
pub struct ActivePositionPayload {
    pub side: Option<String>,
    pub entry_price: Option<f64>,
    pub size: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: Option<u32>,
}

#[derive(Debug, Default, Serialize)]
pub struct PendingEntryPayload {
    pub side: Option<String>,
    pub price: Option<f64>,
    pub qty: Option<f64>,
}

impl StatusPayload {
    pub fn from_position(position: &MirroredPosition) -> Self {
        let mut payload = StatusPayload::default();

        if !position.is_flat() {
            payload.active_position = ActivePositionPayload {
                side: position.side.map(|s| format!("{s:?}").to_lowercase()),
                entry_price: Some(position.entry_price),
                size: Some(position.size),
                stop_loss: position
                    .order_by_purpose(OrderPurpose::StopLoss)
                    .and_then(|o| o.requested_price),
                take_profit: position
                    .order_by_purpose(OrderPurpose::TakeProfit)
                    .and_then(|o| o.requested_price),
                leverage: Some(position.leverage),
            };
        } else if let Some(entry) = position.pending_entry() {
            payload.pending_entry = PendingEntryPayload {
                side: Some(
                    match entry.side {
                        crate::models::OrderSide::Buy => "long",
                        crate::models::OrderSide::Sell => "short",
                    }
                    .to_string(),
                ),
                price: entry.requested_price,
                qty: Some(entry.requested_qty),
            };
        }

        payload
    }
}

/// Oracle session over an OpenAI-compatible Responses API.
///
/// The session carries the system instructions once and threads
/// `previous_response_id` through subsequent calls so the oracle keeps its own
/// conversational context; the bot only ever parses the trailing JSON object
/// of each reply.
pub struct OracleClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    reasoning_effort: String,
    instructions: String,
    previous_response_id: Option<String>,
}

impl OracleClient {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        timeout: Duration,
        instructions: String,
        reasoning_effort: String,
    ) -> Result<Self> {
        let mut base = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !base.ends_with("/v1") {
            base.push_str("/v1");
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base,
            api_key,
            model,
            reasoning_effort,
            instructions,
            previous_response_id: None,
        })
    }

    /// First call of a session: the bounded history snapshot per interval.
    pub async fn send_initial_snapshot(
        &mut self,
        symbol: &str,
        candles_5m: &[Candle],
        candles_15m: &[Candle],
    ) -> Result<Directive> {
        if self.previous_response_id.is_some() {
            return Err(BotError::Internal(
                "initial snapshot already sent for this session".into(),
            ));
        }
        let payload = json!({
            "phase": "initial_snapshot",
            "symbol": symbol,
            "snapshot": {
                "interval_5m": candles_5m.iter().map(CandlePayload::from).collect::<Vec<_>>(),
                "interval_15m": candles_15m.iter().map(CandlePayload::from).collect::<Vec<_>>(),
            },
        });
        self.dispatch(payload, true).await
    }

    /// Follow-up call: newly closed candles, fills since the last call, and
    /// the current position/pending-entry status.
    pub async fn request_directive(
        &mut self,
        candles_5m: &[Candle],
        candles_15m: &[Candle],
        trade_deltas: &[TradeDelta],
        status: &StatusPayload,
    ) -> Result<Directive> {
        let mut next_candles = serde_json::Map::new();
        next_candles.insert(
            Interval::FiveMin.as_str().to_string(),
            serde_json::to_value(candles_5m.iter().map(CandlePayload::from).collect::<Vec<_>>())?,
        );
        if !candles_15m.is_empty() {
            next_candles.insert(
                Interval::FifteenMin.as_str().to_string(),
                serde_json::to_value(
                    candles_15m.iter().map(CandlePayload::from).collect::<Vec<_>>(),
                )?,
            );
        }

        let payload = json!({
            "next_candles": next_candles,
            "trade_deltas": trade_deltas,
            "active_position": status.active_position,
            "pending_entry": status.pending_entry,
        });
        self.dispatch(payload, false).await
    }

    async fn dispatch(
        &mut self,
        payload: serde_json::Value,
        include_system: bool,
    ) -> Result<Directive> {
        let mut input = Vec::new();
        if include_system && !self.instructions.is_empty() {
            input.push(json!({"role": "system", "content": self.instructions}));
        }
        input.push(json!({"role": "user", "content": payload.to_string()}));

        let mut body = json!({
            "model": self.model,
            "input": input,
            "store": true,
            "reasoning": {"effort": self.reasoning_effort},
        });
        if let Some(prev) = &self.previous_response_id {
            body["previous_response_id"] = json!(prev);
        }

        let url = format!("{}/responses", self.base_url);
        let mut attempt = 0;
        let response: serde_json::Value = loop {
            attempt += 1;
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => break resp.json().await?,
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < MAX_RETRIES {
                        tracing::warn!(
                            status = status.as_u16(),
                            attempt,
                            "oracle request throttled/failed, retrying"
                        );
                        tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                        continue;
                    }
                    return Err(BotError::OracleContract(format!(
                        "oracle API error {status}: {}",
                        text.chars().take(300).collect::<String>()
                    )));
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        tracing::warn!(error = %e, attempt, "oracle request failed, retrying");
                        tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        };

        if let Some(id) = response["id"].as_str() {
            self.previous_response_id = Some(id.to_string());
        }

        let text = extract_output_text(&response).ok_or_else(|| {
            BotError::OracleContract("oracle response has no text content".into())
        })?;
        tracing::debug!(chars = text.len(), "oracle reply received");

        let raw = extract_trailing_json(&text).ok_or_else(|| {
            BotError::OracleContract("oracle response has no trailing JSON object".into())
        })?;
        parse_directive(raw)
    }
}

fn parse_directive(raw: &str) -> Result<Directive> {
    let directive: Directive = serde_json::from_str(raw)
        .map_err(|e| BotError::OracleContract(format!("directive does not match schema: {e}")))?;
    Ok(directive)
}

/// Pulls the assistant text out of a Responses-API reply, tolerating both the
/// flattened `output_text` convenience field and the structured output list.
fn extract_output_text(response: &serde_json::Value) -> Option<String> {
    if let Some(text) = response["output_text"].as_str() {
        if !text.trim().is_empty() {
            return Some(text.to_string());
        }
    }

    for item in response["output"].as_array().into_iter().flatten() {
        for content in item["content"].as_array().into_iter().flatten() {
            if content["type"].as_str() == Some("output_text") {
                if let Some(text) = content["text"].as_str() {
                    if !text.trim().is_empty() {
                        return Some(text.to_string());
                    }
                }
            }
        }
    }
    None
}

/// Finds the last balanced top-level JSON object in `text`, provided nothing
/// but whitespace (or a closing code fence) follows it. The oracle is told to
/// put its JSON last; everything before it is free-form reasoning.
pub(crate) fn extract_trailing_json(text: &str) -> Option<&str> {
    let trimmed = text.trim_end().trim_end_matches("```").trim_end();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = None;
    let mut last_object = None;

    for (idx, ch) in trimmed.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        last_object = start.map(|s| (s, idx + 1));
                    }
                }
            }
            _ => {}
        }
    }

    let (s, e) = last_object?;
    if !trimmed[e..].trim().is_empty() {
        return None;
    }
    Some(&trimmed[s..e])
}
