use std::time::Duration;

use crate::error::BotError;
use crate::models::MarginType;
use crate::Result;

const DEFAULT_SYMBOL: &str = "BTCUSDC";
const DEFAULT_REST_URL: &str = "https://fapi.binance.com";
const DEFAULT_WS_URL: &str = "wss://fstream.binance.com";
const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
const TESTNET_WS_URL: &str = "wss://fstream.binancefuture.com";
const DEFAULT_MARGIN_USAGE_PCT: f64 = 0.10;
const DEFAULT_REST_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_BUFFER_CAPACITY: usize = 200;
const DEFAULT_SNAPSHOT_5M: usize = 1300;
const DEFAULT_SNAPSHOT_15M: usize = 1200;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;
const DEFAULT_ORACLE_MODEL: &str = "gpt-5";
const DEFAULT_ORACLE_REASONING_EFFORT: &str = "high";

/// Default system instructions for the oracle session. Overridable via
/// `ORACLE_INSTRUCTIONS` for prompt iteration without a rebuild.
const DEFAULT_ORACLE_INSTRUCTIONS: &str = r#"You are a professional intraday futures trader acting as a signal source for an automated execution system. You receive 5m and 15m candlestick data (open, high, low, close, volume), recent fills, and the current position state. After each batch of closed candles, decide the desired position and reply with your reasoning followed by exactly one JSON object as the last thing in your response:

{
  "direction": "long" | "short" | "flat",
  "entry": { "kind": "market" | "limit", "price": number },
  "stop_loss": number,
  "take_profit": number,
  "leverage": number,
  "rationale": "short explanation"
}

Rules:
- "direction" is the position you want held after this message. "flat" closes everything; stop_loss/take_profit may then be omitted.
- For "long" and "short", stop_loss and take_profit are required and must be on the correct side of the entry price, with a risk-reward ratio of at least 1:2.
- "entry" is optional and defaults to a market order; limit entries require a price.
- "leverage" is optional; omit it to use the account default.
- Repeating your previous directive unchanged means: keep the current position and orders as they are.
- Only one position at a time. Prefer high-quality setups; avoid choppy markets.
"#;

/// Runtime configuration, loaded from the environment. Every option has a
/// documented default; only the API credentials are required.
#[derive(Debug, Clone)]
pub struct Settings {
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub oracle_api_key: String,

    /// Traded symbol. Default `BTCUSDC`.
    pub symbol: String,
    /// Fraction of the wallet balance committed as margin per trade,
    /// in (0, 1]. Default 0.10.
    pub margin_usage_pct: f64,
    /// Explicit leverage; `None` uses the exchange maximum for the symbol.
    pub leverage_override: Option<u32>,
    /// Margin mode applied at startup. Default ISOLATED.
    pub margin_type: MarginType,
    /// REST request timeout. Default 10s.
    pub rest_timeout: Duration,
    /// Binance futures REST / websocket endpoints, testnet-aware.
    pub rest_url: String,
    pub ws_url: String,
    pub use_testnet: bool,

    /// Candles kept per interval in the rolling buffer. Default 200.
    pub buffer_capacity: usize,
    /// History sent to the oracle on the first call. Defaults 1300 / 1200.
    pub snapshot_5m: usize,
    pub snapshot_15m: usize,
    /// Reconnect backoff policy: initial delay 1s, doubling to a 60s cap,
    /// jittered; retries are unbounded.
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,

    /// Oracle model / endpoint. Defaults: `gpt-5` against `https://api.x.ai/v1`
    /// (set `ORACLE_BASE_URL` for any OpenAI-compatible host).
    pub oracle_model: String,
    pub oracle_base_url: Option<String>,
    pub oracle_reasoning_effort: String,
    pub oracle_instructions: String,
}

impl Settings {
    pub fn from_env() -> Result<Settings> {
        let binance_api_key = require_env("BINANCE_API_KEY")?;
        let binance_api_secret = require_env("BINANCE_API_SECRET")?;
        let oracle_api_key = env_var("XAI_API_KEY")
            .or_else(|| env_var("OPENAI_API_KEY"))
            .ok_or_else(|| {
                BotError::Config(
                    "oracle API key is required; set XAI_API_KEY or OPENAI_API_KEY".into(),
                )
            })?;

        let use_testnet = env_flag("BINANCE_USE_TESTNET", false);
        let rest_url = env_var("BINANCE_REST_URL").unwrap_or_else(|| {
            if use_testnet {
                TESTNET_REST_URL.to_string()
            } else {
                DEFAULT_REST_URL.to_string()
            }
        });
        let ws_url = env_var("BINANCE_WS_URL").unwrap_or_else(|| {
            if use_testnet {
                TESTNET_WS_URL.to_string()
            } else {
                DEFAULT_WS_URL.to_string()
            }
        });

        let margin_usage_pct = env_parse("MARGIN_USAGE_PCT", DEFAULT_MARGIN_USAGE_PCT)?;
        if margin_usage_pct <= 0.0 || margin_usage_pct > 1.0 {
            return Err(BotError::Config(
                "MARGIN_USAGE_PCT must be in (0, 1]".into(),
            ));
        }

        let leverage_override = match env_var("MAX_SYMBOL_LEVERAGE") {
            Some(raw) => {
                let v: u32 = raw.parse().map_err(|_| {
                    BotError::Config(format!("invalid MAX_SYMBOL_LEVERAGE: {raw}"))
                })?;
                (v > 0).then_some(v)
            }
            None => None,
        };

        let margin_raw = env_var("MARGIN_TYPE").unwrap_or_else(|| "ISOLATED".to_string());
        let margin_type = MarginType::from_config(&margin_raw)
            .ok_or_else(|| BotError::Config(format!("invalid MARGIN_TYPE: {margin_raw}")))?;

        let snapshot_5m = env_parse("INITIAL_SNAPSHOT_5M", DEFAULT_SNAPSHOT_5M)?;
        let snapshot_15m = env_parse("INITIAL_SNAPSHOT_15M", DEFAULT_SNAPSHOT_15M)?;
        if snapshot_5m == 0 || snapshot_15m == 0 {
            return Err(BotError::Config(
                "initial snapshot candle counts must be positive".into(),
            ));
        }

        let buffer_capacity = env_parse("CANDLE_BUFFER_CAPACITY", DEFAULT_BUFFER_CAPACITY)?;
        if buffer_capacity == 0 {
            return Err(BotError::Config("CANDLE_BUFFER_CAPACITY must be positive".into()));
        }

        let rest_timeout_secs: f64 = env_parse("REST_CLIENT_TIMEOUT", DEFAULT_REST_TIMEOUT_SECS)?;
        let reconnect_initial_ms: u64 =
            env_parse("RECONNECT_INITIAL_MS", DEFAULT_RECONNECT_INITIAL_MS)?;
        let reconnect_max_ms: u64 = env_parse("RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?;

        Ok(Settings {
            binance_api_key,
            binance_api_secret,
            oracle_api_key,
            symbol: env_var("SYMBOL")
                .unwrap_or_else(|| DEFAULT_SYMBOL.to_string())
                .to_uppercase(),
            margin_usage_pct,
            leverage_override,
            margin_type,
            rest_timeout: Duration::from_secs_f64(rest_timeout_secs),
            rest_url,
            ws_url,
            use_testnet,
            buffer_capacity,
            snapshot_5m,
            snapshot_15m,
            reconnect_initial: Duration::from_millis(reconnect_initial_ms),
            reconnect_max: Duration::from_millis(reconnect_max_ms),
            oracle_model: env_var("XAI_MODEL")
                .or_else(|| env_var("OPENAI_MODEL"))
                .unwrap_or_else(|| DEFAULT_ORACLE_MODEL.to_string()),
            oracle_base_url: env_var("ORACLE_BASE_URL")
                .or_else(|| env_var("XAI_BASE_URL"))
                .or_else(|| env_var("OPENAI_BASE_URL")),
            oracle_reasoning_effort: env_var("ORACLE_REASONING_EFFORT")
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_ORACLE_REASONING_EFFORT.to_string()),
            oracle_instructions: env_var("ORACLE_INSTRUCTIONS")
                .unwrap_or_else(|| DEFAULT_ORACLE_INSTRUCTIONS.to_string()),
        })
    }

    /// Snapshot size for one interval.
    pub fn snapshot_size(&self, interval: crate::models::Interval) -> usize {
        match interval {
            crate::models::Interval::FiveMin => self.snapshot_5m,
            crate::models::Interval::FifteenMin => self.snapshot_15m,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn require_env(key: &str) -> Result<String> {
    env_var(key).ok_or_else(|| BotError::Config(format!("{key} is required")))
}

fn env_flag(key: &str, default: bool) -> bool {
    env_var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| BotError::Config(format!("invalid {key}: {raw}"))),
        None => Ok(default),
    }
}
