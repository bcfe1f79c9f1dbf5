use thiserror::Error;

/// Error taxonomy for the bot.
///
/// Transport errors (`Http`, `WebSocket`, `Timeout`) are transient and retried
/// with backoff by their callers. `ExchangeRejected` and `DirectiveRejected`
/// surface as a failed directive application and are never retried
/// automatically. `Config` failures are fatal at startup.
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Exchange rejected request (code {code}): {message}")]
    ExchangeRejected { code: i64, message: String },

    #[error("Oracle contract violation: {0}")]
    OracleContract(String),

    #[error("Directive rejected: {0}")]
    DirectiveRejected(String),

    #[error("Malformed feed payload: {0}")]
    MalformedPayload(String),

    #[error("Local state diverged from exchange: {0}")]
    Desync(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Transient failures that a retry loop may absorb.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BotError::Http(_) | BotError::WebSocket(_) | BotError::Timeout(_)
        )
    }
}
