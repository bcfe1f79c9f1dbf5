use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

use perpbot::api::oracle::StatusPayload;
use perpbot::api::{BinanceFuturesClient, MarketHistory, OracleClient};
use perpbot::config::Settings;
use perpbot::execution::{
    translate, AccountContext, ExecutionReport, OrderMirror, UserStreamSupervisor,
};
use perpbot::feed::{CandleBuffer, FeedSupervisor};
use perpbot::models::{Candle, Directive, Interval, SymbolFilters, TradeDelta};

const CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "perpbot",
    about = "Mirrors oracle-issued trade directives onto a Binance futures position"
)]
struct Cli {
    /// Use the Binance futures testnet endpoints
    #[arg(long)]
    testnet: bool,
    /// Traded symbol (overrides SYMBOL from the environment)
    #[arg(long)]
    symbol: Option<String>,
}

/// Symbol metadata resolved once at startup and reused for every sizing pass.
#[derive(Clone, Copy)]
struct SymbolMeta {
    filters: SymbolFilters,
    max_leverage: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if cli.testnet {
        std::env::set_var("BINANCE_USE_TESTNET", "true");
    }
    if let Some(symbol) = &cli.symbol {
        std::env::set_var("SYMBOL", symbol);
    }

    setup_logging();
    tracing::info!("perpbot starting");

    let settings = Settings::from_env().context("loading configuration")?;
    let symbol = settings.symbol.clone();
    tracing::info!(
        %symbol,
        testnet = settings.use_testnet,
        margin_usage_pct = settings.margin_usage_pct,
        margin_type = settings.margin_type.as_wire(),
        "configuration loaded"
    );

    let binance = Arc::new(
        BinanceFuturesClient::new(
            settings.binance_api_key.clone(),
            settings.binance_api_secret.clone(),
            settings.rest_url.clone(),
            settings.rest_timeout,
        )
        .context("building exchange client")?,
    );

    // Credential check is fatal before any stream is opened.
    binance.ping().await.context("exchange unreachable")?;
    let balance = binance
        .account_balance()
        .await
        .context("exchange credential check failed")?;
    tracing::info!(wallet_balance = balance.wallet_balance, "exchange authenticated");

    let meta = initialize_symbol(&binance, &settings).await?;

    let mut oracle = OracleClient::new(
        settings.oracle_api_key.clone(),
        settings.oracle_model.clone(),
        settings.oracle_base_url.clone(),
        settings.rest_timeout.max(Duration::from_secs(220)),
        settings.oracle_instructions.clone(),
        settings.oracle_reasoning_effort.clone(),
    )
    .context("building oracle client")?;

    let leverage = settings
        .leverage_override
        .unwrap_or(meta.max_leverage)
        .min(meta.max_leverage);
    let mirror = Arc::new(Mutex::new(OrderMirror::new(
        binance.clone(),
        &symbol,
        leverage,
        settings.margin_type,
        meta.filters,
    )));
    // Adopt whatever position/orders already stand on the exchange.
    mirror
        .lock()
        .await
        .force_resync()
        .await
        .context("initial position sync")?;

    send_initial_snapshot(&settings, &binance, &mut oracle, &mirror, meta).await;

    let (candle_tx, mut candle_rx) = mpsc::channel::<Candle>(CHANNEL_CAPACITY);
    let (report_tx, mut report_rx) = mpsc::channel::<ExecutionReport>(CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed_task = tokio::spawn(
        FeedSupervisor::new(
            symbol.clone(),
            settings.ws_url.clone(),
            binance.clone(),
            CandleBuffer::new(settings.buffer_capacity),
            candle_tx,
            shutdown_rx.clone(),
            settings.reconnect_initial,
            settings.reconnect_max,
        )
        .run(),
    );
    let stream_task = tokio::spawn(
        UserStreamSupervisor::new(
            binance.clone(),
            symbol.clone(),
            settings.ws_url.clone(),
            report_tx,
            shutdown_rx,
            settings.reconnect_initial,
            settings.reconnect_max,
        )
        .run(),
    );

    tracing::info!("feed and execution streams running; press Ctrl+C to stop");

    let mut pending_deltas: Vec<TradeDelta> = Vec::new();
    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            report = report_rx.recv() => {
                let Some(report) = report else { break };
                if let ExecutionReport::OrderUpdate(update) = &report {
                    if let Some(delta) = &update.delta {
                        pending_deltas.push(delta.clone());
                    }
                }
                if let Err(e) = mirror.lock().await.reconcile(report).await {
                    tracing::error!(error = %e, "reconciliation failed");
                }
            }
            candle = candle_rx.recv() => {
                let Some(candle) = candle else { break };
                let batch = drain_candle_batch(candle, &mut candle_rx);
                handle_candle_batch(
                    batch,
                    &settings,
                    &binance,
                    &mut oracle,
                    &mirror,
                    meta,
                    &mut pending_deltas,
                )
                .await;
            }
        }
    }

    // Standing SL/TP orders stay live on the exchange by design; only the
    // subscriptions are closed.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, feed_task).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, stream_task).await;
    tracing::info!("perpbot stopped; protective orders remain on the exchange");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perpbot=info".into()),
        )
        .init();
}

/// Resolves symbol filters, applies the margin mode and leverage.
async fn initialize_symbol(
    binance: &BinanceFuturesClient,
    settings: &Settings,
) -> anyhow::Result<SymbolMeta> {
    let filters = binance
        .symbol_filters(&settings.symbol)
        .await
        .context("fetching symbol filters")?;
    let max_leverage = binance
        .max_leverage(&settings.symbol)
        .await
        .context("fetching leverage brackets")?;
    let leverage = settings
        .leverage_override
        .unwrap_or(max_leverage)
        .min(max_leverage);

    binance
        .set_margin_type(&settings.symbol, settings.margin_type.as_wire())
        .await
        .context("setting margin type")?;
    binance
        .set_leverage(&settings.symbol, leverage)
        .await
        .context("setting leverage")?;

    tracing::info!(
        tick_size = filters.tick_size,
        step_size = filters.step_size,
        max_leverage,
        leverage,
        "symbol initialized"
    );
    Ok(SymbolMeta {
        filters,
        max_leverage,
    })
}

/// Feeds the oracle its bounded history snapshot and applies the first
/// directive. Failures here are logged, not fatal: the bot proceeds to live
/// streaming and the next closed candle retries the conversation.
async fn send_initial_snapshot(
    settings: &Settings,
    binance: &Arc<BinanceFuturesClient>,
    oracle: &mut OracleClient,
    mirror: &Arc<Mutex<OrderMirror>>,
    meta: SymbolMeta,
) {
    let snapshot = async {
        let snap_5m = binance
            .klines(&settings.symbol, Interval::FiveMin, settings.snapshot_5m)
            .await?;
        let snap_15m = binance
            .klines(
                &settings.symbol,
                Interval::FifteenMin,
                settings.snapshot_15m,
            )
            .await?;
        perpbot::Result::Ok((snap_5m, snap_15m))
    }
    .await;

    let (snap_5m, snap_15m) = match snapshot {
        Ok((a, b)) if !a.is_empty() && !b.is_empty() => (a, b),
        Ok(_) => {
            tracing::error!("initial candle snapshot came back empty");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to fetch initial candle snapshot");
            return;
        }
    };

    let closed_5m: Vec<Candle> = snap_5m.into_iter().filter(|c| c.is_closed).collect();
    let closed_15m: Vec<Candle> = snap_15m.into_iter().filter(|c| c.is_closed).collect();
    tracing::info!(
        candles_5m = closed_5m.len(),
        candles_15m = closed_15m.len(),
        "sending initial snapshot to oracle"
    );

    match oracle
        .send_initial_snapshot(&settings.symbol, &closed_5m, &closed_15m)
        .await
    {
        Ok(directive) => {
            log_directive(&directive);
            apply_directive(directive, settings, binance, mirror, meta).await;
        }
        Err(e) => tracing::error!(error = %e, "initial oracle snapshot failed"),
    }
}

/// Collects every already-queued closed candle into one batch so a directive
/// is computed against the newest state, not a stale backlog.
fn drain_candle_batch(first: Candle, rx: &mut mpsc::Receiver<Candle>) -> Vec<Candle> {
    let mut batch = vec![first];
    while let Ok(candle) = rx.try_recv() {
        batch.push(candle);
    }
    batch
}

async fn handle_candle_batch(
    batch: Vec<Candle>,
    settings: &Settings,
    binance: &Arc<BinanceFuturesClient>,
    oracle: &mut OracleClient,
    mirror: &Arc<Mutex<OrderMirror>>,
    meta: SymbolMeta,
    pending_deltas: &mut Vec<TradeDelta>,
) {
    let mut candles_5m: Vec<Candle> = Vec::new();
    let mut candles_15m: Vec<Candle> = Vec::new();
    for candle in batch {
        match candle.interval {
            Interval::FiveMin => candles_5m.push(candle),
            Interval::FifteenMin => candles_15m.push(candle),
        }
    }
    candles_5m.sort_by_key(|c| c.open_time);
    candles_15m.sort_by_key(|c| c.open_time);

    let deltas = std::mem::take(pending_deltas);
    let status = StatusPayload::from_position(&mirror.lock().await.current_position());

    tracing::info!(
        candles_5m = candles_5m.len(),
        candles_15m = candles_15m.len(),
        trade_deltas = deltas.len(),
        "dispatching candle batch to oracle"
    );

    let directive = match oracle
        .request_directive(&candles_5m, &candles_15m, &deltas, &status)
        .await
    {
        Ok(directive) => directive,
        Err(e) => {
            tracing::error!(error = %e, "oracle signal request failed");
            return;
        }
    };

    log_directive(&directive);
    apply_directive(directive, settings, binance, mirror, meta).await;
}

/// Translates and applies one directive under the mirror's lock, the single
/// serialization point for all position mutations.
async fn apply_directive(
    directive: Directive,
    settings: &Settings,
    binance: &Arc<BinanceFuturesClient>,
    mirror: &Arc<Mutex<OrderMirror>>,
    meta: SymbolMeta,
) {
    let account = match build_account_context(settings, binance, meta).await {
        Ok(account) => account,
        Err(e) => {
            tracing::error!(error = %e, "account snapshot unavailable, directive dropped");
            return;
        }
    };

    let mut mirror = mirror.lock().await;
    let position = mirror.current_position();
    let plan = match translate(&directive, &position, &account) {
        Ok(plan) => plan,
        Err(e) => {
            tracing::warn!(error = %e, "directive not applied");
            return;
        }
    };
    if plan.is_empty() {
        tracing::info!("directive already satisfied, no order changes");
        return;
    }

    match mirror.apply(plan).await {
        Ok(report) if report.is_success() => {
            tracing::info!(
                steps = report.completed.len(),
                deferred = report.deferred.len(),
                "directive applied"
            );
        }
        Ok(report) => {
            let failure = report.failure.expect("failed report carries a failure");
            tracing::error!(
                step = %failure.step,
                error = %failure.error,
                completed = report.completed.len(),
                skipped = failure.skipped,
                "directive partially applied; awaiting next directive"
            );
        }
        Err(e) => tracing::error!(error = %e, "directive application failed"),
    }
}

async fn build_account_context(
    settings: &Settings,
    binance: &Arc<BinanceFuturesClient>,
    meta: SymbolMeta,
) -> perpbot::Result<AccountContext> {
    let balance = binance.account_balance().await?;
    let mark_price = binance.symbol_price(&settings.symbol).await?;
    let balance_age = (Utc::now() - balance.fetched_at)
        .to_std()
        .unwrap_or_default();
    Ok(AccountContext {
        wallet_balance: balance.wallet_balance,
        balance_age,
        mark_price,
        filters: meta.filters,
        max_leverage: meta.max_leverage,
        margin_usage_pct: settings.margin_usage_pct,
        leverage_override: settings.leverage_override,
    })
}

fn log_directive(directive: &Directive) {
    tracing::info!(
        direction = ?directive.direction,
        entry = ?directive.entry.kind,
        stop_loss = ?directive.stop_loss,
        take_profit = ?directive.take_profit,
        rationale = directive.rationale.as_deref().unwrap_or(""),
        "directive received"
    );
}
