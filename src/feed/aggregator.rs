use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::models::{Candle, Interval};

/// Raw push event from the market-data stream.
#[derive(Debug, Clone)]
pub enum RawFeedEvent {
    /// Partial or final kline update; carries the running OHLCV for the
    /// current interval window.
    Kline(Candle),
    /// Individual trade print, aggregated locally into the current window.
    Trade(TradeTick),
}

#[derive(Debug, Clone, Copy)]
pub struct TradeTick {
    pub price: f64,
    pub qty: f64,
    pub timestamp: DateTime<Utc>,
}

/// Turns raw feed events for one interval into a stream of closed candles.
///
/// Emission is idempotent: a closed candle for an `(interval, open_time)`
/// that was already emitted is suppressed, so duplicate raw events are no-ops
/// downstream.
pub struct CandleAggregator {
    interval: Interval,
    working: Option<Candle>,
    last_emitted_open_time: Option<DateTime<Utc>>,
}

impl CandleAggregator {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            working: None,
            last_emitted_open_time: None,
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Feeds one raw event; returns a closed candle when an interval window
    /// completes (or when the feed delivers an already-closed candle, which
    /// passes through without re-aggregation).
    pub fn ingest(&mut self, event: RawFeedEvent) -> Option<Candle> {
        match event {
            RawFeedEvent::Kline(candle) => self.ingest_kline(candle),
            RawFeedEvent::Trade(tick) => self.ingest_trade(tick),
        }
    }

    fn ingest_kline(&mut self, candle: Candle) -> Option<Candle> {
        if candle.interval != self.interval {
            return None;
        }
        if candle.is_closed {
            if self
                .working
                .as_ref()
                .is_some_and(|w| w.open_time == candle.open_time)
            {
                self.working = None;
            }
            return self.emit(candle);
        }
        // Partial update: the stream repeats the full running OHLCV, so the
        // latest snapshot replaces the working state.
        self.working = Some(candle);
        None
    }

    fn ingest_trade(&mut self, tick: TradeTick) -> Option<Candle> {
        let open_time = self.bucket_open(tick.timestamp);
        let duration = self.interval.duration();

        let rolled = match &mut self.working {
            Some(working) if working.open_time == open_time => {
                working.high = working.high.max(tick.price);
                working.low = working.low.min(tick.price);
                working.close = tick.price;
                working.volume += tick.qty;
                None
            }
            Some(working) if working.open_time < open_time => {
                // Tick opened a new window: close out the previous one.
                let mut finished = working.clone();
                finished.is_closed = true;
                self.working = Some(new_working(self.interval, open_time, duration, tick));
                Some(finished)
            }
            Some(_) => None, // Late tick for an already-rolled window.
            None => {
                self.working = Some(new_working(self.interval, open_time, duration, tick));
                None
            }
        };

        rolled.and_then(|c| self.emit(c))
    }

    fn emit(&mut self, candle: Candle) -> Option<Candle> {
        debug_assert!(candle.is_closed);
        if self
            .last_emitted_open_time
            .is_some_and(|last| candle.open_time <= last)
        {
            return None;
        }
        self.last_emitted_open_time = Some(candle.open_time);
        Some(candle)
    }

    fn bucket_open(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let dur_ms = self.interval.duration().num_milliseconds();
        let ms = ts.timestamp_millis();
        let open_ms = ms - ms.rem_euclid(dur_ms);
        Utc.timestamp_millis_opt(open_ms)
            .single()
            .unwrap_or(ts)
    }
}

fn new_working(
    interval: Interval,
    open_time: DateTime<Utc>,
    duration: Duration,
    tick: TradeTick,
) -> Candle {
    Candle {
        interval,
        open_time,
        close_time: open_time + duration - Duration::milliseconds(1),
        open: tick.price,
        high: tick.price,
        low: tick.price,
        close: tick.price,
        volume: tick.qty,
        is_closed: false,
    }
}
