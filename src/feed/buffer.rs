use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::error::BotError;
use crate::models::{Candle, Interval};
use crate::Result;

/// Thread-safe rolling window of closed candles per interval.
///
/// Invariants: strictly increasing `open_time` per interval, no duplicates,
/// and never more than `capacity` entries (oldest evicted first).
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<Interval, VecDeque<Candle>>>>,
    capacity: usize,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a closed candle. Returns `true` if the candle was new; a
    /// duplicate or out-of-order `open_time` is dropped and returns `false`.
    pub fn push(&self, candle: Candle) -> Result<bool> {
        if !candle.is_closed {
            return Ok(false);
        }
        let mut data = lock_write(&self.data)?;
        let candles = data.entry(candle.interval).or_default();

        if let Some(last) = candles.back() {
            if candle.open_time <= last.open_time {
                return Ok(false);
            }
            let expected = last.open_time + candle.interval.duration();
            if candle.open_time != expected {
                tracing::warn!(
                    interval = %candle.interval,
                    expected = %expected,
                    actual = %candle.open_time,
                    "gap in candle sequence"
                );
            }
        }

        candles.push_back(candle);
        while candles.len() > self.capacity {
            candles.pop_front();
        }
        Ok(true)
    }

    /// Merges a history fetch with whatever has already streamed in, keeping
    /// order and uniqueness and trimming to capacity from the oldest end.
    pub fn backfill(&self, interval: Interval, history: Vec<Candle>) -> Result<usize> {
        let mut data = lock_write(&self.data)?;
        let existing = data.entry(interval).or_default();

        let mut merged: Vec<Candle> = history
            .into_iter()
            .filter(|c| c.is_closed)
            .chain(existing.drain(..))
            .collect();
        merged.sort_by_key(|c| c.open_time);
        merged.dedup_by_key(|c| c.open_time);

        if merged.len() > self.capacity {
            let excess = merged.len() - self.capacity;
            merged.drain(..excess);
        }

        let added = merged.len();
        *existing = merged.into();
        Ok(added)
    }

    /// Close time of the newest candle, the resume point after a reconnect.
    pub fn last_close_time(&self, interval: Interval) -> Result<Option<DateTime<Utc>>> {
        let data = lock_read(&self.data)?;
        Ok(data
            .get(&interval)
            .and_then(|c| c.back())
            .map(|c| c.close_time))
    }

    pub fn last_open_time(&self, interval: Interval) -> Result<Option<DateTime<Utc>>> {
        let data = lock_read(&self.data)?;
        Ok(data
            .get(&interval)
            .and_then(|c| c.back())
            .map(|c| c.open_time))
    }

    pub fn len(&self, interval: Interval) -> Result<usize> {
        let data = lock_read(&self.data)?;
        Ok(data.get(&interval).map(|c| c.len()).unwrap_or(0))
    }

    pub fn is_empty(&self, interval: Interval) -> Result<bool> {
        Ok(self.len(interval)? == 0)
    }

    pub fn candles(&self, interval: Interval) -> Result<Vec<Candle>> {
        let data = lock_read(&self.data)?;
        Ok(data
            .get(&interval)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// The `n` most recent candles, oldest first.
    pub fn recent(&self, interval: Interval, n: usize) -> Result<Vec<Candle>> {
        let data = lock_read(&self.data)?;
        Ok(data
            .get(&interval)
            .map(|c| c.iter().rev().take(n).rev().cloned().collect())
            .unwrap_or_default())
    }
}

fn lock_read<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| BotError::Internal(format!("candle buffer lock poisoned: {e}")))
}

fn lock_write<T>(lock: &RwLock<T>) -> Result<std::sync::RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| BotError::Internal(format!("candle buffer lock poisoned: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle_at(interval: Interval, slot: i64) -> Candle {
        let dur = interval.duration();
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let open_time = base + dur * slot as i32;
        Candle {
            interval,
            open_time,
            close_time: open_time + dur - chrono::Duration::milliseconds(1),
            open: 100.0 + slot as f64,
            high: 101.0 + slot as f64,
            low: 99.0 + slot as f64,
            close: 100.5 + slot as f64,
            volume: 10.0,
            is_closed: true,
        }
    }

    #[test]
    fn test_push_and_read_back() {
        let buffer = CandleBuffer::new(100);
        for slot in 0..3 {
            assert!(buffer.push(candle_at(Interval::FiveMin, slot)).unwrap());
        }
        let candles = buffer.candles(Interval::FiveMin).unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, 100.5);
        assert_eq!(candles[2].close, 102.5);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let buffer = CandleBuffer::new(5);
        for slot in 0..10 {
            buffer.push(candle_at(Interval::FiveMin, slot)).unwrap();
        }
        let candles = buffer.candles(Interval::FiveMin).unwrap();
        assert_eq!(candles.len(), 5);
        assert_eq!(candles[0].close, 105.5);
        assert_eq!(candles[4].close, 109.5);
    }

    #[test]
    fn test_duplicate_and_stale_rejected() {
        let buffer = CandleBuffer::new(100);
        assert!(buffer.push(candle_at(Interval::FiveMin, 1)).unwrap());
        assert!(!buffer.push(candle_at(Interval::FiveMin, 1)).unwrap());
        assert!(!buffer.push(candle_at(Interval::FiveMin, 0)).unwrap());
        assert_eq!(buffer.len(Interval::FiveMin).unwrap(), 1);
    }

    #[test]
    fn test_open_candle_ignored() {
        let buffer = CandleBuffer::new(100);
        let mut open = candle_at(Interval::FiveMin, 0);
        open.is_closed = false;
        assert!(!buffer.push(open).unwrap());
        assert!(buffer.is_empty(Interval::FiveMin).unwrap());
    }

    #[test]
    fn test_intervals_are_independent() {
        let buffer = CandleBuffer::new(100);
        buffer.push(candle_at(Interval::FiveMin, 0)).unwrap();
        buffer.push(candle_at(Interval::FifteenMin, 0)).unwrap();
        assert_eq!(buffer.len(Interval::FiveMin).unwrap(), 1);
        assert_eq!(buffer.len(Interval::FifteenMin).unwrap(), 1);
    }

    #[test]
    fn test_backfill_merges_and_dedups() {
        let buffer = CandleBuffer::new(100);
        // Candles 5..7 streamed in while history was being fetched.
        buffer.push(candle_at(Interval::FiveMin, 5)).unwrap();
        buffer.push(candle_at(Interval::FiveMin, 6)).unwrap();

        let history: Vec<Candle> = (0..=5).map(|s| candle_at(Interval::FiveMin, s)).collect();
        buffer.backfill(Interval::FiveMin, history).unwrap();

        let candles = buffer.candles(Interval::FiveMin).unwrap();
        assert_eq!(candles.len(), 7);
        let times: Vec<_> = candles.iter().map(|c| c.open_time).collect();
        let mut sorted = times.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(times, sorted);
    }

    #[test]
    fn test_backfill_respects_capacity() {
        let buffer = CandleBuffer::new(4);
        let history: Vec<Candle> = (0..10).map(|s| candle_at(Interval::FiveMin, s)).collect();
        buffer.backfill(Interval::FiveMin, history).unwrap();

        let candles = buffer.candles(Interval::FiveMin).unwrap();
        assert_eq!(candles.len(), 4);
        // Oldest entries evicted, newest kept.
        assert_eq!(candles[3].close, 109.5);
    }

    #[test]
    fn test_last_close_time() {
        let buffer = CandleBuffer::new(100);
        assert_eq!(buffer.last_close_time(Interval::FiveMin).unwrap(), None);
        let candle = candle_at(Interval::FiveMin, 2);
        let expected = candle.close_time;
        buffer.push(candle).unwrap();
        assert_eq!(
            buffer.last_close_time(Interval::FiveMin).unwrap(),
            Some(expected)
        );
    }

    #[test]
    fn test_recent() {
        let buffer = CandleBuffer::new(100);
        for slot in 0..10 {
            buffer.push(candle_at(Interval::FiveMin, slot)).unwrap();
        }
        let recent = buffer.recent(Interval::FiveMin, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].close, 107.5);
        assert_eq!(recent[2].close, 109.5);
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let buffer = CandleBuffer::new(100);
        let clone = buffer.clone();
        let handle = thread::spawn(move || {
            for slot in 0..50 {
                clone.push(candle_at(Interval::FiveMin, slot)).unwrap();
            }
        });
        for slot in 0..50 {
            buffer.push(candle_at(Interval::FifteenMin, slot)).unwrap();
        }
        handle.join().unwrap();

        assert_eq!(buffer.len(Interval::FiveMin).unwrap(), 50);
        assert_eq!(buffer.len(Interval::FifteenMin).unwrap(), 50);
    }
}
