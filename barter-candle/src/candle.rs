use crate::{tick::Tick, timeframe::Timeframe};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Uniquely identifies one [`CandleAggregator`](crate::aggregator::CandleAggregator).
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Constructor, Deserialize, Serialize,
)]
#[display("{symbol}@{timeframe}")]
pub struct AggregatorKey {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
}

/// Normalised OHLCV summary of every tick accepted into the bucket
/// `[bucket_start, bucket_start + timeframe)`.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Candle {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
    pub tick_count: u64,
    pub is_complete: bool,
}

impl Candle {
    pub fn key(&self) -> AggregatorKey {
        AggregatorKey::new(self.symbol.clone(), self.timeframe)
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + self.timeframe.duration()
    }
}

/// Whether a [`CandleEvent`] carries the live-forming or the finalised candle of a bucket.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleEventKind {
    #[display("partial")]
    Partial,
    #[display("completed")]
    Completed,
}

/// Output of a single [`CandleAggregator::ingest`](crate::aggregator::CandleAggregator::ingest).
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct CandleEvent {
    pub kind: CandleEventKind,
    pub candle: Candle,
}

impl CandleEvent {
    pub fn key(&self) -> AggregatorKey {
        self.candle.key()
    }

    pub fn is_completed(&self) -> bool {
        self.kind == CandleEventKind::Completed
    }
}

/// Mutable state of the open bucket, owned exclusively by its aggregator.
#[derive(Clone, Debug)]
pub(crate) struct OpenCandle {
    bucket_start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    // Σ(price × size)
    notional: f64,
    tick_count: u64,
}

impl OpenCandle {
    pub(crate) fn seed(bucket_start: DateTime<Utc>, tick: &Tick) -> Self {
        Self {
            bucket_start,
            open: tick.price(),
            high: tick.price(),
            low: tick.price(),
            close: tick.price(),
            volume: tick.size(),
            notional: tick.price() * tick.size(),
            tick_count: 1,
        }
    }

    pub(crate) fn update(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price());
        self.low = self.low.min(tick.price());
        self.close = tick.price();
        self.volume += tick.size();
        self.notional += tick.price() * tick.size();
        self.tick_count += 1;
    }

    pub(crate) fn bucket_start(&self) -> DateTime<Utc> {
        self.bucket_start
    }

    /// Volume weighted average price, falling back to the close for zero-volume buckets.
    pub(crate) fn vwap(&self) -> f64 {
        if self.volume > 0.0 {
            self.notional / self.volume
        } else {
            self.close
        }
    }

    pub(crate) fn snapshot(&self, key: &AggregatorKey, is_complete: bool) -> Candle {
        Candle {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            bucket_start: self.bucket_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            vwap: self.vwap(),
            tick_count: self.tick_count,
            is_complete,
        }
    }
}
