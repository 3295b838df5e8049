//! Per (symbol, timeframe) tick-to-candle bucketing.
//!
//! Bucket boundaries are derived from tick timestamps, never the wall clock, so replayed or
//! delayed ticks land in the same bucket they would have live.

use crate::{
    candle::{AggregatorKey, Candle, CandleEvent, CandleEventKind, OpenCandle},
    tick::Tick,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Counters describing the life of a [`CandleAggregator`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct AggregatorStats {
    pub ticks_accepted: u64,
    pub ticks_rejected: u64,
    pub candles_completed: u64,
    /// Completed candles currently held in the rolling history.
    pub buffer_depth: usize,
    pub current_bucket_start: Option<DateTime<Utc>>,
    /// Empty intervals skipped by the most recent bucket roll-over.
    pub last_gap_intervals: u64,
    pub total_gap_intervals: u64,
}

/// Stateful bucketing engine for a single [`AggregatorKey`].
///
/// Not internally synchronised; the [`AggregatorRegistry`](crate::registry::AggregatorRegistry)
/// guards each instance with its own mutex so a key only ever has one mutator.
#[derive(Debug)]
pub struct CandleAggregator {
    key: AggregatorKey,
    tolerance: TimeDelta,
    history_capacity: usize,
    history: VecDeque<Candle>,
    current: Option<OpenCandle>,
    stats: AggregatorStats,
}

impl CandleAggregator {
    /// Construct a [`CandleAggregator`] retaining at most `history_capacity` completed candles,
    /// accepting ticks up to `tolerance` older than the open bucket start.
    pub fn new(key: AggregatorKey, history_capacity: usize, tolerance: TimeDelta) -> Self {
        let history_capacity = history_capacity.max(1);
        Self {
            key,
            tolerance,
            history_capacity,
            history: VecDeque::with_capacity(history_capacity),
            current: None,
            stats: AggregatorStats::default(),
        }
    }

    pub fn key(&self) -> &AggregatorKey {
        &self.key
    }

    /// Fold a [`Tick`] into the candle state.
    ///
    /// Returns a [`CandleEventKind::Partial`] event for ticks landing in the open bucket, a
    /// [`CandleEventKind::Completed`] event for the prior bucket when the tick opens a new one,
    /// and `None` when the tick is older than the out-of-order tolerance allows.
    pub fn ingest(&mut self, tick: &Tick) -> Option<CandleEvent> {
        let timeframe = self.key.timeframe;
        let tick_bucket = timeframe.bucket_start(tick.timestamp());

        let Some(current) = self.current.as_mut() else {
            let open = OpenCandle::seed(tick_bucket, tick);
            let candle = open.snapshot(&self.key, false);
            self.current = Some(open);
            self.stats.ticks_accepted += 1;
            self.stats.current_bucket_start = Some(tick_bucket);
            return Some(CandleEvent {
                kind: CandleEventKind::Partial,
                candle,
            });
        };

        let current_start = current.bucket_start();

        // Unrepresentable lower bound means every late tick is within tolerance
        let beyond_tolerance = current_start
            .checked_sub_signed(self.tolerance)
            .is_some_and(|earliest| tick.timestamp() < earliest);

        if beyond_tolerance {
            self.stats.ticks_rejected += 1;
            debug!(
                key = %self.key,
                tick_time = %tick.timestamp(),
                bucket_start = %current_start,
                "rejected tick older than out-of-order tolerance"
            );
            return None;
        }

        if tick_bucket <= current_start {
            // Same bucket, or a late tick within tolerance that is absorbed by the open bucket
            current.update(tick);
            self.stats.ticks_accepted += 1;
            return Some(CandleEvent {
                kind: CandleEventKind::Partial,
                candle: current.snapshot(&self.key, false),
            });
        }

        let completed = current.snapshot(&self.key, true);
        let gap = timeframe
            .intervals_between(current_start, tick_bucket)
            .saturating_sub(1);

        *current = OpenCandle::seed(tick_bucket, tick);
        self.push_history(completed.clone());

        self.stats.ticks_accepted += 1;
        self.stats.candles_completed += 1;
        self.stats.current_bucket_start = Some(tick_bucket);
        self.stats.last_gap_intervals = gap;
        self.stats.total_gap_intervals += gap;

        if gap > 0 {
            trace!(key = %self.key, gap, "bucket roll-over skipped empty intervals");
        }

        Some(CandleEvent {
            kind: CandleEventKind::Completed,
            candle: completed,
        })
    }

    /// Snapshot of the open candle, if any tick has been accepted yet.
    pub fn current_candle(&self) -> Option<Candle> {
        self.current
            .as_ref()
            .map(|open| open.snapshot(&self.key, false))
    }

    /// Completed candles, oldest first.
    pub fn history(&self) -> Vec<Candle> {
        self.history.iter().cloned().collect()
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            buffer_depth: self.history.len(),
            ..self.stats
        }
    }

    fn push_history(&mut self, candle: Candle) {
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(candle);
    }
}
