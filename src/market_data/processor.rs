// =============================================================================
// Data Processor — streaming bar synthesis for one subscriber
// =============================================================================
//
// Trades drive buckets: a trade in a new bucket opens a bar, and the bar
// behind it is final from then on. Book snapshots only annotate the open
// bucket. Feed-built bars bypass synthesis and overwrite OHLCV directly.
// Nothing here re-scans history; every update touches the newest bar only.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{FeedError, Result};
use crate::market_data::bar::Bar;
use crate::market_data::bar_ring::BarRing;
use crate::market_data::payload::{ExternalBar, OrderBookSnapshot, Trade};
use crate::types::Timeframe;

/// Which per-bar analytics to maintain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detailing {
    pub delta: bool,
    pub market_profile: bool,
    pub order_flow: bool,
}

/// What an input did to the bar history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new bucket was opened.
    Opened,
    /// The open bucket was updated.
    Updated,
    /// The input was not relevant (e.g. a book outside the open bucket).
    Skipped,
    /// The input was older than what has already been processed.
    Dropped,
}

pub struct DataProcessor {
    timeframe: Timeframe,
    detailing: Detailing,
    bars: BarRing,
    last_trade_id: Option<i64>,
}

impl DataProcessor {
    pub fn new(timeframe: Timeframe, detailing: Detailing, capacity: usize) -> Self {
        Self {
            timeframe,
            detailing,
            bars: BarRing::new(capacity),
            last_trade_id: None,
        }
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Fold one trade into the bar history.
    ///
    /// A trade whose id does not advance past the last one seen is a replay
    /// and is dropped without touching the open bar.
    pub fn new_all_trades(&mut self, trade: &Trade) -> Applied {
        if let Some(last) = self.last_trade_id {
            // Equal ids are replays too: backfill pages and the live stream
            // overlap on the boundary trade.
            if trade.id <= last {
                trace!(id = trade.id, last, "dropping replayed trade");
                return Applied::Dropped;
            }
        }

        let bucket_ms = self.timeframe.millis();
        let bucket_start = trade.timestamp_ms - trade.timestamp_ms.rem_euclid(bucket_ms);
        let bucket_secs = bucket_start / 1_000;

        let applied = match self.bars.active().map(|bar| bar.timestamp) {
            Some(open) if open == bucket_secs => Applied::Updated,
            Some(open) if open > bucket_secs => return Applied::Dropped,
            _ => {
                self.open_bar(Bar::open_at(bucket_secs, trade.price));
                Applied::Opened
            }
        };

        self.last_trade_id = Some(trade.id);

        let detailing = self.detailing;
        if let Some(bar) = self.bars.active_mut() {
            bar.apply_trade(trade.price, trade.qty);
            if detailing.delta {
                bar.delta.add(trade.side, trade.qty);
            }
            if detailing.market_profile {
                bar.market_profile.add(trade.price, trade.qty, trade.side);
            }
        }

        applied
    }

    /// Diff a book snapshot into the open bar's order flow.
    pub fn new_order_book(&mut self, book: &OrderBookSnapshot) -> Applied {
        if !self.detailing.order_flow {
            return Applied::Skipped;
        }

        let bucket_ms = self.timeframe.millis();
        let bucket_secs = (book.timestamp_ms - book.timestamp_ms.rem_euclid(bucket_ms)) / 1_000;

        match self.bars.active_mut() {
            Some(bar) if bar.timestamp == bucket_secs => {
                bar.order_flow.apply(&book.bids, &book.asks);
                Applied::Updated
            }
            _ => Applied::Skipped,
        }
    }

    /// Merge a bar built by the feed.
    pub fn new_bar(&mut self, external: &ExternalBar) -> Applied {
        let tf = self.timeframe.secs();
        let bucket_secs = external.timestamp - external.timestamp.rem_euclid(tf);

        match self.bars.active().map(|bar| bar.timestamp) {
            Some(open) if open == bucket_secs => {
                if let Some(bar) = self.bars.active_mut() {
                    bar.high = external.high;
                    bar.low = external.low;
                    bar.close = external.close;
                    bar.volume = external.volume;
                }
                Applied::Updated
            }
            Some(open) if open > bucket_secs => Applied::Dropped,
            _ => {
                self.open_bar(Bar::from_ohlcv(
                    bucket_secs,
                    external.open,
                    external.high,
                    external.low,
                    external.close,
                    external.volume,
                ));
                Applied::Opened
            }
        }
    }

    fn open_bar(&mut self, mut bar: Bar) {
        if let Some(previous) = self.bars.active() {
            bar.order_flow = previous.order_flow.carry_snapshot();
        }
        self.bars.push(bar);
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The open bar. Fails with `NoBarsAvailable` before the first input.
    pub fn last_bar(&self) -> Result<&Bar> {
        self.bars.active().ok_or(FeedError::NoBarsAvailable)
    }

    pub fn last_finalized(&self) -> Option<&Bar> {
        self.bars.last_finalized()
    }

    pub fn bars(&self) -> &BarRing {
        &self.bars
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn detailing(&self) -> Detailing {
        self.detailing
    }

    pub fn last_trade_id(&self) -> Option<i64> {
        self.last_trade_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::payload::Quote;
    use crate::types::Side;

    const T0: i64 = 1_700_000_040_000; // aligned to a minute

    fn trade(id: i64, ts: i64, price: f64, qty: i64, side: Side) -> Trade {
        Trade {
            id,
            exchange_id: None,
            symbol: "SBER".into(),
            board: "TQBR".into(),
            qty,
            price,
            timestamp_ms: ts,
            open_interest: 0,
            existing: false,
            side,
        }
    }

    fn all_on() -> Detailing {
        Detailing {
            delta: true,
            market_profile: true,
            order_flow: true,
        }
    }

    fn processor() -> DataProcessor {
        DataProcessor::new(Timeframe::M1, all_on(), 100)
    }

    #[test]
    fn no_bars_before_first_input() {
        let p = processor();
        assert!(matches!(p.last_bar(), Err(FeedError::NoBarsAvailable)));
    }

    #[test]
    fn single_bucket_ohlcv_and_delta() {
        let mut p = processor();
        assert_eq!(p.new_all_trades(&trade(1, T0 + 100, 100.0, 5, Side::Buy)), Applied::Opened);
        assert_eq!(p.new_all_trades(&trade(2, T0 + 200, 101.0, 3, Side::Sell)), Applied::Updated);

        let bar = p.last_bar().unwrap();
        assert_eq!(bar.timestamp, T0 / 1_000);
        assert_eq!((bar.open, bar.high, bar.low, bar.close), (100.0, 101.0, 100.0, 101.0));
        assert_eq!(bar.volume, 8);
        assert_eq!((bar.delta.buy, bar.delta.sell, bar.delta.total), (5, 3, 2));
    }

    #[test]
    fn bucket_boundary_finalizes_previous_bar() {
        let mut p = processor();
        p.new_all_trades(&trade(1, T0 + 1_000, 100.0, 1, Side::Buy));
        p.new_all_trades(&trade(2, T0 + 59_999, 102.0, 1, Side::Buy));
        assert!(p.last_finalized().is_none());

        assert_eq!(p.new_all_trades(&trade(3, T0 + 60_000, 103.0, 1, Side::Sell)), Applied::Opened);
        assert_eq!(p.bars().len(), 2);

        let finalized = p.last_finalized().unwrap();
        assert_eq!(finalized.close, 102.0);
        assert_eq!(finalized.timestamp, T0 / 1_000);
        let active = p.last_bar().unwrap();
        assert_eq!((active.open, active.close), (103.0, 103.0));
    }

    #[test]
    fn point_of_control_within_bucket() {
        let mut p = processor();
        p.new_all_trades(&trade(1, T0, 100.0, 5, Side::Buy));
        p.new_all_trades(&trade(2, T0 + 1, 101.0, 8, Side::Buy));
        p.new_all_trades(&trade(3, T0 + 2, 102.0, 3, Side::Sell));
        let profile = &p.last_bar().unwrap().market_profile;
        assert_eq!(profile.poc_price, 101.0);
        assert_eq!(profile.poc_volume, 8);
    }

    #[test]
    fn replayed_trade_is_dropped_without_mutation() {
        let mut p = processor();
        p.new_all_trades(&trade(10, T0, 100.0, 5, Side::Buy));
        let before = p.last_bar().unwrap().clone();

        assert_eq!(p.new_all_trades(&trade(9, T0 + 5, 150.0, 7, Side::Sell)), Applied::Dropped);
        assert_eq!(p.new_all_trades(&trade(10, T0 + 5, 150.0, 7, Side::Sell)), Applied::Dropped);
        assert_eq!(p.last_bar().unwrap(), &before);
        assert_eq!(p.last_trade_id(), Some(10));
    }

    #[test]
    fn detailing_off_leaves_analytics_empty() {
        let mut p = DataProcessor::new(Timeframe::M1, Detailing::default(), 10);
        p.new_all_trades(&trade(1, T0, 100.0, 5, Side::Buy));
        let bar = p.last_bar().unwrap();
        assert_eq!(bar.delta.total, 0);
        assert!(bar.market_profile.levels.is_empty());
        assert_eq!(bar.volume, 5);
    }

    #[test]
    fn book_never_opens_a_bucket() {
        let mut p = processor();
        let book = OrderBookSnapshot {
            bids: vec![Quote { price: 99.0, volume: 5, yield_: 0 }],
            asks: vec![],
            timestamp_ms: T0,
            existing: false,
        };
        assert_eq!(p.new_order_book(&book), Applied::Skipped);
        assert!(p.last_bar().is_err());

        p.new_all_trades(&trade(1, T0 + 10, 100.0, 1, Side::Buy));
        assert_eq!(p.new_order_book(&book), Applied::Updated);
        assert_eq!(p.last_bar().unwrap().order_flow.bids.total_inc, 5);

        let later = OrderBookSnapshot { timestamp_ms: T0 + 60_000, ..book };
        assert_eq!(p.new_order_book(&later), Applied::Skipped);
    }

    #[test]
    fn external_bars_open_update_and_drop() {
        let mut p = processor();
        let t = T0 / 1_000;
        let first = ExternalBar { timestamp: t, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 10 };
        assert_eq!(p.new_bar(&first), Applied::Opened);

        let update = ExternalBar { high: 3.0, close: 2.5, volume: 15, ..first };
        assert_eq!(p.new_bar(&update), Applied::Updated);
        let bar = p.last_bar().unwrap();
        assert_eq!((bar.open, bar.high, bar.close, bar.volume), (1.0, 3.0, 2.5, 15));

        let next = ExternalBar { timestamp: t + 60, ..first };
        assert_eq!(p.new_bar(&next), Applied::Opened);
        let stale = ExternalBar { timestamp: t - 60, ..first };
        assert_eq!(p.new_bar(&stale), Applied::Dropped);
        assert_eq!(p.bars().len(), 2);
    }
}
