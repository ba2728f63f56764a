// =============================================================================
// Order Flow — resting-volume changes between consecutive book snapshots
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::market_data::bar::price_key;
use crate::market_data::payload::Quote;

/// Price key -> (price, resting volume).
type Levels = BTreeMap<String, (f64, i64)>;

/// Increase/decrease tallies for one side of the book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideFlow {
    pub increased: BTreeMap<String, i64>,
    pub decreased: BTreeMap<String, i64>,
    pub total_inc: i64,
    pub total_dec: i64,
}

impl SideFlow {
    fn record_inc(&mut self, key: &str, volume: i64) {
        *self.increased.entry(key.to_string()).or_default() += volume;
        self.total_inc += volume;
    }

    fn record_dec(&mut self, key: &str, volume: i64) {
        *self.decreased.entry(key.to_string()).or_default() += volume;
        self.total_dec += volume;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFlow {
    /// Lots that appeared across both sides.
    pub total_inc: i64,
    /// Lots that disappeared across both sides.
    pub total_dec: i64,
    pub bids: SideFlow,
    pub asks: SideFlow,
    #[serde(skip)]
    last_bids: Levels,
    #[serde(skip)]
    last_asks: Levels,
}

impl OrderFlow {
    /// Empty tallies that diff against this flow's last snapshot, so the first
    /// book of a new bucket is not counted as all-new volume.
    pub fn carry_snapshot(&self) -> Self {
        Self {
            last_bids: self.last_bids.clone(),
            last_asks: self.last_asks.clone(),
            ..Self::default()
        }
    }

    /// Diff a snapshot against the stored one, then store it.
    ///
    /// Combined totals count every change. Per-side decreases are counted
    /// only while that side did not retreat: asks when the best ask held or
    /// rose, bids when the best bid held or fell.
    pub fn apply(&mut self, bids: &[Quote], asks: &[Quote]) {
        let bids = to_levels(bids);
        let asks = to_levels(asks);

        let asks_held = match (best_ask(&asks), best_ask(&self.last_asks)) {
            (Some(now), Some(before)) => now >= before,
            _ => true,
        };
        let bids_held = match (best_bid(&bids), best_bid(&self.last_bids)) {
            (Some(now), Some(before)) => now <= before,
            _ => true,
        };

        let (inc, dec) = diff(&self.last_bids, &bids);
        for (key, volume) in inc {
            self.bids.record_inc(&key, volume);
            self.total_inc += volume;
        }
        for (key, volume) in dec {
            if bids_held {
                self.bids.record_dec(&key, volume);
            }
            self.total_dec += volume;
        }

        let (inc, dec) = diff(&self.last_asks, &asks);
        for (key, volume) in inc {
            self.asks.record_inc(&key, volume);
            self.total_inc += volume;
        }
        for (key, volume) in dec {
            if asks_held {
                self.asks.record_dec(&key, volume);
            }
            self.total_dec += volume;
        }

        self.last_bids = bids;
        self.last_asks = asks;
    }

    /// (bid additions - ask additions) / all additions, in [-1, 1].
    pub fn imbalance(&self) -> f64 {
        let total = self.bids.total_inc + self.asks.total_inc;
        if total > 0 {
            (self.bids.total_inc - self.asks.total_inc) as f64 / total as f64
        } else {
            0.0
        }
    }
}

fn to_levels(quotes: &[Quote]) -> Levels {
    let mut levels = Levels::new();
    for quote in quotes {
        let entry = levels.entry(price_key(quote.price)).or_insert((quote.price, 0));
        entry.1 += quote.volume;
    }
    levels
}

fn best_ask(levels: &Levels) -> Option<f64> {
    levels.values().map(|(p, _)| *p).reduce(f64::min)
}

fn best_bid(levels: &Levels) -> Option<f64> {
    levels.values().map(|(p, _)| *p).reduce(f64::max)
}

/// Per-level increases and decreases from `before` to `after`.
fn diff(before: &Levels, after: &Levels) -> (Vec<(String, i64)>, Vec<(String, i64)>) {
    let mut inc = Vec::new();
    let mut dec = Vec::new();

    for (key, (_, volume)) in after {
        match before.get(key) {
            None => inc.push((key.clone(), *volume)),
            Some((_, prev)) if volume > prev => inc.push((key.clone(), volume - prev)),
            Some((_, prev)) if volume < prev => dec.push((key.clone(), prev - volume)),
            Some(_) => {}
        }
    }
    for (key, (_, prev)) in before {
        if !after.contains_key(key) {
            dec.push((key.clone(), *prev));
        }
    }

    (inc, dec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(price: f64, volume: i64) -> Quote {
        Quote {
            price,
            volume,
            yield_: 0,
        }
    }

    #[test]
    fn first_snapshot_counts_as_increase() {
        let mut flow = OrderFlow::default();
        flow.apply(&[q(99.0, 5), q(98.0, 2)], &[q(101.0, 4)]);
        assert_eq!(flow.total_inc, 11);
        assert_eq!(flow.total_dec, 0);
        assert_eq!(flow.bids.total_inc, 7);
        assert_eq!(flow.asks.increased.get("101.0000"), Some(&4));
    }

    #[test]
    fn diffs_against_previous_snapshot() {
        let mut flow = OrderFlow::default();
        flow.apply(&[q(99.0, 5)], &[q(101.0, 4), q(102.0, 3)]);
        flow.apply(&[q(99.0, 8)], &[q(101.0, 1), q(102.0, 3)]);

        assert_eq!(flow.bids.increased.get("99.0000"), Some(&8));
        assert_eq!(flow.total_inc, 5 + 7 + 3);
        assert_eq!(flow.asks.decreased.get("101.0000"), Some(&3));
        assert_eq!(flow.total_dec, 3);
    }

    #[test]
    fn vanished_level_is_a_decrease() {
        let mut flow = OrderFlow::default();
        flow.apply(&[q(99.0, 5), q(98.0, 2)], &[]);
        flow.apply(&[q(99.0, 5)], &[]);
        assert_eq!(flow.bids.decreased.get("98.0000"), Some(&2));
        assert_eq!(flow.total_dec, 2);
    }

    #[test]
    fn retreating_side_skips_per_side_decrease() {
        let mut flow = OrderFlow::default();
        flow.apply(&[], &[q(101.0, 4), q(102.0, 3)]);
        // best ask falls from 101 to 100.5: ask side retreated
        flow.apply(&[], &[q(100.5, 1), q(102.0, 1)]);
        assert_eq!(flow.asks.total_dec, 0);
        assert_eq!(flow.total_dec, 4 + 2);
    }

    #[test]
    fn carry_snapshot_resets_tallies_but_keeps_book() {
        let mut flow = OrderFlow::default();
        flow.apply(&[q(99.0, 5)], &[q(101.0, 4)]);
        let mut next = flow.carry_snapshot();
        assert_eq!(next.total_inc, 0);
        next.apply(&[q(99.0, 5)], &[q(101.0, 4)]);
        assert_eq!(next.total_inc, 0);
        assert_eq!(next.total_dec, 0);
    }

    #[test]
    fn imbalance_sign() {
        let mut flow = OrderFlow::default();
        flow.apply(&[q(99.0, 3)], &[q(101.0, 1)]);
        assert!((flow.imbalance() - 0.5).abs() < 1e-9);
    }
}
