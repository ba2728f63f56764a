// =============================================================================
// Bar — one OHLCV bucket plus the analytics scoped to it
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::market_data::order_flow::OrderFlow;
use crate::types::Side;

/// Canonical map key for a price: fixed four decimals, so representation
/// noise (`100.1` vs `100.10000000000001`) lands in the same bucket.
pub fn price_key(price: f64) -> String {
    format!("{price:.4}")
}

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// Aggressor volume split for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub buy: i64,
    pub sell: i64,
    /// Buy minus sell.
    pub total: i64,
}

impl Delta {
    pub fn add(&mut self, side: Side, qty: i64) {
        match side {
            Side::Buy => {
                self.buy += qty;
                self.total += qty;
            }
            Side::Sell => {
                self.sell += qty;
                self.total -= qty;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Market profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileLevel {
    pub buy: i64,
    pub sell: i64,
    /// Buy plus sell.
    pub total: i64,
}

/// Volume traded at each price inside one bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketProfile {
    pub levels: BTreeMap<String, ProfileLevel>,
    pub poc_price: f64,
    pub poc_volume: i64,
}

impl MarketProfile {
    /// Accumulate `qty` at `price`. The point of control moves only when a
    /// level strictly exceeds the current maximum, so ties keep the first.
    pub fn add(&mut self, price: f64, qty: i64, side: Side) {
        let level = self.levels.entry(price_key(price)).or_default();
        match side {
            Side::Buy => level.buy += qty,
            Side::Sell => level.sell += qty,
        }
        level.total += qty;

        if level.total > self.poc_volume {
            self.poc_price = price;
            self.poc_volume = level.total;
        }
    }

    pub fn level(&self, price: f64) -> Option<&ProfileLevel> {
        self.levels.get(&price_key(price))
    }
}

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bucket start.
    pub time: DateTime<Utc>,
    /// Bucket start, seconds since the unix epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub delta: Delta,
    pub market_profile: MarketProfile,
    pub order_flow: OrderFlow,
}

impl Bar {
    /// A bar opened at `bucket_start` (seconds) with every price at `price`.
    pub fn open_at(bucket_start: i64, price: f64) -> Self {
        Self::from_ohlcv(bucket_start, price, price, price, price, 0)
    }

    pub fn from_ohlcv(
        bucket_start: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: i64,
    ) -> Self {
        Self {
            time: Utc
                .timestamp_opt(bucket_start, 0)
                .single()
                .unwrap_or_default(),
            timestamp: bucket_start,
            open,
            high,
            low,
            close,
            volume,
            delta: Delta::default(),
            market_profile: MarketProfile::default(),
            order_flow: OrderFlow::default(),
        }
    }

    /// Fold one trade into the price/volume fields.
    pub fn apply_trade(&mut self, price: f64, qty: i64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += qty;
    }
}

/// Heiken-Ashi view of `bars`; the first bar passes through unchanged.
pub fn heiken_ashi(bars: &[Bar]) -> Vec<Bar> {
    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        let smoothed = match out.last() {
            None => bar.clone(),
            Some(prev) => {
                let mut ha = bar.clone();
                ha.open = (prev.open + prev.close) / 2.0;
                ha.close = (bar.open + bar.high + bar.low + bar.close) / 4.0;
                ha.high = bar.high.max(bar.open).max(bar.close);
                ha.low = bar.low.min(bar.open).min(bar.close);
                ha
            }
        };
        out.push(smoothed);
    }
    out
}
