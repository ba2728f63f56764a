// =============================================================================
// Slim payloads carried in `data` of feed responses
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// One print from the all-trades stream (also the REST history record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    #[serde(rename = "eid", default)]
    pub exchange_id: Option<String>,
    #[serde(rename = "sym", default)]
    pub symbol: String,
    #[serde(rename = "bd", default)]
    pub board: String,
    #[serde(rename = "q")]
    pub qty: i64,
    #[serde(rename = "px")]
    pub price: f64,
    /// Milliseconds since the unix epoch.
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "oi", default)]
    pub open_interest: i64,
    /// Set for records replayed from before the subscription.
    #[serde(rename = "h", default)]
    pub existing: bool,
    #[serde(rename = "s")]
    pub side: Side,
}

/// One price level of a book snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    #[serde(rename = "p")]
    pub price: f64,
    #[serde(rename = "v")]
    pub volume: i64,
    #[serde(rename = "y", default)]
    pub yield_: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    #[serde(rename = "b", default)]
    pub bids: Vec<Quote>,
    #[serde(rename = "a", default)]
    pub asks: Vec<Quote>,
    /// Milliseconds since the unix epoch.
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "h", default)]
    pub existing: bool,
}

/// A finished or in-progress bar emitted by the feed itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExternalBar {
    /// Seconds since the unix epoch.
    #[serde(rename = "t")]
    pub timestamp: i64,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: i64,
}
