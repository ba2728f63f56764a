// =============================================================================
// Shared types used across the feed hub
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FeedError;

/// Trading venue served by the broker feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Moex,
    Spbx,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::Moex
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Moex => write!(f, "MOEX"),
            Self::Spbx => write!(f, "SPBX"),
        }
    }
}

/// Wire opcode. The three subscribe opcodes double as subscription kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Opcode {
    #[serde(rename = "BarsGetAndSubscribe")]
    Bars,
    #[serde(rename = "AllTradesGetAndSubscribe")]
    AllTrades,
    #[serde(rename = "OrderBookGetAndSubscribe")]
    OrderBook,
    #[serde(rename = "Unsubscribe")]
    Unsubscribe,
}

impl Opcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bars => "BarsGetAndSubscribe",
            Self::AllTrades => "AllTradesGetAndSubscribe",
            Self::OrderBook => "OrderBookGetAndSubscribe",
            Self::Unsubscribe => "Unsubscribe",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Opcode {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BarsGetAndSubscribe" => Ok(Self::Bars),
            "AllTradesGetAndSubscribe" => Ok(Self::AllTrades),
            "OrderBookGetAndSubscribe" => Ok(Self::OrderBook),
            "Unsubscribe" => Ok(Self::Unsubscribe),
            other => Err(FeedError::Protocol(format!("unknown opcode {other}"))),
        }
    }
}

/// Payload encoding requested from the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseFormat {
    Simple,
    Slim,
    Heavy,
}

impl ResponseFormat {
    /// Lowest update interval (ms) the feed accepts for this encoding.
    pub fn min_frequency_ms(&self) -> u32 {
        match self {
            Self::Slim => 10,
            Self::Simple => 25,
            Self::Heavy => 500,
        }
    }
}

impl Default for ResponseFormat {
    fn default() -> Self {
        Self::Slim
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "Simple"),
            Self::Slim => write!(f, "Slim"),
            Self::Heavy => write!(f, "Heavy"),
        }
    }
}

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Bar width in seconds. Only the intervals the feed serves are constructible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Timeframe(u32);

impl Timeframe {
    pub const S15: Self = Self(15);
    pub const M1: Self = Self(60);
    pub const M5: Self = Self(300);
    pub const M15: Self = Self(900);
    pub const H1: Self = Self(3_600);
    pub const D1: Self = Self(86_400);
    pub const W1: Self = Self(604_800);
    pub const MN1: Self = Self(2_592_000);
    pub const Y1: Self = Self(31_536_000);

    const SUPPORTED: [u32; 9] = [
        15, 60, 300, 900, 3_600, 86_400, 604_800, 2_592_000, 31_536_000,
    ];

    pub fn secs(&self) -> i64 {
        i64::from(self.0)
    }

    pub fn millis(&self) -> i64 {
        self.secs() * 1_000
    }
}

impl TryFrom<u32> for Timeframe {
    type Error = FeedError;

    fn try_from(secs: u32) -> Result<Self, Self::Error> {
        if Self::SUPPORTED.contains(&secs) {
            Ok(Self(secs))
        } else {
            Err(FeedError::InvalidRequest(format!(
                "unsupported timeframe {secs}s"
            )))
        }
    }
}

impl From<Timeframe> for u32 {
    fn from(tf: Timeframe) -> Self {
        tf.0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// One listed instrument on one board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: Exchange,
    pub code: String,
    pub board: String,
}

impl Instrument {
    pub fn new(exchange: Exchange, code: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            exchange,
            code: code.into(),
            board: board.into(),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.exchange, self.code, self.board)
    }
}

/// Deterministic key of a wire-level subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(String);

impl Guid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The subscription kind encoded in the leading `-` component.
    pub fn opcode(&self) -> Result<Opcode, FeedError> {
        let head = self.0.split('-').next().unwrap_or_default();
        head.parse()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SubscriberId {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| FeedError::InvalidRequest(format!("bad subscriber id: {e}")))
    }
}
