// =============================================================================
// Subscription — one wire-level feed, keyed by a deterministic GUID
// =============================================================================
//
// Parameters are clamped before the GUID is derived, so two requests that the
// feed would treat identically share a GUID, and a resubscribe after
// reconnect reproduces the exact GUID the feed saw before.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};
use crate::types::{Guid, Instrument, Opcode, ResponseFormat, Timeframe};

/// Deepest book / trade replay the feed serves.
pub const MAX_DEPTH: u32 = 50;
/// Book depth used when none is requested.
pub const DEFAULT_BOOK_DEPTH: u32 = 10;

/// Kind-specific parameters, already clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionParams {
    AllTrades {
        frequency: u32,
        depth: u32,
        include_virtual_trades: bool,
    },
    OrderBook {
        frequency: u32,
        depth: u32,
    },
    Bars {
        frequency: u32,
        timeframe: Timeframe,
        from: i64,
        skip_history: bool,
        split_adjust: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    guid: Guid,
    instrument: Instrument,
    format: ResponseFormat,
    params: SubscriptionParams,
}

impl Subscription {
    pub fn all_trades(
        instrument: Instrument,
        format: ResponseFormat,
        frequency: u32,
        depth: u32,
        include_virtual_trades: bool,
    ) -> Self {
        let params = SubscriptionParams::AllTrades {
            frequency: clamp_frequency(frequency, format),
            depth: depth.min(MAX_DEPTH),
            include_virtual_trades,
        };
        Self::with_params(instrument, format, params)
    }

    pub fn order_book(
        instrument: Instrument,
        format: ResponseFormat,
        frequency: u32,
        depth: u32,
    ) -> Self {
        let depth = match depth {
            0 => DEFAULT_BOOK_DEPTH,
            d => d.min(MAX_DEPTH),
        };
        let params = SubscriptionParams::OrderBook {
            frequency: clamp_frequency(frequency, format),
            depth,
        };
        Self::with_params(instrument, format, params)
    }

    pub fn bars(
        instrument: Instrument,
        format: ResponseFormat,
        timeframe: Timeframe,
        frequency: u32,
        from: i64,
        skip_history: bool,
        split_adjust: bool,
    ) -> Self {
        let params = SubscriptionParams::Bars {
            frequency: clamp_frequency(frequency, format),
            timeframe,
            from,
            skip_history,
            split_adjust,
        };
        Self::with_params(instrument, format, params)
    }

    fn with_params(instrument: Instrument, format: ResponseFormat, params: SubscriptionParams) -> Self {
        let opcode = opcode_of(&params);
        let key_param = match &params {
            SubscriptionParams::AllTrades { depth, .. } => depth.to_string(),
            SubscriptionParams::OrderBook { depth, .. } => depth.to_string(),
            SubscriptionParams::Bars { timeframe, .. } => timeframe.to_string(),
        };
        let guid = Guid::new(format!(
            "{opcode}-{}-{}-{}-{key_param}-{format}",
            instrument.exchange, instrument.code, instrument.board
        ));
        Self {
            guid,
            instrument,
            format,
            params,
        }
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn opcode(&self) -> Opcode {
        opcode_of(&self.params)
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn format(&self) -> ResponseFormat {
        self.format
    }

    pub fn params(&self) -> &SubscriptionParams {
        &self.params
    }

    // -------------------------------------------------------------------------
    // Wire encoding
    // -------------------------------------------------------------------------

    /// JSON text of the subscribe request carrying `token`.
    pub fn subscribe_request(&self, token: &str) -> Result<String> {
        let common = CommonFields {
            opcode: self.opcode(),
            token,
            code: &self.instrument.code,
            exchange: self.instrument.exchange.to_string(),
            instrument_group: &self.instrument.board,
            format: self.format,
            guid: &self.guid,
        };

        let encoded = match &self.params {
            SubscriptionParams::AllTrades {
                frequency,
                depth,
                include_virtual_trades,
            } => serde_json::to_string(&AllTradesRequest {
                common,
                frequency: *frequency,
                depth: *depth,
                include_virtual_trades: *include_virtual_trades,
            }),
            SubscriptionParams::OrderBook { frequency, depth } => {
                serde_json::to_string(&OrderBookRequest {
                    common,
                    frequency: *frequency,
                    depth: *depth,
                })
            }
            SubscriptionParams::Bars {
                frequency,
                timeframe,
                from,
                skip_history,
                split_adjust,
            } => serde_json::to_string(&BarsRequest {
                common,
                frequency: *frequency,
                tf: *timeframe,
                from: *from,
                skip_history: *skip_history,
                split_adjust: *split_adjust,
            }),
        };

        encoded.map_err(|e| FeedError::Protocol(format!("encode subscribe request: {e}")))
    }
}

/// JSON text of the `Unsubscribe` request for `guid`.
pub fn unsubscribe_request(guid: &Guid, token: &str) -> Result<String> {
    serde_json::to_string(&UnsubscribeRequest {
        opcode: Opcode::Unsubscribe,
        token,
        guid,
    })
    .map_err(|e| FeedError::Protocol(format!("encode unsubscribe request: {e}")))
}

fn opcode_of(params: &SubscriptionParams) -> Opcode {
    match params {
        SubscriptionParams::AllTrades { .. } => Opcode::AllTrades,
        SubscriptionParams::OrderBook { .. } => Opcode::OrderBook,
        SubscriptionParams::Bars { .. } => Opcode::Bars,
    }
}

fn clamp_frequency(frequency: u32, format: ResponseFormat) -> u32 {
    frequency.max(format.min_frequency_ms())
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommonFields<'a> {
    opcode: Opcode,
    token: &'a str,
    code: &'a str,
    exchange: String,
    instrument_group: &'a str,
    format: ResponseFormat,
    guid: &'a Guid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AllTradesRequest<'a> {
    #[serde(flatten)]
    common: CommonFields<'a>,
    frequency: u32,
    #[serde(skip_serializing_if = "is_zero")]
    depth: u32,
    include_virtual_trades: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderBookRequest<'a> {
    #[serde(flatten)]
    common: CommonFields<'a>,
    frequency: u32,
    depth: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BarsRequest<'a> {
    #[serde(flatten)]
    common: CommonFields<'a>,
    frequency: u32,
    tf: Timeframe,
    from: i64,
    skip_history: bool,
    split_adjust: bool,
}

#[derive(Serialize)]
struct UnsubscribeRequest<'a> {
    opcode: Opcode,
    token: &'a str,
    guid: &'a Guid,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::types::Exchange;

    fn sber() -> Instrument {
        Instrument::new(Exchange::Moex, "SBER", "TQBR")
    }

    #[test]
    fn guid_is_deterministic_and_kind_prefixed() {
        let a = Subscription::order_book(sber(), ResponseFormat::Slim, 0, 20);
        let b = Subscription::order_book(sber(), ResponseFormat::Slim, 100, 20);
        assert_eq!(a.guid(), b.guid());
        assert_eq!(a.guid().as_str(), "OrderBookGetAndSubscribe-MOEX-SBER-TQBR-20-Slim");
        assert_eq!(a.guid().opcode().unwrap(), Opcode::OrderBook);
    }

    #[test]
    fn guid_separates_kinds_and_params() {
        let trades = Subscription::all_trades(sber(), ResponseFormat::Slim, 0, 10, false);
        let book = Subscription::order_book(sber(), ResponseFormat::Slim, 0, 10);
        let m1 = Subscription::bars(sber(), ResponseFormat::Slim, Timeframe::M1, 0, 0, true, false);
        let m5 = Subscription::bars(sber(), ResponseFormat::Slim, Timeframe::M5, 0, 0, true, false);
        assert_ne!(trades.guid(), book.guid());
        assert_ne!(m1.guid(), m5.guid());
        assert_eq!(m5.guid().as_str(), "BarsGetAndSubscribe-MOEX-SBER-TQBR-300-Slim");
    }

    #[test]
    fn depth_and_frequency_are_clamped() {
        let book = Subscription::order_book(sber(), ResponseFormat::Heavy, 100, 0);
        assert_eq!(
            book.params(),
            &SubscriptionParams::OrderBook { frequency: 500, depth: DEFAULT_BOOK_DEPTH }
        );

        let deep = Subscription::order_book(sber(), ResponseFormat::Slim, 5, 80);
        assert_eq!(deep.params(), &SubscriptionParams::OrderBook { frequency: 10, depth: 50 });

        let trades = Subscription::all_trades(sber(), ResponseFormat::Simple, 0, 500, true);
        assert_eq!(
            trades.params(),
            &SubscriptionParams::AllTrades { frequency: 25, depth: 50, include_virtual_trades: true }
        );
    }

    #[test]
    fn all_trades_request_shape() {
        let sub = Subscription::all_trades(sber(), ResponseFormat::Slim, 0, 0, false);
        let json: Value = serde_json::from_str(&sub.subscribe_request("tkn").unwrap()).unwrap();
        assert_eq!(json["opcode"], "AllTradesGetAndSubscribe");
        assert_eq!(json["token"], "tkn");
        assert_eq!(json["code"], "SBER");
        assert_eq!(json["exchange"], "MOEX");
        assert_eq!(json["instrumentGroup"], "TQBR");
        assert_eq!(json["format"], "Slim");
        assert_eq!(json["frequency"], 10);
        assert_eq!(json["includeVirtualTrades"], false);
        assert_eq!(json["guid"], sub.guid().as_str());
        assert!(json.get("depth").is_none());
    }

    #[test]
    fn bars_request_shape() {
        let sub = Subscription::bars(sber(), ResponseFormat::Slim, Timeframe::H1, 0, 1_700_000_000, false, true);
        let json: Value = serde_json::from_str(&sub.subscribe_request("t").unwrap()).unwrap();
        assert_eq!(json["opcode"], "BarsGetAndSubscribe");
        assert_eq!(json["tf"], 3600);
        assert_eq!(json["from"], 1_700_000_000i64);
        assert_eq!(json["skipHistory"], false);
        assert_eq!(json["splitAdjust"], true);
    }

    #[test]
    fn unsubscribe_request_shape() {
        let guid = Guid::new("OrderBookGetAndSubscribe-MOEX-SBER-TQBR-10-Slim");
        let json: Value = serde_json::from_str(&unsubscribe_request(&guid, "t").unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"opcode": "Unsubscribe", "token": "t", "guid": guid.as_str()}));
    }
}
