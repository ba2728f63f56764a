// =============================================================================
// Broker REST client — historical all-trades
// =============================================================================
//
// Used to backfill a subscriber before it switches to the live stream. Every
// request carries the current access token from the shared TokenProvider.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

use crate::auth::TokenProvider;
use crate::error::{FeedError, Result};
use crate::market_data::Trade;
use crate::types::{Instrument, Side};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size the broker uses when `take` is not given.
pub const DEFAULT_TAKE: u32 = 5_000;

/// Filter for `GET /md/v2/Securities/{exchange}/{code}/alltrades`.
#[derive(Debug, Clone)]
pub struct AllTradesQuery {
    pub instrument: Instrument,
    /// Unix seconds.
    pub from: Option<i64>,
    /// Unix seconds.
    pub to: Option<i64>,
    pub from_id: Option<i64>,
    pub to_id: Option<i64>,
    pub qty_from: Option<i64>,
    pub qty_to: Option<i64>,
    pub price_from: Option<f64>,
    pub price_to: Option<f64>,
    pub side: Option<Side>,
    pub offset: u32,
    pub take: u32,
    pub descending: bool,
    pub include_virtual_trades: bool,
}

impl AllTradesQuery {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            from: None,
            to: None,
            from_id: None,
            to_id: None,
            qty_from: None,
            qty_to: None,
            price_from: None,
            price_to: None,
            side: None,
            offset: 0,
            take: DEFAULT_TAKE,
            descending: false,
            include_virtual_trades: false,
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("instrumentGroup", self.instrument.board.clone()),
            ("format", "Slim".to_string()),
            ("jsonResponse", "true".to_string()),
            ("descending", self.descending.to_string()),
            ("offset", self.offset.to_string()),
            ("take", self.take.to_string()),
        ];
        if let Some(v) = self.from {
            params.push(("from", v.to_string()));
        }
        if let Some(v) = self.to {
            params.push(("to", v.to_string()));
        }
        if let Some(v) = self.from_id {
            params.push(("fromId", v.to_string()));
        }
        if let Some(v) = self.to_id {
            params.push(("toId", v.to_string()));
        }
        if let Some(v) = self.qty_from {
            params.push(("qtyFrom", v.to_string()));
        }
        if let Some(v) = self.qty_to {
            params.push(("qtyTo", v.to_string()));
        }
        if let Some(v) = self.price_from {
            params.push(("priceFrom", v.to_string()));
        }
        if let Some(v) = self.price_to {
            params.push(("priceTo", v.to_string()));
        }
        if let Some(side) = self.side {
            params.push(("side", side.to_string()));
        }
        if self.include_virtual_trades {
            params.push(("includeVirtualTrades", "true".to_string()));
        }
        params
    }
}

/// Market-data REST client bound to the data host.
#[derive(Clone)]
pub struct RestClient {
    base_url: String,
    token: Arc<TokenProvider>,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: Arc<TokenProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FeedError::Rest(format!("http client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn trades_url(&self, instrument: &Instrument, suffix: &str) -> String {
        format!(
            "{}/md/v2/Securities/{}/{}/alltrades{}",
            self.base_url, instrument.exchange, instrument.code, suffix
        )
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&'static str, String)],
    ) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .query(params)
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(self.token.access_token())
            .send()
            .await
            .map_err(|e| FeedError::Rest(format!("GET {url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FeedError::Rest(format!("GET {url} returned {status}: {body}")));
        }

        resp.json()
            .await
            .map_err(|e| FeedError::Rest(format!("GET {url}: undecodable body: {e}")))
    }

    // -------------------------------------------------------------------------
    // All trades
    // -------------------------------------------------------------------------

    /// One page of the current-session trade tape.
    #[instrument(skip(self, query), name = "rest::get_all_trades", fields(instrument = %query.instrument, offset = query.offset))]
    pub async fn get_all_trades(&self, query: &AllTradesQuery) -> Result<Vec<Trade>> {
        let url = self.trades_url(&query.instrument, "");
        let trades: Vec<Trade> = self.get_json(&url, &query.params()).await?;
        debug!(count = trades.len(), "all-trades page received");
        Ok(trades)
    }

    /// Trades of past sessions within `[from, to]`.
    #[instrument(skip(self), name = "rest::get_all_trades_history")]
    pub async fn get_all_trades_history(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        let url = self.trades_url(instrument, "/history");
        let params = [
            ("instrumentGroup", instrument.board.clone()),
            ("format", "Slim".to_string()),
            ("jsonResponse", "true".to_string()),
            ("from", from.timestamp().to_string()),
            ("to", to.timestamp().to_string()),
        ];
        self.get_json(&url, &params).await
    }

    /// Page through the all-trades tape from `from` until the broker returns
    /// an empty page. Pages are requested `delay` apart.
    #[instrument(skip(self), name = "rest::fetch_history")]
    pub async fn fetch_history(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        page_size: u32,
        delay: Duration,
    ) -> Result<Vec<Trade>> {
        let mut query = AllTradesQuery::new(instrument.clone());
        query.from = Some(from.timestamp());
        query.take = page_size.max(1);

        let mut trades = Vec::new();
        loop {
            let page = self.get_all_trades(&query).await?;
            if page.is_empty() {
                break;
            }
            trades.extend(page);
            query.offset += query.take;
            tokio::time::sleep(delay).await;
        }

        info!(%instrument, count = trades.len(), "history fetched");
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::types::Exchange;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn token() -> Arc<TokenProvider> {
        let provider = TokenProvider::new("http://127.0.0.1:1", "r").unwrap();
        provider.set_access_token("access-1");
        Arc::new(provider)
    }

    fn trade(id: i64) -> Value {
        json!({ "id": id, "q": 1, "px": 100.0, "t": 1_700_000_000_000i64 + id, "s": "buy" })
    }

    fn sber() -> Instrument {
        Instrument::new(Exchange::Moex, "SBER", "TQBR")
    }

    #[test]
    fn query_carries_only_set_filters() {
        let mut query = AllTradesQuery::new(sber());
        query.from = Some(10);
        query.side = Some(Side::Sell);
        let params: HashMap<_, _> = query.params().into_iter().collect();
        assert_eq!(params["instrumentGroup"], "TQBR");
        assert_eq!(params["format"], "Slim");
        assert_eq!(params["take"], "5000");
        assert_eq!(params["from"], "10");
        assert_eq!(params["side"], "sell");
        assert!(!params.contains_key("to"));
        assert!(!params.contains_key("includeVirtualTrades"));
    }

    #[tokio::test]
    async fn pages_until_empty() {
        let router = Router::new().route(
            "/md/v2/Securities/:exchange/:code/alltrades",
            get(
                |Path((exchange, code)): Path<(String, String)>,
                 Query(q): Query<HashMap<String, String>>,
                 headers: HeaderMap| async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some("Bearer access-1");
                    if !authorized || exchange != "MOEX" || code != "SBER" {
                        return Err(StatusCode::FORBIDDEN);
                    }
                    let offset: i64 = q["offset"].parse().unwrap();
                    let take: i64 = q["take"].parse().unwrap();
                    let page: Vec<Value> = (offset..(offset + take).min(5)).map(trade).collect();
                    Ok(Json(page))
                },
            ),
        );
        let base = serve(router).await;
        let client = RestClient::new(base, token()).unwrap();

        let trades = client
            .fetch_history(&sber(), Utc::now(), 2, Duration::ZERO)
            .await
            .unwrap();
        let ids: Vec<i64> = trades.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn error_status_is_rest_failure() {
        let router = Router::new().route(
            "/md/v2/Securities/:exchange/:code/alltrades/history",
            get(|| async { (StatusCode::BAD_REQUEST, "bad range") }),
        );
        let base = serve(router).await;
        let client = RestClient::new(base, token()).unwrap();

        let err = client
            .get_all_trades_history(&sber(), Utc::now(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Rest(msg) if msg.contains("400")));
    }
}
