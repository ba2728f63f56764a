// =============================================================================
// Application State — service facade shared by the HTTP adapter
// =============================================================================
//
// Ties the token provider, the feed transport and the REST client together
// and exposes the subscriber operations: add (with optional history
// backfill), remove, get, list and bar history.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::TokenProvider;
use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::market_data::Bar;
use crate::rest::RestClient;
use crate::subscriber::{handler_from_name, Subscriber, SubscriberInfo};
use crate::subscription::{DEFAULT_BOOK_DEPTH, MAX_DEPTH};
use crate::transport::{ConnectionManager, ConnectionState, TransportOptions};
use crate::types::{Exchange, Instrument, SubscriberId, Timeframe};

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSubscriberRequest {
    #[serde(default)]
    pub description: String,
    pub instrument: InstrumentRequest,
    #[serde(default)]
    pub strategy: StrategyRequest,
    /// Absent: all-trades at full depth plus a 10-level book.
    #[serde(default)]
    pub subscriptions: Option<SubscriptionsRequest>,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    /// Seed the bars with the last day of trades before going live.
    #[serde(default)]
    pub backfill: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentRequest {
    pub exchange: Exchange,
    pub code: String,
    pub board: String,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub with_delta: bool,
    #[serde(default)]
    pub with_market_profile: bool,
    #[serde(default)]
    pub with_order_book_profile: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionsRequest {
    #[serde(default)]
    pub all_trades: Option<AllTradesRequest>,
    #[serde(default)]
    pub order_book: Option<OrderBookRequest>,
    #[serde(default)]
    pub bars: Option<BarsRequest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllTradesRequest {
    #[serde(default)]
    pub frequency: u32,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub include_virtual_trades: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookRequest {
    #[serde(default)]
    pub frequency: u32,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarsRequest {
    #[serde(default)]
    pub frequency: u32,
    /// Unix seconds of the first bar to replay.
    #[serde(default)]
    pub from: i64,
    #[serde(default)]
    pub skip_history: bool,
    #[serde(default)]
    pub split_adjust: bool,
}

impl SubscriptionsRequest {
    fn defaults() -> Self {
        Self {
            all_trades: Some(AllTradesRequest {
                depth: MAX_DEPTH,
                ..AllTradesRequest::default()
            }),
            order_book: Some(OrderBookRequest {
                depth: DEFAULT_BOOK_DEPTH,
                ..OrderBookRequest::default()
            }),
            bars: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub connection: ConnectionState,
    pub ready: bool,
    pub subscribers: usize,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub server_time: i64,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    pub config: FeedConfig,
    pub token: Arc<TokenProvider>,
    pub connection: Arc<ConnectionManager>,
    pub rest: RestClient,
}

impl AppState {
    pub fn new(config: FeedConfig, token: Arc<TokenProvider>) -> Result<Self> {
        let connection =
            ConnectionManager::new(TransportOptions::from_config(&config), Arc::clone(&token));
        let rest = RestClient::new(config.hosts().data, Arc::clone(&token))?;
        Ok(Self {
            config,
            token,
            connection,
            rest,
        })
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            connection: self.connection.state(),
            ready: self.connection.is_ready(),
            subscribers: self.connection.list_subscribers().len(),
            token_expires_at: self.token.expires_at(),
            server_time: Utc::now().timestamp_millis(),
        }
    }

    /// Build a subscriber from `request` without attaching it.
    pub fn build_subscriber(&self, request: &AddSubscriberRequest) -> Result<Subscriber> {
        let instrument = Instrument::new(
            request.instrument.exchange,
            request.instrument.code.trim(),
            request.instrument.board.trim(),
        );
        if instrument.code.is_empty() || instrument.board.is_empty() {
            return Err(FeedError::InvalidRequest(
                "instrument code and board are required".to_string(),
            ));
        }

        let subscriptions = request
            .subscriptions
            .clone()
            .unwrap_or_else(SubscriptionsRequest::defaults);
        if subscriptions.all_trades.is_none()
            && subscriptions.order_book.is_none()
            && subscriptions.bars.is_none()
        {
            return Err(FeedError::InvalidRequest(
                "at least one subscription is required".to_string(),
            ));
        }

        let mut builder = Subscriber::builder(
            request.description.clone(),
            instrument,
            request.instrument.timeframe,
        )
        .with_bar_capacity(self.config.bar_capacity)
        .with_queue_capacity(self.config.subscriber_queue_capacity);

        let strategy = &request.strategy;
        if strategy.with_delta {
            builder = builder.with_delta();
        }
        if strategy.with_market_profile {
            builder = builder.with_market_profile();
        }
        if strategy.with_order_book_profile {
            builder = builder.with_order_flow();
        }
        if let Some(handler) = handler_from_name(&strategy.name)? {
            builder = builder.with_handler(handler);
        }
        if request.is_async {
            builder = builder.with_async();
        }

        if let Some(p) = subscriptions.all_trades {
            builder = builder.with_all_trades(p.frequency, p.depth, p.include_virtual_trades);
        }
        if let Some(p) = subscriptions.order_book {
            builder = builder.with_order_book(p.frequency, p.depth);
        }
        if let Some(p) = subscriptions.bars {
            builder = builder.with_bars(p.frequency, p.from, p.skip_history, p.split_adjust);
        }

        Ok(builder.build())
    }

    /// Build, attach, optionally backfill, then mark ready.
    ///
    /// Live events arriving during the backfill are parked in the subscriber
    /// and applied after the history; trades the two overlap on are dropped
    /// by id.
    pub async fn add_subscriber(&self, request: AddSubscriberRequest) -> Result<SubscriberId> {
        let subscriber = Arc::new(self.build_subscriber(&request)?);
        let id = subscriber.id();

        self.connection.attach_subscriber(Arc::clone(&subscriber)).await?;

        if request.backfill {
            if let Err(e) = self.backfill(&subscriber).await {
                warn!(subscriber = %id, error = %e, "backfill failed, removing subscriber");
                if let Err(remove_err) = self.connection.remove_subscriber(id).await {
                    warn!(subscriber = %id, error = %remove_err, "rollback after failed backfill");
                }
                return Err(e);
            }
        }

        subscriber.set_ready()?;
        info!(subscriber = %id, instrument = %subscriber.instrument(), "subscriber ready");
        Ok(id)
    }

    async fn backfill(&self, subscriber: &Subscriber) -> Result<usize> {
        let from = Utc::now() - chrono::Duration::days(1);
        let trades = self
            .rest
            .fetch_history(
                subscriber.instrument(),
                from,
                self.config.history_page_size,
                self.config.history_page_delay(),
            )
            .await?;
        let applied = subscriber.replay_trades(&trades);
        info!(
            subscriber = %subscriber.id(),
            fetched = trades.len(),
            applied,
            "history replayed"
        );
        Ok(applied)
    }

    pub async fn remove_subscriber(&self, id: SubscriberId) -> Result<()> {
        self.connection.remove_subscriber(id).await
    }

    pub fn subscriber(&self, id: SubscriberId) -> Result<SubscriberInfo> {
        self.connection
            .get_subscriber(&id)
            .map(|subscriber| subscriber.info())
            .ok_or(FeedError::SubscriberNotFound(id))
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let mut infos: Vec<SubscriberInfo> = self
            .connection
            .list_subscribers()
            .iter()
            .map(|subscriber| subscriber.info())
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn bars(&self, id: SubscriberId, heiken_ashi: bool) -> Result<Vec<Bar>> {
        self.connection.bars(&id, heiken_ashi)
    }
}
