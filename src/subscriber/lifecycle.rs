// =============================================================================
// Subscriber — one client's standing interest in one instrument/timeframe
// =============================================================================
//
// Lifecycle: Created -> Subscribing -> Ready -> Done. Done is terminal.
//
// Before Ready, live events are parked in `pending` so that a history replay
// and the live stream never interleave inside a bar. `set_ready` drains the
// parked events through the processor and only then flips the state.
//
// Async subscribers push Ready events onto a private queue drained by their
// own worker task, keeping a slow strategy off the shared dispatch loop.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{FeedError, Result};
use crate::market_data::{
    heiken_ashi, Applied, Bar, DataProcessor, Detailing, ExternalBar, OrderBookSnapshot, Trade,
    DEFAULT_BAR_CAPACITY,
};
use crate::queue::{EventQueue, DEFAULT_QUEUE_CAPACITY};
use crate::subscriber::handler::EventHandler;
use crate::subscription::Subscription;
use crate::transport::frame::Event;
use crate::types::{Guid, Instrument, Opcode, ResponseFormat, SubscriberId, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    /// Subscriptions declared, nothing sent yet.
    Created,
    /// Subscribe requests sent; live events are parked.
    Subscribing,
    /// Live events are processed.
    Ready,
    /// Terminal.
    Done,
}

/// Serializable snapshot for API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub state: SubscriberState,
    #[serde(rename = "async")]
    pub is_async: bool,
    pub detailing: Detailing,
    pub subscriptions: BTreeMap<Opcode, Guid>,
    pub handler: Option<String>,
    pub bars: usize,
    pub pending: usize,
}

struct Inner {
    state: SubscriberState,
    processor: DataProcessor,
    pending: VecDeque<Arc<Event>>,
    handler: Option<Box<dyn EventHandler>>,
}

pub struct Subscriber {
    id: SubscriberId,
    description: String,
    created_at: DateTime<Utc>,
    instrument: Instrument,
    timeframe: Timeframe,
    subscriptions: BTreeMap<Opcode, Subscription>,
    is_async: bool,
    queue: EventQueue<Arc<Event>>,
    pending_capacity: usize,
    done: AtomicBool,
    inner: Mutex<Inner>,
}

impl Subscriber {
    pub fn builder(
        description: impl Into<String>,
        instrument: Instrument,
        timeframe: Timeframe,
    ) -> SubscriberBuilder {
        SubscriberBuilder::new(description.into(), instrument, timeframe)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    pub fn subscription(&self, opcode: Opcode) -> Option<&Subscription> {
        self.subscriptions.get(&opcode)
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn state(&self) -> SubscriberState {
        self.inner.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SubscriberState::Ready
    }

    pub fn info(&self) -> SubscriberInfo {
        let inner = self.inner.lock();
        SubscriberInfo {
            id: self.id,
            description: self.description.clone(),
            created_at: self.created_at,
            instrument: self.instrument.clone(),
            timeframe: self.timeframe,
            state: inner.state,
            is_async: self.is_async,
            detailing: inner.processor.detailing(),
            subscriptions: self
                .subscriptions
                .iter()
                .map(|(opcode, sub)| (*opcode, sub.guid().clone()))
                .collect(),
            handler: inner.handler.as_ref().map(|h| h.name().to_string()),
            bars: inner.processor.bars().len(),
            pending: inner.pending.len() + self.queue.len(),
        }
    }

    /// Bar history, oldest first, optionally Heiken-Ashi smoothed.
    pub fn bars(&self, heiken: bool) -> Vec<Bar> {
        let bars = self.inner.lock().processor.bars().to_vec();
        if heiken {
            heiken_ashi(&bars)
        } else {
            bars
        }
    }

    pub fn last_bar(&self) -> Result<Bar> {
        self.inner.lock().processor.last_bar().cloned()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Created -> Subscribing. False if the subscriber already moved on.
    pub fn mark_subscribing(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SubscriberState::Created {
            inner.state = SubscriberState::Subscribing;
            true
        } else {
            false
        }
    }

    /// Drain parked events through the processor, then become Ready.
    ///
    /// Parked events feed the bars but not the handler. A payload that fails
    /// to decode marks the subscriber Done and is returned.
    pub fn set_ready(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            SubscriberState::Ready => return Ok(()),
            SubscriberState::Done => return Err(FeedError::SubscriberDone(self.id)),
            SubscriberState::Created | SubscriberState::Subscribing => {}
        }

        while let Some(event) = inner.pending.pop_front() {
            if let Err(e) = process(&mut inner, &event, false) {
                drop(inner);
                self.mark_done();
                return Err(e);
            }
        }
        inner.state = SubscriberState::Ready;
        debug!(subscriber = %self.id, "subscriber ready");
        Ok(())
    }

    /// Enter the terminal state. Returns false if already Done.
    pub fn mark_done(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut inner = self.inner.lock();
        inner.state = SubscriberState::Done;
        inner.pending.clear();
        drop(inner);
        self.queue.drain();
        debug!(subscriber = %self.id, "subscriber done");
        true
    }

    pub fn init_handler(&self) -> Result<()> {
        let info = self.info();
        let mut inner = self.inner.lock();
        match inner.handler.as_mut() {
            Some(handler) => handler.init(&info),
            None => Ok(()),
        }
    }

    pub fn deinit_handler(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.handler.as_mut() {
            Some(handler) => handler.deinit(),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Event entry points
    // -------------------------------------------------------------------------

    /// Single entry point for live events.
    ///
    /// Done: silently ignored. Not yet Ready: parked. Ready: processed inline,
    /// or queued for the worker in async mode.
    pub fn handle_event(&self, event: &Arc<Event>) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            SubscriberState::Done => Ok(()),
            SubscriberState::Created | SubscriberState::Subscribing => {
                if inner.pending.len() >= self.pending_capacity {
                    return Err(FeedError::QueueOverflow);
                }
                inner.pending.push_back(Arc::clone(event));
                Ok(())
            }
            SubscriberState::Ready if self.is_async => {
                drop(inner);
                self.queue.enqueue(Arc::clone(event))
            }
            SubscriberState::Ready => process(&mut inner, event, true),
        }
    }

    /// Feed historical trades straight into the processor. Used to backfill
    /// before `set_ready`; returns how many trades were applied.
    pub fn replay_trades(&self, trades: &[Trade]) -> usize {
        let mut inner = self.inner.lock();
        if inner.state == SubscriberState::Done {
            return 0;
        }
        trades
            .iter()
            .filter(|trade| inner.processor.new_all_trades(trade) != Applied::Dropped)
            .count()
    }

    /// Process one event from the private queue. `Ok(false)` when idle.
    pub fn process_queued(&self) -> Result<bool> {
        let event = match self.queue.dequeue() {
            Ok(event) => event,
            Err(FeedError::QueueUnderflow) => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut inner = self.inner.lock();
        if inner.state == SubscriberState::Done {
            return Ok(false);
        }
        process(&mut inner, &event, true)?;
        Ok(true)
    }

    /// Spawn the worker that drains the private queue of an async subscriber.
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        idle: Duration,
    ) -> JoinHandle<()> {
        let subscriber = Arc::clone(self);
        tokio::spawn(async move {
            debug!(subscriber = %subscriber.id, "async worker started");
            loop {
                if subscriber.is_done() || *shutdown.borrow() {
                    break;
                }
                match subscriber.process_queued() {
                    Ok(true) => tokio::task::yield_now().await,
                    Ok(false) => {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(idle) => {}
                        }
                    }
                    Err(e) => {
                        warn!(subscriber = %subscriber.id, error = %e, "async handling failed");
                        subscriber.mark_done();
                        break;
                    }
                }
            }
            debug!(subscriber = %subscriber.id, "async worker stopped");
        })
    }
}

/// Decode `event` by opcode and run it through the processor, then through
/// the handler when `run_handler` is set.
fn process(inner: &mut Inner, event: &Event, run_handler: bool) -> Result<()> {
    let opcode = event
        .opcode
        .ok_or_else(|| FeedError::Protocol(format!("event {} has no opcode", event.guid)))?;

    match opcode {
        Opcode::AllTrades => {
            let trade: Trade = decode(opcode, &event.data)?;
            let applied = inner.processor.new_all_trades(&trade);
            if let (true, Some(handler)) = (run_handler, inner.handler.as_mut()) {
                handler.handle_all_trades(&trade, applied, &inner.processor)?;
            }
        }
        Opcode::OrderBook => {
            let book: OrderBookSnapshot = decode(opcode, &event.data)?;
            let applied = inner.processor.new_order_book(&book);
            if let (true, Some(handler)) = (run_handler, inner.handler.as_mut()) {
                handler.handle_order_book(&book, applied, &inner.processor)?;
            }
        }
        Opcode::Bars => {
            let bar: ExternalBar = decode(opcode, &event.data)?;
            let applied = inner.processor.new_bar(&bar);
            if let (true, Some(handler)) = (run_handler, inner.handler.as_mut()) {
                handler.handle_bars(&bar, applied, &inner.processor)?;
            }
        }
        Opcode::Unsubscribe => {}
    }
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(opcode: Opcode, data: &serde_json::Value) -> Result<T> {
    T::deserialize(data).map_err(|e| FeedError::InvalidPayload {
        opcode,
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Declares a subscriber's analytics and subscriptions before it exists.
pub struct SubscriberBuilder {
    description: String,
    instrument: Instrument,
    timeframe: Timeframe,
    format: ResponseFormat,
    detailing: Detailing,
    subscriptions: BTreeMap<Opcode, Subscription>,
    is_async: bool,
    handler: Option<Box<dyn EventHandler>>,
    bar_capacity: usize,
    queue_capacity: usize,
}

impl SubscriberBuilder {
    fn new(description: String, instrument: Instrument, timeframe: Timeframe) -> Self {
        Self {
            description,
            instrument,
            timeframe,
            format: ResponseFormat::Slim,
            detailing: Detailing::default(),
            subscriptions: BTreeMap::new(),
            is_async: false,
            handler: None,
            bar_capacity: DEFAULT_BAR_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_delta(mut self) -> Self {
        self.detailing.delta = true;
        self
    }

    pub fn with_market_profile(mut self) -> Self {
        self.detailing.market_profile = true;
        self
    }

    pub fn with_order_flow(mut self) -> Self {
        self.detailing.order_flow = true;
        self
    }

    pub fn with_all_trades(mut self, frequency: u32, depth: u32, include_virtual_trades: bool) -> Self {
        let sub = Subscription::all_trades(
            self.instrument.clone(),
            self.format,
            frequency,
            depth,
            include_virtual_trades,
        );
        self.subscriptions.insert(Opcode::AllTrades, sub);
        self
    }

    pub fn with_order_book(mut self, frequency: u32, depth: u32) -> Self {
        let sub = Subscription::order_book(self.instrument.clone(), self.format, frequency, depth);
        self.subscriptions.insert(Opcode::OrderBook, sub);
        self
    }

    pub fn with_bars(mut self, frequency: u32, from: i64, skip_history: bool, split_adjust: bool) -> Self {
        let sub = Subscription::bars(
            self.instrument.clone(),
            self.format,
            self.timeframe,
            frequency,
            from,
            skip_history,
            split_adjust,
        );
        self.subscriptions.insert(Opcode::Bars, sub);
        self
    }

    pub fn with_async(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn with_handler(mut self, handler: Box<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_bar_capacity(mut self, capacity: usize) -> Self {
        self.bar_capacity = capacity;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn build(self) -> Subscriber {
        Subscriber {
            id: SubscriberId::new(),
            description: self.description,
            created_at: Utc::now(),
            instrument: self.instrument,
            timeframe: self.timeframe,
            subscriptions: self.subscriptions,
            is_async: self.is_async,
            queue: EventQueue::new(self.queue_capacity),
            pending_capacity: self.queue_capacity,
            done: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: SubscriberState::Created,
                processor: DataProcessor::new(self.timeframe, self.detailing, self.bar_capacity),
                pending: VecDeque::new(),
                handler: self.handler,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::Exchange;

    const T0: i64 = 1_700_000_040_000;

    fn subscriber() -> Subscriber {
        Subscriber::builder("test", Instrument::new(Exchange::Moex, "SBER", "TQBR"), Timeframe::M1)
            .with_delta()
            .with_all_trades(0, 0, false)
            .build()
    }

    fn trade_event(sub: &Subscriber, id: i64, ts: i64, px: f64, q: i64, side: &str) -> Arc<Event> {
        let guid = sub.subscription(Opcode::AllTrades).unwrap().guid().clone();
        let data = json!({"id": id, "sym": "SBER", "bd": "TQBR", "q": q, "px": px, "t": ts, "s": side});
        Arc::new(Event::data(guid, data).unwrap())
    }

    fn trade(id: i64, ts: i64, px: f64) -> Trade {
        serde_json::from_value(json!({"id": id, "q": 1, "px": px, "t": ts, "s": "buy"})).unwrap()
    }

    #[test]
    fn events_before_ready_are_parked_then_drained() {
        let sub = subscriber();
        assert!(sub.mark_subscribing());
        sub.handle_event(&trade_event(&sub, 1, T0, 100.0, 5, "buy")).unwrap();
        assert!(sub.last_bar().is_err());
        assert_eq!(sub.info().pending, 1);

        sub.set_ready().unwrap();
        assert_eq!(sub.state(), SubscriberState::Ready);
        assert_eq!(sub.last_bar().unwrap().volume, 5);
        assert_eq!(sub.info().pending, 0);
    }

    #[test]
    fn live_events_processed_inline_when_ready() {
        let sub = subscriber();
        sub.set_ready().unwrap();
        sub.handle_event(&trade_event(&sub, 1, T0, 100.0, 5, "buy")).unwrap();
        sub.handle_event(&trade_event(&sub, 2, T0 + 10, 101.0, 3, "sell")).unwrap();
        let bar = sub.last_bar().unwrap();
        assert_eq!((bar.volume, bar.delta.total), (8, 2));
    }

    #[test]
    fn backfill_then_live_skips_overlap() {
        let sub = subscriber();
        sub.mark_subscribing();
        // live stream starts replaying from id 2 while history covers 1..=3
        sub.handle_event(&trade_event(&sub, 2, T0 + 2, 101.0, 1, "buy")).unwrap();
        sub.handle_event(&trade_event(&sub, 4, T0 + 4, 103.0, 1, "buy")).unwrap();

        let applied = sub.replay_trades(&[trade(1, T0 + 1, 100.0), trade(2, T0 + 2, 101.0), trade(3, T0 + 3, 102.0)]);
        assert_eq!(applied, 3);
        sub.set_ready().unwrap();

        let bar = sub.last_bar().unwrap();
        assert_eq!(bar.volume, 4);
        assert_eq!(bar.close, 103.0);
    }

    #[test]
    fn bad_payload_fails_and_done_ignores_later_events() {
        let sub = subscriber();
        sub.set_ready().unwrap();
        sub.handle_event(&trade_event(&sub, 1, T0, 100.0, 5, "buy")).unwrap();

        let guid = sub.subscription(Opcode::AllTrades).unwrap().guid().clone();
        let broken = Arc::new(Event::data(guid, json!({"id": "oops"})).unwrap());
        assert!(matches!(sub.handle_event(&broken), Err(FeedError::InvalidPayload { .. })));
        sub.mark_done();

        let before = sub.last_bar().unwrap();
        sub.handle_event(&trade_event(&sub, 2, T0 + 1, 150.0, 9, "buy")).unwrap();
        sub.handle_event(&trade_event(&sub, 3, T0 + 2, 160.0, 9, "sell")).unwrap();
        assert_eq!(sub.last_bar().unwrap(), before);
        assert_eq!(sub.state(), SubscriberState::Done);
    }

    #[test]
    fn done_is_terminal() {
        let sub = subscriber();
        assert!(sub.mark_done());
        assert!(!sub.mark_done());
        assert!(!sub.mark_subscribing());
        assert!(sub.set_ready().is_err());
        assert_eq!(sub.state(), SubscriberState::Done);
        assert_eq!(sub.replay_trades(&[trade(1, T0, 1.0)]), 0);
    }

    #[test]
    fn async_mode_queues_until_drained() {
        let sub = Subscriber::builder("a", Instrument::new(Exchange::Moex, "SBER", "TQBR"), Timeframe::M1)
            .with_all_trades(0, 0, false)
            .with_async()
            .build();
        sub.set_ready().unwrap();
        sub.handle_event(&trade_event(&sub, 1, T0, 100.0, 5, "buy")).unwrap();
        assert!(sub.last_bar().is_err());

        assert!(sub.process_queued().unwrap());
        assert!(!sub.process_queued().unwrap());
        assert_eq!(sub.last_bar().unwrap().volume, 5);
    }

    #[test]
    fn parked_events_respect_capacity() {
        let sub = Subscriber::builder("cap", Instrument::new(Exchange::Moex, "SBER", "TQBR"), Timeframe::M1)
            .with_all_trades(0, 0, false)
            .with_queue_capacity(1)
            .build();
        sub.handle_event(&trade_event(&sub, 1, T0, 100.0, 1, "buy")).unwrap();
        assert!(matches!(
            sub.handle_event(&trade_event(&sub, 2, T0, 100.0, 1, "buy")),
            Err(FeedError::QueueOverflow)
        ));
    }

    #[tokio::test]
    async fn worker_drains_private_queue() {
        let sub = Arc::new(
            Subscriber::builder("w", Instrument::new(Exchange::Moex, "SBER", "TQBR"), Timeframe::M1)
                .with_all_trades(0, 0, false)
                .with_async()
                .build(),
        );
        sub.set_ready().unwrap();
        let (_tx, rx) = watch::channel(false);
        let worker = sub.spawn_worker(rx, Duration::from_millis(5));

        sub.handle_event(&trade_event(&sub, 1, T0, 100.0, 2, "buy")).unwrap();
        sub.handle_event(&trade_event(&sub, 2, T0 + 1, 101.0, 3, "buy")).unwrap();

        for _ in 0..100 {
            if sub.last_bar().map(|b| b.volume).unwrap_or(0) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sub.last_bar().unwrap().volume, 5);

        sub.mark_done();
        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }
}
