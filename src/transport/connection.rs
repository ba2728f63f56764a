// =============================================================================
// Connection Manager — socket ownership, reader / reconnect / dispatch loops
// =============================================================================
//
// One websocket to the broker feed, shared by every subscriber. The reader
// decodes frames onto the event queue, the dispatcher routes queued events
// to subscribers by GUID, and the reconnect loop redials with exponential
// backoff and replays every committed subscription.
//
// Writes funnel through `send`, which holds the sink mutex. Registries are
// never locked across a subscriber call. `close` signals every loop through
// the shutdown watch and joins them before returning.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::config::{FeedConfig, ReconnectPolicy};
use crate::error::{FeedError, Result};
use crate::market_data::Bar;
use crate::queue::EventQueue;
use crate::subscriber::{Subscriber, SubscriberRegistry};
use crate::subscription::{unsubscribe_request, SubscriptionRegistry};
use crate::transport::frame::{Event, EventKind};
use crate::types::{Guid, SubscriberId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

/// Transport settings taken from `FeedConfig`.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub url: String,
    pub queue_capacity: usize,
    pub dispatch_idle: Duration,
    pub overflow_pause: Duration,
    pub reconnect: ReconnectPolicy,
}

impl TransportOptions {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            url: config.hosts().websocket,
            queue_capacity: config.queue_capacity,
            dispatch_idle: config.dispatch_idle(),
            overflow_pause: config.overflow_pause(),
            reconnect: config.reconnect,
        }
    }
}

pub struct ConnectionManager {
    options: TransportOptions,
    token: Arc<TokenProvider>,

    pub(crate) queue: EventQueue<Event>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) subscribers: SubscriberRegistry,

    sink: AsyncMutex<Option<WsSink>>,
    state: RwLock<ConnectionState>,

    connecting: AtomicBool,
    closing: AtomicBool,
    /// Cleared while the reader is paused on a full queue.
    ready: AtomicBool,
    dispatching: AtomicBool,

    shutdown: watch::Sender<bool>,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: AsyncMutex<mpsc::Receiver<()>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(options: TransportOptions, token: Arc<TokenProvider>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);

        Arc::new(Self {
            queue: EventQueue::new(options.queue_capacity),
            options,
            token,
            subscriptions: SubscriptionRegistry::new(),
            subscribers: SubscriberRegistry::new(),
            sink: AsyncMutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            connecting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
            shutdown,
            reconnect_tx,
            reconnect_rx: AsyncMutex::new(reconnect_rx),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// False while the reader is held back by a full event queue.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "connection state");
            *current = state;
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect, then start the reconnect and dispatch loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.connect().await?;
        let reconnector = self.spawn_reconnect_loop();
        self.track(reconnector);
        self.ensure_dispatcher();
        Ok(())
    }

    /// Dial the feed and start the reader.
    ///
    /// A call made while another is dialing, or while connected, returns
    /// `Ok` without doing anything.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(FeedError::Closing);
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let result = self.dial().await;
        self.connecting.store(false, Ordering::Release);
        result
    }

    async fn dial(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => self.set_state(ConnectionState::Connecting),
            _ => {}
        }

        // Subscribe before the check so a `close` racing the dial is seen.
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(FeedError::Closing);
        }

        info!(url = %self.options.url, "connecting to feed");
        let limit = self.options.reconnect.max();
        let dialed = tokio::select! {
            _ = shutdown.changed() => return Err(FeedError::Closing),
            dialed = tokio::time::timeout(limit, connect_async(self.options.url.as_str())) => dialed,
        };
        let stream = match dialed {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(self.dial_failed(e.into())),
            Err(_) => {
                let e = FeedError::Transport(format!(
                    "handshake timed out after {}ms",
                    limit.as_millis()
                ));
                return Err(self.dial_failed(e));
            }
        };

        // `close` takes the sink under this lock; checking `closing` and
        // tracking the reader while holding it means `close` either sees the
        // reader or the dial gives up.
        let mut sink = self.sink.lock().await;
        if self.closing.load(Ordering::Acquire) {
            return Err(FeedError::Closing);
        }

        let (write, read) = stream.split();
        *sink = Some(write);
        self.ready.store(true, Ordering::Release);
        self.set_state(ConnectionState::Connected);

        let reader = self.spawn_reader(read);
        self.track(reader);
        drop(sink);

        info!(url = %self.options.url, "feed connected");
        Ok(())
    }

    fn dial_failed(&self, error: FeedError) -> FeedError {
        if self.state() == ConnectionState::Connecting {
            self.set_state(ConnectionState::Disconnected);
        }
        error
    }

    /// Stop every loop, send a close frame and wait for all tasks to exit.
    /// A second concurrent call returns immediately.
    pub async fn close(&self) -> Result<()> {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        self.set_state(ConnectionState::Closing);
        self.shutdown.send_replace(true);

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(error = %e, "close frame not delivered");
            }
            sink.close().await.ok();
        }

        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "transport task ended abnormally");
                }
            }
        }

        self.shutdown.send_replace(false);
        self.ready.store(false, Ordering::Release);
        self.set_state(ConnectionState::Disconnected);
        self.closing.store(false, Ordering::Release);
        info!("transport closed");
        Ok(())
    }

    /// Write one text frame.
    pub async fn send(&self, text: String) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(FeedError::Closing);
        }
        let mut sink = self.sink.lock().await;
        let writer = sink.as_mut().ok_or(FeedError::NotConnected)?;
        writer.send(Message::Text(text)).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reader loop
    // -------------------------------------------------------------------------

    fn spawn_reader(self: &Arc<Self>, mut read: WsSource) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }

                let message = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    message = read.next() => message,
                };

                match message {
                    Some(Ok(Message::Text(text))) => match Event::parse(&text) {
                        Ok(event) => {
                            if !manager.enqueue_with_backpressure(event, &mut shutdown).await {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "feed closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "feed read failed");
                        break;
                    }
                    None => {
                        warn!("feed stream ended");
                        break;
                    }
                }
            }

            manager.connection_lost().await;
        })
    }

    /// Enqueue `event`, pausing while the queue is full. False on shutdown.
    async fn enqueue_with_backpressure(
        &self,
        event: Event,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        while self.queue.is_full() {
            if self.ready.swap(false, Ordering::AcqRel) {
                warn!(
                    capacity = self.queue.capacity(),
                    pause_ms = self.options.overflow_pause.as_millis() as u64,
                    "event queue full, pausing reader"
                );
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
                _ = tokio::time::sleep(self.options.overflow_pause) => {}
            }
        }

        if !self.ready.swap(true, Ordering::AcqRel) {
            info!("event queue drained, reader resumed");
        }
        if let Err(e) = self.queue.enqueue(event) {
            warn!(error = %e, "event dropped");
        }
        true
    }

    async fn connection_lost(&self) {
        self.sink.lock().await.take();
        self.ready.store(false, Ordering::Release);
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        if self.reconnect_tx.try_send(()).is_err() {
            debug!("reconnect already signalled");
        }
    }

    // -------------------------------------------------------------------------
    // Reconnect loop
    // -------------------------------------------------------------------------

    fn spawn_reconnect_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut signals = manager.reconnect_rx.lock().await;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    signal = signals.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        manager.reconnect(&mut shutdown).await;
                    }
                }
            }
            debug!("reconnect loop stopped");
        })
    }

    async fn reconnect(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) {
        let mut backoff = self.options.reconnect.initial();
        let mut attempt: u32 = 1;

        loop {
            info!(attempt, backoff_ms = backoff.as_millis() as u64, "reconnecting to feed");
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            if *shutdown.borrow() {
                return;
            }

            match self.connect().await {
                Ok(()) if self.state() == ConnectionState::Connected => break,
                Ok(()) => {}
                Err(FeedError::Closing) => return,
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }

            backoff = self.options.reconnect.next(backoff);
            attempt += 1;
        }

        self.ensure_dispatcher();
        self.resubscribe().await;
    }

    /// Resend the subscribe request of every committed subscription. Both
    /// registries are committed first so replayed frames find their
    /// subscribers.
    async fn resubscribe(&self) -> usize {
        self.subscriptions.rebalance();
        self.subscribers.rebalance();
        let token = self.token.access_token();
        let mut restored = 0;

        for subscription in self.subscriptions.subscriptions() {
            let result = match subscription.subscribe_request(&token) {
                Ok(request) => self.send(request).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => restored += 1,
                Err(e) => warn!(guid = %subscription.guid(), error = %e, "resubscribe failed"),
            }
        }

        info!(count = restored, "subscriptions restored");
        restored
    }

    // -------------------------------------------------------------------------
    // Dispatch loop
    // -------------------------------------------------------------------------

    fn ensure_dispatcher(self: &Arc<Self>) {
        if self
            .dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let idle = self.options.dispatch_idle;

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match manager.dispatch_once() {
                    Some(orphaned) => {
                        if !orphaned.is_empty() {
                            if let Err(e) = manager.unsubscribe(orphaned).await {
                                warn!(error = %e, "unsubscribe after eviction failed");
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                    None => {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(idle) => {}
                        }
                    }
                }
            }
            manager.dispatching.store(false, Ordering::Release);
            debug!("dispatcher stopped");
        });
        self.track(handle);
    }

    /// One dispatcher iteration: commit staged registry changes, then route
    /// one event. `None` when the queue is empty; otherwise the GUIDs left
    /// without subscribers by evictions.
    pub(crate) fn dispatch_once(&self) -> Option<Vec<Guid>> {
        self.subscriptions.rebalance();
        self.subscribers.rebalance();

        let event = self.queue.dequeue().ok()?;
        Some(self.route(event))
    }

    fn route(&self, event: Event) -> Vec<Guid> {
        match event.kind {
            EventKind::System => {
                if event.is_rejection() {
                    warn!(
                        guid = %event.guid,
                        http_code = ?event.http_code,
                        message = ?event.message,
                        "subscription rejected"
                    );
                } else {
                    self.subscriptions.mark_active(&event.guid);
                    debug!(guid = %event.guid, message = ?event.message, "subscription acknowledged");
                }
                Vec::new()
            }
            EventKind::Data => {
                self.subscriptions.mark_active(&event.guid);
                let event = Arc::new(event);
                let mut orphaned = Vec::new();

                for id in self.subscriptions.subscribers_of(&event.guid) {
                    let Some(subscriber) = self.subscribers.get(&id) else {
                        continue;
                    };
                    // Done subscribers (failed async workers included) are
                    // evicted lazily on their next event.
                    if subscriber.is_done() {
                        orphaned.extend(self.evict(&subscriber));
                        continue;
                    }
                    if let Err(e) = subscriber.handle_event(&event) {
                        warn!(
                            subscriber = %id,
                            guid = %event.guid,
                            error = %e,
                            "subscriber failed, evicting"
                        );
                        orphaned.extend(self.evict(&subscriber));
                    }
                }
                orphaned
            }
        }
    }

    /// Mark `subscriber` Done and stage its removal from both registries.
    /// Returns the GUIDs that will have no subscribers left.
    fn evict(&self, subscriber: &Arc<Subscriber>) -> Vec<Guid> {
        let id = subscriber.id();
        subscriber.mark_done();
        if let Err(e) = subscriber.deinit_handler() {
            warn!(subscriber = %id, error = %e, "handler deinit failed");
        }

        let mut orphaned = Vec::new();
        for subscription in subscriber.subscriptions() {
            let guid = subscription.guid().clone();
            self.subscriptions.stage_delete(id, guid.clone());
            if self.subscriptions.projected_len(&guid) == 0 {
                orphaned.push(guid);
            }
        }
        self.subscribers.stage_delete(id);
        orphaned
    }

    /// Send `Unsubscribe` for each GUID. Every GUID is attempted; the first
    /// failure is returned.
    async fn unsubscribe(&self, guids: Vec<Guid>) -> Result<()> {
        let token = self.token.access_token();
        let mut first_error = None;

        for guid in guids {
            let result = match unsubscribe_request(&guid, &token) {
                Ok(request) => self.send(request).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!(guid = %guid, "unsubscribed"),
                Err(e) => {
                    warn!(guid = %guid, error = %e, "unsubscribe failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    /// Register `subscriber` and send a subscribe request for each of its
    /// subscriptions. The subscriber is left Subscribing: live events are
    /// parked until the caller marks it ready.
    ///
    /// Registrations are staged before the requests go out so that replay
    /// frames answering the request are routed. On a failed send the
    /// registrations are rolled back and the subscriber is Done.
    pub async fn attach_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(FeedError::Closing);
        }
        let id = subscriber.id();
        if !subscriber.mark_subscribing() {
            return Err(if subscriber.is_done() {
                FeedError::SubscriberDone(id)
            } else {
                FeedError::InvalidRequest(format!("subscriber {id} is already attached"))
            });
        }
        if let Err(e) = subscriber.init_handler() {
            subscriber.mark_done();
            return Err(e);
        }

        self.subscribers.stage_add(Arc::clone(&subscriber));
        for subscription in subscriber.subscriptions() {
            self.subscriptions.stage_add(id, subscription.clone());
        }

        let token = self.token.access_token();
        let mut sent = Vec::new();
        for subscription in subscriber.subscriptions() {
            let result = match subscription.subscribe_request(&token) {
                Ok(request) => self.send(request).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(subscriber = %id, guid = %subscription.guid(), error = %e, "subscribe failed");
                let orphaned: Vec<Guid> = self
                    .evict(&subscriber)
                    .into_iter()
                    .filter(|guid| sent.contains(guid))
                    .collect();
                if !orphaned.is_empty() {
                    self.unsubscribe(orphaned).await.ok();
                }
                return Err(e);
            }
            debug!(subscriber = %id, guid = %subscription.guid(), "subscribe request sent");
            sent.push(subscription.guid().clone());
        }

        if subscriber.is_async() {
            let worker = subscriber.spawn_worker(self.shutdown.subscribe(), self.options.dispatch_idle);
            self.track(worker);
        }

        info!(
            subscriber = %id,
            instrument = %subscriber.instrument(),
            subscriptions = sent.len(),
            "subscriber attached"
        );
        Ok(())
    }

    /// Attach `subscriber` and mark it ready straight away.
    pub async fn add_subscriber(&self, subscriber: Arc<Subscriber>) -> Result<SubscriberId> {
        let id = subscriber.id();
        self.attach_subscriber(Arc::clone(&subscriber)).await?;
        subscriber.set_ready()?;
        Ok(id)
    }

    /// Mark the subscriber Done, deregister it, and unsubscribe every GUID it
    /// was the last subscriber of.
    pub async fn remove_subscriber(&self, id: SubscriberId) -> Result<()> {
        let subscriber = self
            .subscribers
            .find(&id)
            .ok_or(FeedError::SubscriberNotFound(id))?;

        let orphaned = self.evict(&subscriber);
        info!(subscriber = %id, unsubscribed = orphaned.len(), "subscriber removed");
        self.unsubscribe(orphaned).await
    }

    pub fn get_subscriber(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.find(id)
    }

    pub fn list_subscribers(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.all()
    }

    pub fn bars(&self, id: &SubscriberId, heiken_ashi: bool) -> Result<Vec<Bar>> {
        self.get_subscriber(id)
            .map(|subscriber| subscriber.bars(heiken_ashi))
            .ok_or(FeedError::SubscriberNotFound(*id))
    }
}
