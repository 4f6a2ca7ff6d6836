//! Durable message bus client: publish/subscribe and request/reply with
//! automatic reconnection.
//!
//! A supervisor task owns the connection lifecycle
//! (`Disconnected -> Connecting -> Connected`). Any connection loss sends it
//! back to `Connecting` after a per-client exponential backoff. On every new
//! connection the client re-declares the exchange, its private reply queue,
//! and every consumer that was active before the loss, so subscriptions
//! survive broker restarts.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use shopmesh_core::{ClockSource, MessageEnvelope, ReplyPayload, SystemClock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::config::BusConfig;
use super::handler::{MessageHandler, RequestHandler, RequestMeta};
use super::pending::PendingRequests;
use super::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Consumer, Delivery,
    ExchangeOptions, MessageProperties, QueueOptions,
};
use crate::service::{LifecycleContext, ManagedService};

/// Handler key that receives every notification type.
pub const WILDCARD: &str = "*";

const JSON_CONTENT_TYPE: &str = "application/json";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Connection lifecycle of a [`MessageBusClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `disconnect` was called; the client will not reconnect.
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus is not connected")]
    NotConnected,
    #[error("message bus client is closed")]
    Closed,
    #[error("timed out waiting for the broker connection")]
    ConnectTimeout,
    #[error("request `{kind}` timed out after {timeout_ms}ms")]
    RequestTimeout { kind: String, timeout_ms: u64 },
    #[error("request `{kind}` failed remotely: {message}")]
    Remote { kind: String, message: String },
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Per-call publish settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Routing key override; defaults to the notification type.
    pub routing_key: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            routing_key: None,
            persistent: true,
            headers: BTreeMap::new(),
        }
    }
}

/// Per-call request settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overrides [`BusConfig::reply_timeout`].
    pub timeout: Option<Duration>,
    pub target_id: Option<String>,
    pub routing_key: Option<String>,
}

/// Publishing seam used by saga flows so they can run against any transport.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `data` as a `kind` notification and returns the envelope id.
    async fn publish_event(&self, kind: &str, data: Value) -> Result<String, BusError>;

    /// Releases any connection owned by this publisher.
    async fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Session: everything tied to one broker connection
// ---------------------------------------------------------------------------

/// One consumer and the channel it owns.
///
/// Every consumer gets its own channel so a full prefetch window on one
/// (say, notification handlers awaiting replies) never starves another.
struct ConsumerTask {
    tag: String,
    channel: Arc<dyn BrokerChannel>,
    handle: JoinHandle<()>,
}

struct Session {
    connection: Arc<dyn BrokerConnection>,
    /// Publishing plus exchange, queue, and binding declarations.
    publish: Arc<dyn BrokerChannel>,
    reply_queue: String,
    /// Cancelled when the session is torn down; stops its consumer pumps.
    cancel: CancellationToken,
    consumers: Mutex<Vec<ConsumerTask>>,
    notifications_started: AtomicBool,
    request_kinds: Mutex<HashSet<String>>,
}

impl Session {
    fn track(&self, tag: String, channel: Arc<dyn BrokerChannel>, handle: JoinHandle<()>) {
        self.consumers.lock().push(ConsumerTask { tag, channel, handle });
    }

    async fn teardown(&self) {
        self.cancel.cancel();
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in &consumers {
            if let Err(e) = consumer.channel.cancel(&consumer.tag).await {
                debug!(tag = %consumer.tag, error = %e, "consumer cancel failed");
            }
        }
        for consumer in consumers {
            let _ = consumer.handle.await;
            let _ = consumer.channel.close().await;
        }
        let _ = self.publish.close().await;
        let _ = self.connection.close().await;
    }
}

/// Forwards deliveries from `consumer` to `on_delivery` until the session ends.
fn spawn_pump<F>(session: &Arc<Session>, mut consumer: Consumer, on_delivery: F) -> JoinHandle<()>
where
    F: Fn(Delivery) + Send + 'static,
{
    let cancel = session.cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                delivery = consumer.deliveries.recv() => match delivery {
                    Some(delivery) => on_delivery(delivery),
                    None => break,
                },
            }
        }
    })
}

fn binding_key(kind: &str) -> &str {
    if kind == WILDCARD {
        "#"
    } else {
        kind
    }
}

// ---------------------------------------------------------------------------
// Client internals
// ---------------------------------------------------------------------------

struct Inner {
    config: BusConfig,
    connector: Arc<dyn BrokerConnector>,
    clock: Arc<dyn ClockSource>,
    state: watch::Sender<ConnectionState>,
    session: ArcSwapOption<Session>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    request_handlers: DashMap<String, Arc<dyn RequestHandler>>,
    listening: AtomicBool,
    pending: Arc<PendingRequests>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(service = %self.config.service_name, from = %previous, to = %next, "bus state changed");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn current_session(&self) -> Result<Arc<Session>, BusError> {
        match self.state() {
            ConnectionState::Closed => Err(BusError::Closed),
            ConnectionState::Connected => self.session.load_full().ok_or(BusError::NotConnected),
            _ => Err(BusError::NotConnected),
        }
    }

    /// Resolves once a connected session is available.
    async fn wait_for_session(&self) -> Result<Arc<Session>, BusError> {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Closed => return Err(BusError::Closed),
                ConnectionState::Connected => {
                    if let Some(session) = self.session.load_full() {
                        return Ok(session);
                    }
                }
                _ => {}
            }
            state.changed().await.map_err(|_| BusError::Closed)?;
        }
    }

    fn envelope(&self, kind: &str, data: Value) -> MessageEnvelope {
        MessageEnvelope::new(kind, data, self.config.service_name.as_str(), self.clock.as_ref())
    }

    /// Publishes on `session`, waiting out broker backpressure.
    async fn publish_on(
        &self,
        session: &Session,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        let body = Bytes::from(envelope.to_bytes()?);
        let accepted = session
            .publish
            .publish(exchange, routing_key, body, properties)
            .await?;
        if !accepted {
            debug!(kind = %envelope.kind, "broker applied backpressure, waiting for drain");
            session.publish.wait_writable().await?;
        }
        metrics::counter!("bus_messages_published_total", "kind" => envelope.kind.clone())
            .increment(1);
        Ok(())
    }

    async fn open_session(self: &Arc<Self>) -> Result<Arc<Session>, BusError> {
        let connection = self.connector.connect(&self.config.uri).await?;
        match self.prepare_session(Arc::clone(&connection)).await {
            Ok(session) => Ok(session),
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    async fn prepare_session(
        self: &Arc<Self>,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<Arc<Session>, BusError> {
        let publish = connection.create_channel().await?;
        publish
            .assert_exchange(
                &self.config.exchange,
                self.config.exchange_kind,
                ExchangeOptions::default(),
            )
            .await?;

        // Replies are settled on arrival, so their channel has no prefetch
        // bound; a handler waiting on a reply must never block its delivery.
        let reply_channel = connection.create_channel().await?;
        let reply_queue = reply_channel
            .assert_queue("", QueueOptions::private())
            .await?;
        let replies = reply_channel.consume(&reply_queue).await?;

        let session = Arc::new(Session {
            connection,
            publish,
            reply_queue,
            cancel: self.shutdown.child_token(),
            consumers: Mutex::new(Vec::new()),
            notifications_started: AtomicBool::new(false),
            request_kinds: Mutex::new(HashSet::new()),
        });

        let tag = replies.tag.clone();
        let pending = Arc::clone(&self.pending);
        let channel = Arc::clone(&reply_channel);
        let handle = spawn_pump(&session, replies, move |delivery| {
            let pending = Arc::clone(&pending);
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                let _ = channel.ack(delivery.delivery_tag).await;
                match MessageEnvelope::from_bytes(&delivery.body) {
                    Ok(mut reply) => {
                        if reply.correlation_id.is_none() {
                            reply.correlation_id = delivery.properties.correlation_id.clone();
                        }
                        if !pending.resolve(reply) {
                            debug!(
                                correlation_id = ?delivery.properties.correlation_id,
                                "ignoring reply with no pending request"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "discarding malformed reply"),
                }
            });
        });
        session.track(tag, reply_channel, handle);
        Ok(session)
    }

    /// Starts every consumer registered before this session existed.
    async fn activate(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), BusError> {
        if self.listening.load(Ordering::SeqCst) {
            self.start_notifications(session).await?;
        }
        let kinds: Vec<String> = self
            .request_handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for kind in kinds {
            self.start_request_consumer(session, &kind).await?;
        }
        Ok(())
    }

    async fn bind_notifications(&self, session: &Session) -> Result<(), BusError> {
        let queue = self.config.notification_queue();
        let kinds: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        for kind in kinds {
            session
                .publish
                .bind_queue(&queue, &self.config.exchange, binding_key(&kind))
                .await?;
        }
        Ok(())
    }

    async fn start_notifications(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), BusError> {
        if session.notifications_started.swap(true, Ordering::SeqCst) {
            return self.bind_notifications(session).await;
        }
        let result = self.consume_notifications(session).await;
        if result.is_err() {
            session.notifications_started.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn consume_notifications(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), BusError> {
        let queue = self.config.notification_queue();
        session
            .publish
            .assert_queue(&queue, QueueOptions::durable())
            .await?;
        self.bind_notifications(session).await?;
        let channel = self.consumer_channel(session).await?;
        let consumer = channel.consume(&queue).await?;

        let tag = consumer.tag.clone();
        let inner = Arc::clone(self);
        let pump_channel = Arc::clone(&channel);
        let handle = spawn_pump(session, consumer, move |delivery| {
            let inner = Arc::clone(&inner);
            let channel = Arc::clone(&pump_channel);
            tokio::spawn(async move { inner.handle_notification(channel.as_ref(), delivery).await });
        });
        session.track(tag, channel, handle);
        info!(service = %self.config.service_name, queue = %queue, "listening for notifications");
        Ok(())
    }

    /// Opens a channel bounded by the configured prefetch for one consumer.
    async fn consumer_channel(&self, session: &Session) -> Result<Arc<dyn BrokerChannel>, BusError> {
        let channel = session.connection.create_channel().await?;
        if let Err(e) = channel.prefetch(self.config.prefetch).await {
            let _ = channel.close().await;
            return Err(e.into());
        }
        Ok(channel)
    }

    async fn handle_notification(&self, channel: &dyn BrokerChannel, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        let envelope = match MessageEnvelope::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(routing_key = %delivery.routing_key, error = %e, "rejecting unparseable message");
                metrics::counter!("bus_messages_rejected_total").increment(1);
                if let Err(e) = channel.nack(tag, false).await {
                    debug!(error = %e, "nack failed");
                }
                return;
            }
        };

        let handler = [delivery.routing_key.as_str(), envelope.kind.as_str(), WILDCARD]
            .into_iter()
            .find_map(|key| self.handlers.get(key).map(|h| Arc::clone(h.value())));
        let Some(handler) = handler else {
            debug!(kind = %envelope.kind, "no handler registered, acknowledging");
            let _ = channel.ack(tag).await;
            return;
        };

        let kind = envelope.kind.clone();
        let id = envelope.id.clone();
        let outcome = match handler.handle(envelope).await {
            Ok(()) => channel.ack(tag).await,
            Err(e) => {
                warn!(kind = %kind, id = %id, redelivered = delivery.redelivered, error = %e, "handler failed, requeueing");
                metrics::counter!("bus_handler_failures_total", "kind" => kind.clone()).increment(1);
                channel.nack(tag, true).await
            }
        };
        if let Err(e) = outcome {
            debug!(kind = %kind, error = %e, "settling delivery failed");
        }
    }

    async fn start_request_consumer(
        self: &Arc<Self>,
        session: &Arc<Session>,
        kind: &str,
    ) -> Result<(), BusError> {
        if !session.request_kinds.lock().insert(kind.to_string()) {
            return Ok(());
        }
        let result = self.consume_requests(session, kind).await;
        if result.is_err() {
            session.request_kinds.lock().remove(kind);
        }
        result
    }

    async fn consume_requests(self: &Arc<Self>, session: &Arc<Session>, kind: &str) -> Result<(), BusError> {
        let queue = BusConfig::request_queue(kind);
        session
            .publish
            .assert_queue(&queue, QueueOptions::durable())
            .await?;
        session
            .publish
            .bind_queue(&queue, &self.config.exchange, kind)
            .await?;
        let channel = self.consumer_channel(session).await?;
        let consumer = channel.consume(&queue).await?;

        let tag = consumer.tag.clone();
        let inner = Arc::clone(self);
        let pump_channel = Arc::clone(&channel);
        let kind_owned = kind.to_string();
        let handle = spawn_pump(session, consumer, move |delivery| {
            let inner = Arc::clone(&inner);
            let channel = Arc::clone(&pump_channel);
            let kind = kind_owned.clone();
            tokio::spawn(async move { inner.handle_request(channel.as_ref(), &kind, delivery).await });
        });
        session.track(tag, channel, handle);
        info!(service = %self.config.service_name, kind, queue = %queue, "serving requests");
        Ok(())
    }

    async fn handle_request(&self, channel: &dyn BrokerChannel, kind: &str, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        let request = match MessageEnvelope::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(kind, error = %e, "rejecting unparseable request");
                metrics::counter!("bus_messages_rejected_total").increment(1);
                let _ = channel.nack(tag, false).await;
                return;
            }
        };

        let reply_to = delivery.properties.reply_to.clone();
        let correlation_id = request
            .correlation_id
            .clone()
            .or_else(|| delivery.properties.correlation_id.clone());

        let payload = match self.request_handlers.get(kind).map(|h| Arc::clone(h.value())) {
            Some(handler) => {
                let meta = RequestMeta::from_envelope(&request, reply_to.clone());
                match handler.handle(request.data.clone(), meta).await {
                    Ok(data) => ReplyPayload::ok(data),
                    Err(e) => {
                        warn!(kind, id = %request.id, error = %e, "request handler failed");
                        ReplyPayload::error(e.to_string())
                    }
                }
            }
            None => ReplyPayload::error(format!("no handler registered for `{kind}`")),
        };

        match (reply_to, correlation_id) {
            (Some(reply_to), Some(correlation_id)) => {
                if let Err(e) = self.send_reply(&request.kind, &reply_to, &correlation_id, &payload).await {
                    warn!(kind, reply_to = %reply_to, error = %e, "failed to publish reply");
                }
            }
            _ => debug!(kind, id = %request.id, "request carries no reply destination"),
        }

        if let Err(e) = channel.ack(tag).await {
            debug!(kind, error = %e, "request ack failed");
        }
    }

    async fn send_reply(
        &self,
        kind: &str,
        reply_to: &str,
        correlation_id: &str,
        payload: &ReplyPayload,
    ) -> Result<(), BusError> {
        let session = self.current_session()?;
        let reply = self
            .envelope(&format!("{kind}.reply"), serde_json::to_value(payload)?)
            .with_correlation_id(correlation_id);
        let properties = MessageProperties {
            message_id: Some(reply.id.clone()),
            correlation_id: Some(correlation_id.to_string()),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..MessageProperties::default()
        };
        self.publish_on(&session, "", reply_to, &reply, properties).await
    }
}

/// Keeps a connection alive until shutdown, reconnecting with backoff.
async fn supervise(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(inner.config.backoff);
    let service = inner.config.service_name.clone();

    loop {
        inner.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            opened = inner.open_session() => opened,
        };

        match opened {
            Ok(session) => {
                inner.session.store(Some(Arc::clone(&session)));
                match inner.activate(&session).await {
                    Ok(()) => {
                        backoff.reset();
                        inner.set_state(ConnectionState::Connected);
                        info!(service = %service, uri = %inner.config.uri, "connected to message broker");

                        tokio::select! {
                            () = inner.shutdown.cancelled() => break,
                            () = session.connection.closed() => {
                                warn!(service = %service, "broker connection lost");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(service = %service, error = %e, "failed to restore consumers");
                    }
                }
                inner.session.store(None);
                inner.set_state(ConnectionState::Disconnected);
                session.teardown().await;
            }
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                warn!(service = %service, attempt = backoff.attempt() + 1, error = %e, "broker connection failed");
            }
        }

        let delay = backoff.next_delay();
        metrics::counter!("bus_reconnects_total").increment(1);
        debug!(service = %service, ?delay, "reconnecting after backoff");
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// MessageBusClient
// ---------------------------------------------------------------------------

/// Handle to the bus. Clones share one connection and handler registry.
#[derive(Clone)]
pub struct MessageBusClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for MessageBusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBusClient")
            .field("service", &self.inner.config.service_name)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl MessageBusClient {
    #[must_use]
    pub fn new(config: BusConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self::with_clock(config, connector, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        config: BusConfig,
        connector: Arc<dyn BrokerConnector>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                clock,
                state,
                session: ArcSwapOption::empty(),
                handlers: DashMap::new(),
                request_handlers: DashMap::new(),
                listening: AtomicBool::new(false),
                pending: Arc::new(PendingRequests::new()),
                shutdown: CancellationToken::new(),
                supervisor: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Observes state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of requests still awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Spawns the connection supervisor if it is not running yet.
    pub fn start(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut supervisor = self.inner.supervisor.lock();
        if supervisor.is_none() {
            *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.inner))));
        }
    }

    /// Starts the supervisor and waits for the first connection.
    ///
    /// On timeout the supervisor keeps retrying in the background.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectTimeout`] if no connection is established
    /// within [`BusConfig::connect_timeout`], or [`BusError::Closed`] after
    /// `disconnect`.
    pub async fn connect(&self) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.start();
        match tokio::time::timeout(self.inner.config.connect_timeout, self.inner.wait_for_session()).await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(BusError::ConnectTimeout),
        }
    }

    /// Publishes a notification and returns its envelope id.
    ///
    /// # Errors
    ///
    /// Fails with [`BusError::NotConnected`] while no connection is up, so
    /// callers can compensate instead of assuming delivery.
    pub async fn publish(
        &self,
        kind: &str,
        data: Value,
        target_id: Option<String>,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        let session = self.inner.current_session()?;
        let envelope = self.inner.envelope(kind, data).with_target(target_id);
        let routing_key = options.routing_key.unwrap_or_else(|| kind.to_string());
        let properties = MessageProperties {
            message_id: Some(envelope.id.clone()),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            persistent: options.persistent,
            headers: options.headers,
            ..MessageProperties::default()
        };
        self.inner
            .publish_on(&session, &self.inner.config.exchange, &routing_key, &envelope, properties)
            .await?;
        debug!(kind, id = %envelope.id, routing_key = %routing_key, "published notification");
        Ok(envelope.id)
    }

    /// Registers `handler` for notifications of `kind` ([`WILDCARD`] for all).
    ///
    /// Consumption only begins once [`start_listening`](Self::start_listening)
    /// has been called; afterwards new subscriptions are bound immediately.
    ///
    /// # Errors
    ///
    /// Returns a broker error if binding on the live connection fails.
    pub async fn subscribe(
        &self,
        kind: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let kind = kind.into();
        self.inner.handlers.insert(kind.clone(), handler);
        debug!(kind = %kind, "handler registered");
        if !self.inner.listening.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(session) = self.inner.current_session() {
            if session.notifications_started.load(Ordering::SeqCst) {
                session
                    .publish
                    .bind_queue(
                        &self.inner.config.notification_queue(),
                        &self.inner.config.exchange,
                        binding_key(&kind),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Removes the handler for `kind` and its queue binding.
    ///
    /// # Errors
    ///
    /// Returns a broker error if unbinding on the live connection fails.
    pub async fn unsubscribe(&self, kind: &str) -> Result<bool, BusError> {
        let removed = self.inner.handlers.remove(kind).is_some();
        if removed {
            if let Ok(session) = self.inner.current_session() {
                if session.notifications_started.load(Ordering::SeqCst) {
                    session
                        .publish
                        .unbind_queue(
                            &self.inner.config.notification_queue(),
                            &self.inner.config.exchange,
                            binding_key(kind),
                        )
                        .await?;
                }
            }
        }
        Ok(removed)
    }

    /// Binds every registered handler type and starts consuming.
    ///
    /// If the client is not connected yet, consumption starts as soon as it
    /// connects.
    ///
    /// # Errors
    ///
    /// Returns a broker error if queue setup on the live connection fails.
    pub async fn start_listening(&self) -> Result<(), BusError> {
        self.inner.listening.store(true, Ordering::SeqCst);
        match self.inner.current_session() {
            Ok(session) => self.inner.start_notifications(&session).await,
            Err(BusError::Closed) => Err(BusError::Closed),
            Err(_) => Ok(()),
        }
    }

    /// Sends a request and waits for the correlated reply.
    ///
    /// While the broker is unreachable the request waits for reconnection;
    /// connection problems only ever surface as a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::RequestTimeout`] when no reply arrives in time,
    /// [`BusError::Remote`] when the handler replied with an error, and
    /// [`BusError::Closed`] if the client is disconnected meanwhile.
    pub async fn request(
        &self,
        kind: &str,
        data: Value,
        options: RequestOptions,
    ) -> Result<Value, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let timeout = options.timeout.unwrap_or(self.inner.config.reply_timeout);
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (_guard, reply) = self.inner.pending.register(correlation_id.clone());

        let envelope = self
            .inner
            .envelope(kind, data)
            .with_target(options.target_id)
            .with_correlation_id(correlation_id.as_str());
        let routing_key = options.routing_key.unwrap_or_else(|| kind.to_string());

        let exchange = &self.inner.config.exchange;
        let attempt = async {
            loop {
                let session = self.inner.wait_for_session().await?;
                let properties = MessageProperties {
                    message_id: Some(envelope.id.clone()),
                    correlation_id: Some(correlation_id.clone()),
                    reply_to: Some(session.reply_queue.clone()),
                    content_type: Some(JSON_CONTENT_TYPE.to_string()),
                    ..MessageProperties::default()
                };
                match self
                    .inner
                    .publish_on(&session, exchange, &routing_key, &envelope, properties)
                    .await
                {
                    Ok(()) => break,
                    Err(BusError::Broker(e)) => {
                        debug!(kind, error = %e, "request publish failed, waiting for reconnect");
                        session.cancel.cancelled().await;
                    }
                    Err(other) => return Err(other),
                }
            }
            reply.await.map_err(|_| BusError::Closed)
        };

        let envelope = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(kind, correlation_id = %correlation_id, ?timeout, "request timed out");
                return Err(BusError::RequestTimeout {
                    kind: kind.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };

        let payload: ReplyPayload = serde_json::from_value(envelope.data)?;
        if payload.success {
            Ok(payload.data.unwrap_or(Value::Null))
        } else {
            Err(BusError::Remote {
                kind: kind.to_string(),
                message: payload.error.unwrap_or_default(),
            })
        }
    }

    /// Serves requests of `kind` from the durable queue `rpc.{kind}`.
    ///
    /// # Errors
    ///
    /// Returns a broker error if queue setup on the live connection fails.
    pub async fn register_request_handler(
        &self,
        kind: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), BusError> {
        let kind = kind.into();
        self.inner.request_handlers.insert(kind.clone(), handler);
        match self.inner.current_session() {
            Ok(session) => self.inner.start_request_consumer(&session, &kind).await,
            Err(BusError::Closed) => Err(BusError::Closed),
            Err(_) => Ok(()),
        }
    }

    /// Cancels consumers, closes channels and the connection.
    ///
    /// Idempotent. Pending requests fail with [`BusError::Closed`].
    pub async fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        if let Some(session) = self.inner.session.swap(None) {
            session.teardown().await;
        }
        self.inner.pending.clear();
        self.inner.set_state(ConnectionState::Closed);
        info!(service = %self.inner.config.service_name, "message bus disconnected");
    }
}

#[async_trait]
impl EventPublisher for MessageBusClient {
    async fn publish_event(&self, kind: &str, data: Value) -> Result<String, BusError> {
        self.publish(kind, data, None, PublishOptions::default()).await
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}

#[async_trait]
impl ManagedService for MessageBusClient {
    fn name(&self) -> &'static str {
        "message-bus"
    }

    async fn init(&self, _ctx: &LifecycleContext) -> anyhow::Result<()> {
        self.connect().await?;
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.disconnect().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
