//! In-process test double implementing the transport contract.
//!
//! Supports direct, topic, and fanout exchanges, the default exchange, durable
//! and exclusive auto-delete queues, per-channel prefetch, ack/nack with
//! requeue, and requeue of unacknowledged deliveries when a channel closes.
//! Fault hooks (refused connects, dropped connections, publish backpressure)
//! let tests drive the bus client's recovery paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Consumer, Delivery,
    ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions,
};

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    body: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    key: String,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct ChannelState {
    connection: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, Message)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, CancellationToken>,
    published: u64,
}

impl BrokerState {
    fn ensure_channel(&self, id: u64) -> Result<(), BrokerError> {
        if self.channels.contains_key(&id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn route(&self, exchange: &str, key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(key)
                .then(|| vec![key.to_string()])
                .unwrap_or_default());
        }
        let ex = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let mut targets: Vec<String> = Vec::new();
        for binding in &ex.bindings {
            let hit = match ex.kind {
                ExchangeKind::Direct => binding.key == key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.key, key),
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    /// Hands ready messages to consumers with spare prefetch capacity,
    /// rotating across consumers.
    fn dispatch(&mut self, queue_name: &str) {
        let Self {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        'deliver: while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let n = queue.consumers.len();
            for offset in 0..n {
                let idx = (queue.next_consumer + offset) % n;
                let channel_id = queue.consumers[idx].channel;
                let Some(channel) = channels.get_mut(&channel_id) else {
                    continue;
                };
                if !channel.has_capacity() {
                    continue;
                }
                let Some(message) = queue.ready.pop_front() else {
                    break 'deliver;
                };
                let tag = channel.next_tag + 1;
                let delivery = Delivery {
                    delivery_tag: tag,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                };
                if queue.consumers[idx].tx.send(delivery).is_err() {
                    // Receiver gone: drop the consumer and retry the message.
                    queue.ready.push_front(message);
                    queue.consumers.remove(idx);
                    continue 'deliver;
                }
                channel.next_tag = tag;
                channel.unacked.insert(tag, (queue_name.to_string(), message));
                queue.next_consumer = (idx + 1) % n;
                continue 'deliver;
            }
            // Every consumer is at its prefetch limit.
            break;
        }
    }

    fn dispatch_for_channel(&mut self, channel: u64) {
        let names: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.consumers.iter().any(|c| c.channel == channel))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn requeue(&mut self, queue: &str, mut message: Message) {
        if let Some(q) = self.queues.get_mut(queue) {
            message.redelivered = true;
            q.ready.push_front(message);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
    }

    fn remove_consumers(&mut self, predicate: impl Fn(&ConsumerSlot) -> bool) -> Vec<String> {
        let mut emptied = Vec::new();
        for (name, queue) in &mut self.queues {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !predicate(c));
            if before > 0 && queue.consumers.is_empty() && queue.options.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in &emptied {
            self.delete_queue(name);
        }
        emptied
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        self.remove_consumers(|c| c.channel == id);

        let mut unacked: Vec<(u64, (String, Message))> = channel.unacked.into_iter().collect();
        // Highest tag first so push_front restores delivery order.
        unacked.sort_by(|a, b| b.0.cmp(&a.0));
        let mut touched: Vec<String> = Vec::new();
        for (_, (queue, message)) in unacked {
            self.requeue(&queue, message);
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, id: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == id)
            .map(|(cid, _)| *cid)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
        if let Some(token) = self.connections.remove(&id) {
            token.cancel();
        }
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
#[must_use]
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            match_words(rest, key)
                || key
                    .split_first()
                    .is_some_and(|(_, key_rest)| match_words(pattern, key_rest))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((part, key_rest))) => word == part && match_words(rest, key_rest),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    writable: watch::Sender<bool>,
    refused_connects: AtomicU32,
    ids: AtomicU64,
}

impl BrokerInner {
    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Shared in-process broker. Clones share the same exchanges and queues.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (writable, _) = watch::channel(true);
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                writable,
                refused_connects: AtomicU32::new(0),
                ids: AtomicU64::new(0),
            }),
        }
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_next_connects(&self, count: u32) {
        self.inner.refused_connects.store(count, Ordering::SeqCst);
    }

    /// Closes every open connection from the broker side.
    pub fn drop_connections(&self) {
        let mut state = self.inner.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Turns publish backpressure on (`false`) or off (`true`).
    pub fn set_writable(&self, writable: bool) {
        self.inner.writable.send_replace(writable);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    /// Messages waiting in `name` that have not been delivered.
    #[must_use]
    pub fn ready_count(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.ready.len())
    }

    /// Delivered but unacknowledged messages taken from `name`.
    #[must_use]
    pub fn unacked_count(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|(queue, _)| queue == name)
            .count()
    }

    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.len())
    }

    /// Binding keys from `exchange` to `queue`.
    #[must_use]
    pub fn binding_keys(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .exchanges
            .get(exchange)
            .map(|ex| {
                ex.bindings
                    .iter()
                    .filter(|b| b.queue == queue)
                    .map(|b| b.key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.inner.state.lock().published
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let refused = self
            .inner
            .refused_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::ConnectFailed(format!("{uri}: connection refused")));
        }

        let id = self.inner.next_id();
        let closed = CancellationToken::new();
        self.inner
            .state
            .lock()
            .connections
            .insert(id, closed.clone());
        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            id,
            closed,
        }))
    }
}

// ---------------------------------------------------------------------------
// Connection and channel
// ---------------------------------------------------------------------------

struct MemoryConnection {
    inner: Arc<BrokerInner>,
    id: u64,
    closed: CancellationToken,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = self.inner.next_id();
        self.inner.state.lock().channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            id,
            connection: self.id,
            closed: self.closed.clone(),
        }))
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.state.lock().close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    inner: Arc<BrokerInner>,
    id: u64,
    connection: u64,
    closed: CancellationToken,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", self.inner.next_id())
        } else {
            name.to_string()
        };
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        if let Some(existing) = state.queues.get(&name) {
            return match existing.owner {
                Some(owner) if owner != self.connection => Err(BrokerError::ResourceLocked(name)),
                _ => Ok(name),
            };
        }
        state.queues.insert(
            name.clone(),
            Queue {
                options,
                owner: options.exclusive.then_some(self.connection),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        if !ex
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.key == routing_key)
        {
            ex.bindings.push(Binding {
                queue: queue.to_string(),
                key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        ex.bindings
            .retain(|b| !(b.queue == queue && b.key == routing_key));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<bool, BrokerError> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        let targets = state.route(exchange, routing_key)?;
        state.published += 1;
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(Message {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    properties: properties.clone(),
                    redelivered: false,
                });
            }
            state.dispatch(&queue);
        }
        Ok(*self.inner.writable.borrow())
    }

    async fn wait_writable(&self) -> Result<(), BrokerError> {
        let mut writable = self.inner.writable.subscribe();
        tokio::select! {
            result = writable.wait_for(|w| *w) => {
                result.map(|_| ()).map_err(|_| BrokerError::ChannelClosed)
            }
            () = self.closed.cancelled() => Err(BrokerError::ConnectionClosed),
        }
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(BrokerError::ChannelClosed)?;
        channel.prefetch = count;
        state.dispatch_for_channel(self.id);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let tag = format!("ctag-{}", self.inner.next_id());
        let (tx, deliveries) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if q.owner.is_some_and(|owner| owner != self.connection) {
            return Err(BrokerError::ResourceLocked(queue.to_string()));
        }
        q.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel: self.id,
            tx,
        });
        state.dispatch(queue);
        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.ensure_channel(self.id)?;
        let known = state
            .queues
            .values()
            .any(|q| q.consumers.iter().any(|c| c.tag == consumer_tag));
        if !known {
            return Err(BrokerError::UnknownConsumer(consumer_tag.to_string()));
        }
        state.remove_consumers(|c| c.tag == consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(BrokerError::ChannelClosed)?;
        channel
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        state.dispatch_for_channel(self.id);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(BrokerError::ChannelClosed)?;
        let (queue, message) = channel
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        if requeue {
            state.requeue(&queue, message);
            state.dispatch(&queue);
        }
        state.dispatch_for_channel(self.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.state.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn channel(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let conn = broker.connect("memory://test").await.unwrap();
        let ch = conn.create_channel().await.unwrap();
        (conn, ch)
    }

    async fn publish(ch: &Arc<dyn BrokerChannel>, exchange: &str, key: &str, body: &'static str) {
        ch.publish(exchange, key, Bytes::from_static(body.as_bytes()), MessageProperties::default())
            .await
            .unwrap();
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("product.created", "product.created"));
        assert!(topic_matches("product.*", "product.created"));
        assert!(!topic_matches("product.*", "product.created.FAILED"));
        assert!(topic_matches("product.#", "product.created.FAILED"));
        assert!(topic_matches("product.#", "product"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "order.created"));
        assert!(!topic_matches("order.created", "product.created"));
    }

    #[tokio::test]
    async fn topic_exchange_routes_to_matching_queues() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.assert_exchange("events", ExchangeKind::Topic, ExchangeOptions::default())
            .await
            .unwrap();
        ch.assert_queue("inventory", QueueOptions::durable()).await.unwrap();
        ch.assert_queue("audit", QueueOptions::durable()).await.unwrap();
        ch.bind_queue("inventory", "events", "product.created").await.unwrap();
        ch.bind_queue("audit", "events", "#").await.unwrap();

        publish(&ch, "events", "product.created", "p1").await;
        publish(&ch, "events", "order.created", "o1").await;

        assert_eq!(broker.ready_count("inventory"), 1);
        assert_eq!(broker.ready_count("audit"), 2);
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let name = ch.assert_queue("", QueueOptions::private()).await.unwrap();
        assert!(name.starts_with("amq.gen-"));

        publish(&ch, "", &name, "reply").await;
        publish(&ch, "", "missing-queue", "lost").await;
        assert_eq!(broker.ready_count(&name), 1);
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let err = ch
            .publish("nope", "k", Bytes::new(), MessageProperties::default())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::ExchangeNotFound("nope".into()));
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.assert_queue("work", QueueOptions::durable()).await.unwrap();
        ch.prefetch(2).await.unwrap();
        for body in ["1", "2", "3"] {
            publish(&ch, "", "work", body).await;
        }

        let mut consumer = ch.consume("work").await.unwrap();
        let first = consumer.deliveries.recv().await.unwrap();
        let _second = consumer.deliveries.recv().await.unwrap();
        assert!(consumer.deliveries.try_recv().is_err());
        assert_eq!(broker.unacked_count("work"), 2);
        assert_eq!(broker.ready_count("work"), 1);

        ch.ack(first.delivery_tag).await.unwrap();
        let third = consumer.deliveries.recv().await.unwrap();
        assert_eq!(&third.body[..], b"3");
    }

    #[tokio::test]
    async fn nack_requeue_redelivers_and_nack_drop_discards() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.assert_queue("work", QueueOptions::durable()).await.unwrap();
        publish(&ch, "", "work", "m").await;

        let mut consumer = ch.consume("work").await.unwrap();
        let first = consumer.deliveries.recv().await.unwrap();
        assert!(!first.redelivered);
        ch.nack(first.delivery_tag, true).await.unwrap();

        let again = consumer.deliveries.recv().await.unwrap();
        assert!(again.redelivered);
        ch.nack(again.delivery_tag, false).await.unwrap();

        assert_eq!(broker.ready_count("work"), 0);
        assert_eq!(broker.unacked_count("work"), 0);
        assert!(matches!(
            ch.ack(again.delivery_tag).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
    }

    #[tokio::test]
    async fn closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        ch.assert_queue("work", QueueOptions::durable()).await.unwrap();
        publish(&ch, "", "work", "m").await;
        let mut consumer = ch.consume("work").await.unwrap();
        consumer.deliveries.recv().await.unwrap();

        ch.close().await.unwrap();
        assert!(consumer.deliveries.recv().await.is_none());
        assert_eq!(broker.ready_count("work"), 1);

        let other = conn.create_channel().await.unwrap();
        let mut consumer = other.consume("work").await.unwrap();
        assert!(consumer.deliveries.recv().await.unwrap().redelivered);
        assert!(matches!(ch.ack(1).await, Err(BrokerError::ChannelClosed)));
    }

    #[tokio::test]
    async fn round_robin_between_consumers() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.assert_queue("work", QueueOptions::durable()).await.unwrap();
        let mut a = ch.consume("work").await.unwrap();
        let mut b = ch.consume("work").await.unwrap();
        for body in ["1", "2", "3", "4"] {
            publish(&ch, "", "work", body).await;
        }
        assert_eq!(&a.deliveries.recv().await.unwrap().body[..], b"1");
        assert_eq!(&b.deliveries.recv().await.unwrap().body[..], b"2");
        assert_eq!(&a.deliveries.recv().await.unwrap().body[..], b"3");
        assert_eq!(&b.deliveries.recv().await.unwrap().body[..], b"4");
    }

    #[tokio::test]
    async fn exclusive_queue_lives_and_dies_with_connection() {
        let broker = MemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        let name = ch.assert_queue("", QueueOptions::private()).await.unwrap();

        let (_other_conn, other) = channel(&broker).await;
        assert!(matches!(
            other.consume(&name).await,
            Err(BrokerError::ResourceLocked(_))
        ));

        conn.close().await.unwrap();
        assert!(!broker.queue_exists(&name));
        assert!(!conn.is_open());
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn auto_delete_queue_removed_with_last_consumer() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let opts = QueueOptions {
            auto_delete: true,
            ..QueueOptions::default()
        };
        ch.assert_queue("temp", opts).await.unwrap();
        let consumer = ch.consume("temp").await.unwrap();
        ch.cancel(&consumer.tag).await.unwrap();
        assert!(!broker.queue_exists("temp"));
    }

    #[tokio::test]
    async fn dropped_connections_resolve_closed() {
        let broker = MemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        broker.drop_connections();
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert!(matches!(
            ch.assert_queue("q", QueueOptions::durable()).await,
            Err(BrokerError::ChannelClosed)
        ));
        assert!(matches!(
            conn.create_channel().await,
            Err(BrokerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn refused_connects_are_counted_down() {
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(2);
        assert!(broker.connect("memory://x").await.is_err());
        assert!(broker.connect("memory://x").await.is_err());
        assert!(broker.connect("memory://x").await.is_ok());
    }

    #[tokio::test]
    async fn backpressure_reports_not_writable_until_drained() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.assert_queue("work", QueueOptions::durable()).await.unwrap();
        broker.set_writable(false);

        let accepted = ch
            .publish("", "work", Bytes::from_static(b"x"), MessageProperties::default())
            .await
            .unwrap();
        assert!(!accepted);
        assert_eq!(broker.ready_count("work"), 1);

        let waiter = {
            let ch = Arc::clone(&ch);
            tokio::spawn(async move { ch.wait_writable().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        broker.set_writable(true);
        waiter.await.unwrap().unwrap();
    }
}
