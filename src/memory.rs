// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A small broker living inside the process, implementing the same traits as
//! the AMQP transport. It keeps the RabbitMQ semantics the bus depends on:
//! topic, direct and fanout exchanges, the default exchange routing by queue
//! name, per-consumer prefetch, manual ack and reject, dead-lettering of
//! rejected and expired messages, and redelivery of unacknowledged messages
//! when a connection goes away.
//!
//! It also lets callers take the broker down (`set_online`, `restart`,
//! `fail_next_connects`) to exercise reconnection, and inspect queues and
//! bindings afterwards.

use crate::{
    broker::{
        Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ErrorCallback,
        Transport,
    },
    errors::BusError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    routing::topic_matches,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::debug;

/// A message held by, or delivered from, an in-memory queue.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
    pub redelivered: bool,
    enqueued_at: Instant,
}

impl Envelope {
    /// Decodes the JSON body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    online: bool,
    failing_connects: u32,
    connect_attempts: u64,
    next_id: u64,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
}

impl Default for BrokerState {
    fn default() -> Self {
        BrokerState {
            online: true,
            failing_connects: 0,
            connect_attempts: 0,
            next_id: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            connections: HashMap::new(),
        }
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.connections
            .values()
            .any(|conn| conn.channels.contains(&channel))
    }

    /// Queues a message published to `exchange` reaches, or `None` when the
    /// exchange does not exist.
    fn route(&self, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| vec![routing_key.to_owned()])
                    .unwrap_or_default(),
            );
        }

        let exch = self.exchanges.get(exchange)?;
        let mut targets: Vec<String> = exch
            .bindings
            .iter()
            .filter(|(_, pattern)| match exch.definition.kind {
                ExchangeKind::Topic => topic_matches(pattern, routing_key),
                ExchangeKind::Direct => pattern == routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.dedup();
        Some(targets)
    }
}

struct ExchangeState {
    definition: ExchangeDefinition,
    /// (queue, pattern)
    bindings: BTreeSet<(String, String)>,
}

struct QueueState {
    definition: QueueDefinition,
    ready: VecDeque<Envelope>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
}

impl QueueState {
    fn new(definition: QueueDefinition) -> Self {
        QueueState {
            definition,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: vec![],
            cursor: 0,
        }
    }

    /// Puts unacked messages matching `filter` back at the head of the queue,
    /// oldest first.
    fn requeue_unacked(&mut self, filter: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| filter(entry))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(entry) = self.unacked.remove(&tag) {
                let mut envelope = entry.envelope;
                envelope.redelivered = true;
                self.ready.push_front(envelope);
            }
        }
    }
}

struct Unacked {
    consumer: u64,
    channel: u64,
    envelope: Envelope,
}

struct ConsumerState {
    id: u64,
    tag: String,
    channel: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, BusError>>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct ConnectionState {
    channels: BTreeSet<u64>,
    callbacks: Vec<ErrorCallback>,
}

enum Settlement {
    Ack,
    Reject { requeue: bool },
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While offline every connection attempt fails.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Drops every connection as a broker restart would.
    ///
    /// Error listeners fire, consumers stop, unacknowledged messages go back to
    /// their queues, and only durable exchanges and queues survive.
    pub fn restart(&self) {
        let callbacks: Vec<ErrorCallback> = {
            let mut state = self.lock();
            let connections: Vec<ConnectionState> =
                state.connections.drain().map(|(_, conn)| conn).collect();

            for queue in state.queues.values_mut() {
                queue.consumers.clear();
                queue.cursor = 0;
                queue.requeue_unacked(|_| true);
            }

            state.queues.retain(|_, queue| queue.definition.durable);
            state.exchanges.retain(|_, exch| exch.definition.durable);

            let BrokerState {
                exchanges, queues, ..
            } = &mut *state;
            for exch in exchanges.values_mut() {
                exch.bindings.retain(|(queue, _)| queues.contains_key(queue));
            }

            connections
                .into_iter()
                .flat_map(|conn| conn.callbacks)
                .collect()
        };

        debug!(listeners = callbacks.len(), "memory broker restarted");
        for mut callback in callbacks {
            callback(BusError::ConnectionError("connection reset by broker".to_owned()));
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_definition(&self, queue: &str) -> Option<QueueDefinition> {
        self.lock()
            .queues
            .get(queue)
            .map(|state| state.definition.clone())
    }

    pub fn exchange_definition(&self, exchange: &str) -> Option<ExchangeDefinition> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|state| state.definition.clone())
    }

    /// Bindings targeting `queue`, sorted.
    pub fn bindings(&self, queue: &str) -> Vec<QueueBinding> {
        let state = self.lock();
        let mut bindings: Vec<QueueBinding> = state
            .exchanges
            .iter()
            .flat_map(|(name, exch)| {
                exch.bindings
                    .iter()
                    .filter(move |(target, _)| target == queue)
                    .map(move |(target, pattern)| {
                        QueueBinding::new(target).exchange(name).routing_key(pattern)
                    })
            })
            .collect();
        bindings.sort();
        bindings
    }

    /// Messages waiting in `queue`, after expiring those past the queue TTL.
    pub fn messages(&self, queue: &str) -> Vec<Envelope> {
        let mut state = self.lock();
        self.expire(&mut state, queue);
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self, queue: &str) -> usize {
        self.messages(queue).len()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Publishes without a connection, e.g. to plant a malformed message.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        let mut state = self.lock();
        self.publish_locked(&mut state, exchange, routing_key, data, properties)
    }

    fn publish_locked(
        &self,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        let Some(targets) = state.route(exchange, routing_key) else {
            return Err(BusError::PublishingError(format!(
                "no exchange `{exchange}`"
            )));
        };

        let envelope = Envelope {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            properties,
            redelivered: false,
            enqueued_at: Instant::now(),
        };
        self.enqueue(state, &targets, envelope);
        Ok(())
    }

    fn enqueue(&self, state: &mut BrokerState, targets: &[String], envelope: Envelope) {
        for target in targets {
            if let Some(queue) = state.queues.get_mut(target) {
                let mut copy = envelope.clone();
                copy.enqueued_at = Instant::now();
                queue.ready.push_back(copy);
            }
        }

        for target in targets {
            self.dispatch(state, target);
        }
    }

    /// Routes a message through the dead-letter exchange of the queue it left.
    /// Without a dead-letter exchange the message is dropped.
    fn dead_letter(
        &self,
        state: &mut BrokerState,
        definition: &QueueDefinition,
        envelope: Envelope,
    ) {
        let Some(dlx) = definition.dead_letter_exchange.as_deref() else {
            debug!(queue = definition.name.as_str(), "message dropped, no dead letter exchange");
            return;
        };

        match state.route(dlx, &envelope.routing_key) {
            Some(targets) => {
                let envelope = Envelope {
                    exchange: dlx.to_owned(),
                    redelivered: false,
                    ..envelope
                };
                self.enqueue(state, &targets, envelope);
            }
            None => debug!(exchange = dlx, "message dropped, dead letter exchange missing"),
        }
    }

    fn expire(&self, state: &mut BrokerState, queue: &str) {
        let now = Instant::now();
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(ttl) = q.definition.ttl else {
            return;
        };
        let ttl = Duration::from_millis(u64::try_from(ttl).unwrap_or_default());

        let mut expired = vec![];
        q.ready.retain(|envelope| {
            if now.duration_since(envelope.enqueued_at) >= ttl {
                expired.push(envelope.clone());
                false
            } else {
                true
            }
        });

        if expired.is_empty() {
            return;
        }

        let definition = q.definition.clone();
        for envelope in expired {
            self.dead_letter(state, &definition, envelope);
        }
    }

    /// Hands ready messages to consumers with free prefetch slots, round robin.
    fn dispatch(&self, state: &mut BrokerState, queue: &str) {
        self.expire(state, queue);

        let BrokerState {
            queues, next_id, ..
        } = state;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        while !q.ready.is_empty() {
            let count = q.consumers.len();
            let Some(idx) = (0..count)
                .map(|offset| (q.cursor + offset) % count)
                .find(|idx| q.consumers[*idx].has_capacity())
            else {
                break;
            };
            let Some(envelope) = q.ready.pop_front() else {
                break;
            };

            *next_id += 1;
            let tag = *next_id;

            let consumer = &mut q.consumers[idx];
            let delivery = Delivery::new(
                envelope.exchange.clone(),
                envelope.routing_key.clone(),
                envelope.redelivered,
                envelope.data.clone(),
                envelope.properties.clone(),
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    queue: queue.to_owned(),
                    channel: consumer.channel,
                    tag,
                }),
            );

            if consumer.sender.send(Ok(delivery)).is_err() {
                q.consumers.remove(idx);
                q.ready.push_front(envelope);
                continue;
            }

            consumer.in_flight += 1;
            let (consumer_id, channel) = (consumer.id, consumer.channel);
            q.unacked.insert(
                tag,
                Unacked {
                    consumer: consumer_id,
                    channel,
                    envelope,
                },
            );
            q.cursor = (idx + 1) % count;
        }
    }

    fn settle(
        &self,
        queue: &str,
        channel: u64,
        tag: u64,
        settlement: Settlement,
    ) -> Result<(), BusError> {
        let failure = match settlement {
            Settlement::Ack => BusError::AckMessageError,
            Settlement::Reject { .. } => BusError::RejectMessageError,
        };

        let mut state = self.lock();
        if !state.channel_open(channel) {
            return Err(failure);
        }

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(failure);
        };
        let Some(entry) = q.unacked.remove(&tag) else {
            return Err(failure);
        };
        if let Some(consumer) = q.consumers.iter_mut().find(|c| c.id == entry.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        match settlement {
            Settlement::Ack => {}
            Settlement::Reject { requeue: true } => {
                let mut envelope = entry.envelope;
                envelope.redelivered = true;
                q.ready.push_front(envelope);
            }
            Settlement::Reject { requeue: false } => {
                let definition = q.definition.clone();
                self.dead_letter(&mut state, &definition, entry.envelope);
            }
        }

        self.dispatch(&mut state, queue);
        Ok(())
    }

    /// Stops the consumers of a channel and returns its unacked messages.
    fn close_channel(&self, state: &mut BrokerState, channel: u64) {
        let mut touched = vec![];
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len() + queue.unacked.len();
            queue.consumers.retain(|c| c.channel != channel);
            queue.requeue_unacked(|entry| entry.channel == channel);
            if queue.consumers.len() + queue.unacked.len() != before {
                touched.push(name.clone());
            }
        }

        for conn in state.connections.values_mut() {
            conn.channels.remove(&channel);
        }

        for name in touched {
            self.dispatch(state, &name);
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, BusError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if !state.online {
            return Err(BusError::ConnectionError(format!("{url} is unreachable")));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BusError::ConnectionError(format!("{url} refused the connection")));
        }

        let id = state.next_id();
        state.connections.insert(id, ConnectionState::default());
        debug!(connection = connection_name, id, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        let mut state = self.broker.lock();
        let channel = state.next_id();
        let Some(conn) = state.connections.get_mut(&self.id) else {
            return Err(BusError::ChannelError);
        };
        conn.channels.insert(channel);

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id: channel,
            prefetch: AtomicU16::new(0),
        }))
    }

    fn on_error(&self, callback: ErrorCallback) {
        if let Some(conn) = self.broker.lock().connections.get_mut(&self.id) {
            conn.callbacks.push(callback);
        }
    }

    fn is_connected(&self) -> bool {
        self.broker.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = self.broker.lock();
        let Some(conn) = state.connections.get(&self.id) else {
            return Ok(());
        };
        let channels: Vec<u64> = conn.channels.iter().copied().collect();
        for channel in channels {
            self.broker.close_channel(&mut state, channel);
        }
        state.connections.remove(&self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, BusError> {
        let state = self.broker.lock();
        if state.channel_open(self.id) {
            Ok(state)
        } else {
            Err(BusError::ChannelError)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        let mut state = self.open_state()?;
        match state.exchanges.get(&def.name) {
            Some(existing) if existing.definition != *def => {
                self.broker.close_channel(&mut state, self.id);
                Err(BusError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    def.name.clone(),
                    ExchangeState {
                        definition: def.clone(),
                        bindings: BTreeSet::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BusError> {
        let mut state = self.open_state()?;
        match state.queues.get(&def.name) {
            Some(existing) if existing.definition != *def => {
                self.broker.close_channel(&mut state, self.id);
                Err(BusError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(def.name.clone(), QueueState::new(def.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BusError> {
        let mut state = self.open_state()?;
        let failure = || {
            BusError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        };

        if !state.queues.contains_key(&binding.queue_name) {
            return Err(failure());
        }
        let exch = state
            .exchanges
            .get_mut(&binding.exchange_name)
            .ok_or_else(failure)?;
        exch.bindings
            .insert((binding.queue_name.clone(), binding.routing_key.clone()));
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), BusError> {
        self.open_state()?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        let mut state = self.open_state()?;
        self.broker
            .publish_locked(&mut state, exchange, routing_key, payload, properties)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BusError> {
        let mut state = self.open_state()?;
        let id = state.next_id();
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BusError::ConsumerDeclarationError(queue.to_owned()));
        };
        if q
            .consumers
            .iter()
            .any(|c| c.channel == self.id && c.tag == consumer_tag)
        {
            return Err(BusError::ConsumerDeclarationError(consumer_tag.to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerState {
            id,
            tag: consumer_tag.to_owned(),
            channel: self.id,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            in_flight: 0,
            sender,
        });
        self.broker.dispatch(&mut state, queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        let mut state = self.open_state()?;
        let mut found = false;
        for queue in state.queues.values_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));
            found |= queue.consumers.len() != before;
        }

        if found {
            Ok(())
        } else {
            Err(BusError::ConsumerDeclarationError(consumer_tag.to_owned()))
        }
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channel_open(self.id)
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = self.broker.lock();
        self.broker.close_channel(&mut state, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    channel: u64,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.broker
            .settle(&self.queue, self.channel, self.tag, Settlement::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        self.broker.settle(
            &self.queue,
            self.channel,
            self.tag,
            Settlement::Reject { requeue },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let conn = broker.connect("memory://", "test").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        (conn, channel)
    }

    async fn topic_with_queue(
        channel: &Arc<dyn BrokerChannel>,
        queue: QueueDefinition,
        pattern: &str,
    ) {
        channel
            .declare_exchange(&ExchangeDefinition::new("agents").topic().durable())
            .await
            .unwrap();
        let name = queue.name.clone();
        channel.declare_queue(&queue).await.unwrap();
        channel
            .bind_queue(&QueueBinding::new(&name).exchange("agents").routing_key(pattern))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn routes_by_topic_pattern() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        topic_with_queue(&channel, QueueDefinition::new("q").durable(), "PUBLISHER.*").await;

        let props = BasicProperties::default();
        channel.publish("agents", "PUBLISHER.PUBLISH", b"{}", props.clone()).await.unwrap();
        channel.publish("agents", "SCHEDULER.PUBLISH", b"{}", props).await.unwrap();

        assert_eq!(broker.message_count("q"), 1);
    }

    #[tokio::test]
    async fn publishing_to_missing_exchange_fails() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        let res = channel
            .publish("nowhere", "k", b"{}", BasicProperties::default())
            .await;
        assert!(matches!(res, Err(BusError::PublishingError(_))));
    }

    #[tokio::test]
    async fn prefetch_bounds_in_flight_deliveries() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        topic_with_queue(&channel, QueueDefinition::new("q").durable(), "#").await;
        channel.qos(2).await.unwrap();

        for _ in 0..5 {
            channel
                .publish("agents", "a.b", b"{}", BasicProperties::default())
                .await
                .unwrap();
        }

        let mut stream = channel.consume("q", "c1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let _second = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("q"), 2);
        assert_eq!(broker.message_count("q"), 3);

        first.ack().await.unwrap();
        assert_eq!(broker.unacked_count("q"), 2);
        assert_eq!(broker.message_count("q"), 2);
    }

    #[tokio::test]
    async fn reject_dead_letters_through_dlx() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .declare_exchange(&ExchangeDefinition::new("dlx").topic().durable())
            .await
            .unwrap();
        channel.declare_queue(&QueueDefinition::new("dlq").durable()).await.unwrap();
        channel
            .bind_queue(&QueueBinding::new("dlq").exchange("dlx").routing_key("#"))
            .await
            .unwrap();
        topic_with_queue(
            &channel,
            QueueDefinition::new("q").durable().dead_letter_to("dlx"),
            "#",
        )
        .await;

        channel
            .publish("agents", "PUBLISHER.PUBLISH", b"{}", BasicProperties::default())
            .await
            .unwrap();
        let mut stream = channel.consume("q", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.reject(false).await.unwrap();

        let dead = broker.messages("dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].routing_key, "PUBLISHER.PUBLISH");
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_move_to_dead_letter_queue() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .declare_exchange(&ExchangeDefinition::new("dlx").topic().durable())
            .await
            .unwrap();
        channel.declare_queue(&QueueDefinition::new("dlq").durable()).await.unwrap();
        channel
            .bind_queue(&QueueBinding::new("dlq").exchange("dlx").routing_key("#"))
            .await
            .unwrap();
        topic_with_queue(
            &channel,
            QueueDefinition::new("q")
                .durable()
                .dead_letter_to("dlx")
                .ttl(Duration::from_secs(60)),
            "#",
        )
        .await;

        channel
            .publish("agents", "a.b", b"{}", BasicProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.message_count("q"), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(broker.message_count("q"), 0);
        assert_eq!(broker.message_count("dlq"), 1);
    }

    #[tokio::test]
    async fn restart_requeues_unacked_and_fires_listeners() {
        let broker = MemoryBroker::new();
        let (conn, channel) = open(&broker).await;
        topic_with_queue(&channel, QueueDefinition::new("q").durable(), "#").await;
        channel.declare_queue(&QueueDefinition::new("scratch")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.on_error(Box::new(move |err| {
            let _ = tx.send(err);
        }));

        channel
            .publish("agents", "a.b", b"{}", BasicProperties::default())
            .await
            .unwrap();
        let mut stream = channel.consume("q", "c1").await.unwrap();
        let _delivery = stream.next().await.unwrap().unwrap();

        broker.restart();

        assert!(matches!(rx.recv().await, Some(BusError::ConnectionError(_))));
        assert!(!conn.is_connected());
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_names(), vec!["q".to_owned()]);
        let pending = broker.messages("q");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].redelivered);
    }

    #[tokio::test]
    async fn redeclaring_with_other_arguments_fails() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel.declare_queue(&QueueDefinition::new("q").durable()).await.unwrap();
        channel.declare_queue(&QueueDefinition::new("q").durable()).await.unwrap();

        assert!(channel.is_open());
        let res = channel.declare_queue(&QueueDefinition::new("q")).await;
        assert_eq!(res, Err(BusError::DeclareQueueError("q".into())));

        assert!(!channel.is_open());
        let publish = channel
            .publish("", "q", b"{}", BasicProperties::default())
            .await;
        assert_eq!(publish, Err(BusError::ChannelError));
    }

    #[tokio::test]
    async fn offline_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_online(false);
        assert!(broker.connect("memory://", "test").await.is_err());

        broker.set_online(true);
        broker.fail_next_connects(1);
        assert!(broker.connect("memory://", "test").await.is_err());
        assert!(broker.connect("memory://", "test").await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }
}
