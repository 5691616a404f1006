// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bus
//!
//! `MessageBus` is the handle agents use to talk to each other. It owns one
//! broker connection with a single channel, the registry of agent handlers,
//! the pending retries and the reconnect supervisor.
//!
//! When the connection drops, the supervisor reconnects after the configured
//! delay and every registered handler gets its consumer back without the agent
//! subscribing again.

use crate::{
    amqp::AmqpTransport,
    broker::{BrokerChannel, BrokerConnection, Transport},
    config::MessageBusConfig,
    dispatcher::{consumer_tag, spawn_consumer, ActiveConsumer, AgentHandler, HandlerRegistry},
    errors::BusError,
    message::{AgentMessage, AgentType},
    publisher::AgentPublisher,
    retry::{RetryPolicy, RetryScheduler},
    supervisor::ReconnectSupervisor,
    topology,
};
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Publish/subscribe handle shared by the agents of a process.
///
/// Clones share the same connection and registry.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        MessageBus::amqp()
    }
}

impl MessageBus {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        MessageBus::with_transport(Arc::new(transport))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        MessageBus {
            inner: Arc::new(BusInner::new(transport)),
        }
    }

    /// A bus talking to RabbitMQ.
    pub fn amqp() -> Self {
        MessageBus::new(AmqpTransport)
    }

    /// Connects to the broker and declares the shared topic exchange.
    ///
    /// Does nothing when already connected. A failure here is returned as is,
    /// no reconnect loop is started for it.
    pub async fn connect(&self, config: MessageBusConfig) -> Result<(), BusError> {
        config.validate()?;
        self.inner.connect(config).await
    }

    /// Publishes `message` to the topic exchange.
    pub async fn publish(&self, message: &AgentMessage) -> Result<(), BusError> {
        self.publish_with_context(&Context::current(), message).await
    }

    /// Publishes `message`, propagating the trace of `ctx` in the headers.
    pub async fn publish_with_context(
        &self,
        ctx: &Context,
        message: &AgentMessage,
    ) -> Result<(), BusError> {
        let Some(session) = self.inner.session() else {
            return Err(BusError::NotConnected);
        };

        let res = AgentPublisher::new(session.channel.clone(), &session.exchange)
            .publish(ctx, message)
            .await;
        if let Err(err) = &res {
            self.inner.channel_failed(&session, err).await;
        }
        res
    }

    /// Declares the queue of `agent` and starts delivering to `handler`.
    ///
    /// Subscribing again replaces the handler and keeps a single consumer.
    /// While a reconnect is in progress the handler is registered and its
    /// consumer starts once the connection is back.
    pub async fn subscribe<H>(&self, agent: AgentType, handler: H) -> Result<(), BusError>
    where
        H: AgentHandler + 'static,
    {
        self.inner.subscribe(agent, Arc::new(handler)).await
    }

    /// Declares the dead-letter exchange and queue. They are declared again
    /// after every reconnect.
    pub async fn create_dead_letter_exchange(&self) -> Result<(), BusError> {
        self.inner.create_dead_letter_exchange().await
    }

    /// Stops reconnecting, cancels pending retries, drops every handler and
    /// closes the connection. Close errors are logged, never returned.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.inner.disconnect().await;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Agent types with a registered handler.
    pub fn subscribed_agents(&self) -> Vec<AgentType> {
        lock(&self.inner.registry).agents()
    }

    /// Whether `agent` has a live consumer.
    pub fn is_consuming(&self, agent: AgentType) -> bool {
        lock(&self.inner.registry).is_consuming(agent)
    }

    /// Retries waiting to be republished.
    pub fn pending_retries(&self) -> usize {
        self.inner.retries.pending()
    }

    /// Whether a reconnect loop is running.
    pub fn is_reconnecting(&self) -> bool {
        self.inner.supervisor.is_reconnecting()
    }

    /// Reconnect attempts made since the bus was created.
    pub fn reconnect_attempts(&self) -> u64 {
        self.inner.supervisor.attempts()
    }
}

#[derive(Clone)]
struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
    generation: u64,
}

pub(crate) struct BusInner {
    transport: Arc<dyn Transport>,
    config: RwLock<Option<MessageBusConfig>>,
    session: RwLock<Option<Session>>,
    generation: AtomicU64,
    registry: Mutex<HandlerRegistry>,
    retries: RetryScheduler,
    supervisor: ReconnectSupervisor,
    dead_letter: AtomicBool,
    /// Serializes connect, reconnect, subscribe and disconnect.
    ops: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T: Clone>(lock: &RwLock<Option<T>>) -> Option<T> {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(lock: &RwLock<Option<T>>, value: Option<T>) -> Option<T> {
    let mut guard = lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::replace(&mut *guard, value)
}

impl BusInner {
    fn new(transport: Arc<dyn Transport>) -> Self {
        BusInner {
            transport,
            config: RwLock::new(None),
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            registry: Mutex::new(HandlerRegistry::default()),
            retries: RetryScheduler::default(),
            supervisor: ReconnectSupervisor::default(),
            dead_letter: AtomicBool::new(false),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    fn config(&self) -> Option<MessageBusConfig> {
        read(&self.config)
    }

    fn session(&self) -> Option<Session> {
        read(&self.session)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session().is_some_and(|session| {
            session.connection.is_connected() && session.channel.is_open()
        })
    }

    async fn connect(self: &Arc<Self>, config: MessageBusConfig) -> Result<(), BusError> {
        let _ops = self.ops.lock().await;

        if self.is_connected() {
            debug!("already connected to the broker");
            return Ok(());
        }

        self.supervisor.reset();
        if let Ok(handle) = Handle::try_current() {
            self.supervisor.bind_runtime(handle);
        }
        let previous = write(&self.config, Some(config.clone()));

        match self.open_session(&config).await {
            Ok(()) => {
                info!(
                    exchange = config.exchange_name.as_str(),
                    connection = config.connection_name.as_str(),
                    "connected to broker"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect to the broker");
                if previous.is_none() {
                    write(&self.config, None);
                }
                Err(err)
            }
        }
    }

    /// Called by the supervisor. Opens a new session and replays consumers.
    pub(crate) async fn reconnect(self: &Arc<Self>) -> Result<(), BusError> {
        let _ops = self.ops.lock().await;

        let Some(config) = self.config() else {
            return Ok(());
        };
        if self.is_connected() {
            return Ok(());
        }

        self.open_session(&config).await
    }

    /// Connects, declares the topic exchange, then restores the dead-letter
    /// topology and every registered consumer. Closes the session on failure.
    async fn open_session(self: &Arc<Self>, config: &MessageBusConfig) -> Result<(), BusError> {
        let session = self.establish(config).await?;

        if let Err(err) = self.restore(&session, config).await {
            self.drop_session(session.generation).await;
            return Err(err);
        }

        Ok(())
    }

    async fn establish(self: &Arc<Self>, config: &MessageBusConfig) -> Result<Session, BusError> {
        let cancelled = self.supervisor.cancellation();
        let connection = tokio::select! {
            _ = cancelled.cancelled() => {
                return Err(BusError::ConnectionError("dial cancelled by disconnect".to_owned()));
            }
            res = self.transport.connect(&config.url, &config.connection_name) => res?,
        };

        let channel = match self.open_channel(connection.as_ref(), config).await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close) = connection.close().await {
                    debug!(error = close.to_string(), "error closing failed connection");
                }
                return Err(err);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let bus = Arc::downgrade(self);
        connection.on_error(Box::new(move |err| {
            if let Some(inner) = bus.upgrade() {
                inner.connection_lost(generation, err);
            }
        }));

        let session = Session {
            connection: connection.clone(),
            channel,
            exchange: config.exchange_name.clone(),
            generation,
        };
        write(&self.session, Some(session.clone()));

        if !connection.is_connected() {
            self.drop_session(generation).await;
            return Err(BusError::ConnectionError(
                "connection closed while opening".to_owned(),
            ));
        }

        Ok(session)
    }

    async fn open_channel(
        &self,
        connection: &dyn BrokerConnection,
        config: &MessageBusConfig,
    ) -> Result<Arc<dyn BrokerChannel>, BusError> {
        let channel = connection.create_channel().await?;
        channel.qos(config.prefetch_count).await?;
        topology::install_main_exchange(channel.clone(), config).await?;
        Ok(channel)
    }

    async fn restore(
        self: &Arc<Self>,
        session: &Session,
        config: &MessageBusConfig,
    ) -> Result<(), BusError> {
        if self.dead_letter.load(Ordering::SeqCst) {
            topology::install_dead_letter(session.channel.clone(), config).await?;
        }

        let subscriptions = lock(&self.registry).subscriptions();
        for (agent, handler) in subscriptions {
            self.start_consumer(session, config, agent, handler).await?;
        }

        Ok(())
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, err: BusError) {
        {
            let mut session = self
                .session
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match session.as_ref() {
                Some(current) if current.generation == generation => *session = None,
                _ => return,
            }
        }

        let Some(config) = self.config() else {
            return;
        };

        error!(
            error = err.to_string(),
            retry_in_ms = config.reconnect_delay.as_millis() as u64,
            "broker connection lost"
        );
        self.supervisor
            .schedule(Arc::downgrade(self), config.reconnect_delay);
    }

    /// Hands a session whose channel the broker closed, e.g. after a
    /// precondition failure, to the supervisor. Open channels are left alone.
    async fn channel_failed(self: &Arc<Self>, session: &Session, err: &BusError) {
        if session.channel.is_open() {
            return;
        }
        if !self.drop_session(session.generation).await {
            return;
        }
        let Some(config) = self.config() else {
            return;
        };

        error!(
            error = err.to_string(),
            retry_in_ms = config.reconnect_delay.as_millis() as u64,
            "broker channel closed"
        );
        self.supervisor
            .schedule(Arc::downgrade(self), config.reconnect_delay);
    }

    async fn subscribe(
        self: &Arc<Self>,
        agent: AgentType,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), BusError> {
        let _ops = self.ops.lock().await;

        let Some(config) = self.config() else {
            return Err(BusError::NotConnected);
        };

        let previous = lock(&self.registry).register(agent, handler.clone());
        let session = self.session();
        if let Some(previous) = previous {
            debug!(agent = agent.as_str(), "replacing handler");
            self.stop_consumer(session.as_ref(), previous).await;
        }

        let Some(session) = session else {
            info!(
                agent = agent.as_str(),
                "not connected, consumer starts once reconnected"
            );
            return Ok(());
        };

        if let Err(err) = self.start_consumer(&session, &config, agent, handler).await {
            error!(error = err.to_string(), agent = agent.as_str(), "failure to subscribe");
            let consumer = lock(&self.registry).remove(agent);
            if let Some(consumer) = consumer {
                self.stop_consumer(Some(&session), consumer).await;
            }
            self.channel_failed(&session, &err).await;
            return Err(err);
        }

        info!(agent = agent.as_str(), "subscribed");
        Ok(())
    }

    async fn start_consumer(
        self: &Arc<Self>,
        session: &Session,
        config: &MessageBusConfig,
        agent: AgentType,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), BusError> {
        let queue = topology::install_agent_queue(session.channel.clone(), config, agent).await?;
        let tag = consumer_tag(&queue);

        let stale = lock(&self.registry).detach(agent);
        if let Some(stale) = stale {
            self.stop_consumer(Some(session), stale).await;
        }

        let stream = session.channel.consume(&queue, &tag).await?;
        let task = spawn_consumer(
            stream,
            agent,
            queue.clone(),
            handler,
            Arc::downgrade(self),
            RetryPolicy::new(config.max_retries, config.retry_base_delay),
        );

        let consumer = ActiveConsumer::new(tag, session.generation, task);
        let replaced = lock(&self.registry).attach(agent, consumer);
        if let Some(replaced) = replaced {
            self.stop_consumer(Some(session), replaced).await;
        }

        debug!(agent = agent.as_str(), queue = queue.as_str(), "consumer started");
        Ok(())
    }

    /// Cancels the consumer at the broker when it belongs to `session`, then
    /// stops its task.
    async fn stop_consumer(&self, session: Option<&Session>, consumer: ActiveConsumer) {
        if let Some(session) = session.filter(|s| s.generation == consumer.generation) {
            if let Err(err) = session.channel.cancel(&consumer.tag).await {
                debug!(
                    error = err.to_string(),
                    tag = consumer.tag.as_str(),
                    "error cancelling consumer"
                );
            }
        }
        consumer.stop();
    }

    async fn create_dead_letter_exchange(self: &Arc<Self>) -> Result<(), BusError> {
        let (Some(session), Some(config)) = (self.session(), self.config()) else {
            return Err(BusError::NotConnected);
        };

        if let Err(err) = topology::install_dead_letter(session.channel.clone(), &config).await {
            self.channel_failed(&session, &err).await;
            return Err(err);
        }
        self.dead_letter.store(true, Ordering::SeqCst);

        info!(
            exchange = config.dead_letter_exchange().as_str(),
            queue = config.dead_letter_queue().as_str(),
            "dead letter exchange declared"
        );
        Ok(())
    }

    /// Republishes a failed message to its queue after `delay`, on the trace of
    /// `ctx`. While the bus is disconnected the republish waits for the
    /// connection to come back.
    pub(crate) fn schedule_retry(
        self: &Arc<Self>,
        ctx: Context,
        queue: String,
        message: AgentMessage,
        delay: Duration,
    ) {
        let bus = Arc::downgrade(self);
        self.retries.schedule(delay, async move {
            loop {
                let Some(inner) = bus.upgrade() else {
                    return;
                };
                let Some(wait) = inner.republish(&ctx, &queue, &message).await else {
                    return;
                };
                drop(inner);
                tokio::time::sleep(wait).await;
            }
        });
    }

    /// Returns how long to wait before trying again, or `None` once done.
    async fn republish(
        self: &Arc<Self>,
        ctx: &Context,
        queue: &str,
        message: &AgentMessage,
    ) -> Option<Duration> {
        let Some(config) = self.config() else {
            warn!(message_id = message.id.as_str(), "bus disconnected, retry dropped");
            return None;
        };
        let Some(session) = self.session() else {
            debug!(message_id = message.id.as_str(), "not connected, retry deferred");
            return Some(config.reconnect_delay);
        };

        match AgentPublisher::new(session.channel.clone(), &session.exchange)
            .republish(ctx, queue, message)
            .await
        {
            Ok(()) => None,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    message_id = message.id.as_str(),
                    "error republishing msg, retry deferred"
                );
                self.channel_failed(&session, &err).await;
                Some(config.reconnect_delay)
            }
        }
    }

    async fn disconnect(&self) {
        self.supervisor.shutdown();
        let _ops = self.ops.lock().await;

        let cancelled = self.retries.cancel_all();
        let consumers = lock(&self.registry).clear();
        write(&self.config, None);
        self.dead_letter.store(false, Ordering::SeqCst);
        let session = write(&self.session, None);

        for consumer in consumers {
            self.stop_consumer(session.as_ref(), consumer).await;
        }
        if let Some(session) = session {
            close(&session).await;
        }

        info!(cancelled_retries = cancelled, "disconnected from broker");
    }

    /// Drops the session of `generation` if it is still the current one.
    async fn drop_session(&self, generation: u64) -> bool {
        let session = {
            let mut current = self
                .session
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match current.as_ref() {
                Some(s) if s.generation == generation => current.take(),
                _ => None,
            }
        };

        let Some(session) = session else {
            return false;
        };
        close(&session).await;
        true
    }

    /// Drops the current session, used when a disconnect raced a reconnect.
    pub(crate) async fn close_session(&self) {
        if let Some(session) = write(&self.session, None) {
            close(&session).await;
        }
    }
}

async fn close(session: &Session) {
    if let Err(err) = session.channel.close().await {
        debug!(error = err.to_string(), "error closing channel");
    }
    if let Err(err) = session.connection.close().await {
        debug!(error = err.to_string(), "error closing connection");
    }
}
