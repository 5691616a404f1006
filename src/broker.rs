// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The bus only needs a small slice of AMQP: dial a connection, open a channel,
//! declare and bind topology, publish, and consume with manual
//! acknowledgement. These traits describe that slice so the bus can run against
//! RabbitMQ (see [`crate::amqp`]) or the in-process broker in
//! [`crate::memory`].

use crate::{
    errors::BusError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::{fmt, sync::Arc};

/// Listener invoked when a live connection fails.
pub type ErrorCallback = Box<dyn FnMut(BusError) + Send + 'static>;

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BusError>>;

/// Dials broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, BusError>;
}

/// An established broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError>;

    /// Registers a listener fired when the connection fails after it was
    /// established. Graceful closes do not fire it.
    fn on_error(&self, callback: ErrorCallback);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), BusError>;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BusError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BusError>;

    /// Caps the unacknowledged deliveries each consumer of this channel holds.
    async fn qos(&self, prefetch_count: u16) -> Result<(), BusError>;

    /// Publishes a message. An empty exchange routes by queue name.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError>;

    /// Starts a manual-ack consumer on the queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BusError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError>;

    /// False once the channel was closed, by us or by a broker exception.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BusError>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;

    async fn reject(&self, requeue: bool) -> Result<(), BusError>;
}

/// A message handed to a consumer, settled through its acknowledger.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        exchange: String,
        routing_key: String,
        redelivered: bool,
        data: Vec<u8>,
        properties: BasicProperties,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            exchange,
            routing_key,
            redelivered,
            data,
            properties,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.data.len())
            .finish()
    }
}
